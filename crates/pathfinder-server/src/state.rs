//! Shared per-domain runtime state.
//!
//! A [`DomainHandle`] ties one domain kernel to the live sessions serving
//! it: the catalogue itself, a sender per connected client for routing
//! notifications, and the timer doorbell that re-arms the orphan-expiry
//! task whenever deadlines may have moved.
//!
//! Every command locks the handle, runs one synchronous kernel call, and
//! routes the returned notification batch before unlocking. The lock is
//! never held across a suspension point, so commands are atomic with
//! respect to each other and sessions observe a serializable history.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use pathfinder_core::domain::ClientView;
use pathfinder_core::{
    ClientId, Domain, DomainError, Notification, Props, ServiceId, ServiceView, SubscriptionId,
    SubscriptionView,
};
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

/// Shared handle to one domain.
pub type SharedDomain = Arc<DomainHandle>;

/// Event routed onto a session's outbound queue.
#[derive(Debug)]
pub enum SessionEvent {
    /// A subscription notification produced by another session's command
    /// (or by an orphan timeout).
    Notify(Notification),
}

struct Shared {
    domain: Domain,
    senders: HashMap<ClientId, UnboundedSender<SessionEvent>>,
}

/// One domain plus its session routing table.
pub struct DomainHandle {
    name: String,
    shared: Mutex<Shared>,
    timer: Notify,
}

impl DomainHandle {
    /// Wraps a domain kernel for serving.
    #[must_use]
    pub fn new(name: impl Into<String>, domain: Domain) -> Self {
        Self {
            name: name.into(),
            shared: Mutex::new(Shared {
                domain,
                senders: HashMap::new(),
            }),
            timer: Notify::new(),
        }
    }

    /// The domain's configured name, for logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Doorbell for the orphan-expiry task; rung whenever deadlines may
    /// have changed.
    #[must_use]
    pub fn timer(&self) -> &Notify {
        &self.timer
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("domain state poisoned")
    }

    /// Admits a session and registers its outbound queue.
    pub fn connect(
        &self,
        proposed: Option<ClientId>,
        user: &str,
        addr: &str,
        now: DateTime<Utc>,
        sender: UnboundedSender<SessionEvent>,
    ) -> Result<ClientId, DomainError> {
        let mut shared = self.lock();
        let client_id = shared.domain.connect_client(proposed, user, addr, now)?;
        shared.senders.insert(client_id, sender);
        Ok(client_id)
    }

    /// Removes a departed session, orphaning its services, and rings the
    /// timer for the newly armed deadlines.
    pub fn disconnect(&self, client_id: ClientId, now: DateTime<Utc>) {
        {
            let mut shared = self.lock();
            shared.domain.disconnect_client(client_id, now);
            shared.senders.remove(&client_id);
        }
        self.timer.notify_one();
    }

    /// Publishes a service and routes the resulting notifications.
    pub fn publish(
        &self,
        client_id: ClientId,
        service_id: ServiceId,
        generation: u32,
        props: Props,
        ttl: u64,
    ) -> Result<(), DomainError> {
        {
            let shared = &mut *self.lock();
            let notifications =
                shared
                    .domain
                    .publish(client_id, service_id, generation, props, ttl)?;
            route(&shared.senders, notifications);
        }
        // A re-adoption disarms a deadline; waking the timer task to
        // recompute is cheaper than tracking whether one did.
        self.timer.notify_one();
        Ok(())
    }

    /// Unpublishes a service and routes the `disappeared` notifications.
    pub fn unpublish(
        &self,
        client_id: ClientId,
        service_id: ServiceId,
    ) -> Result<(), DomainError> {
        let shared = &mut *self.lock();
        let notifications = shared.domain.unpublish(client_id, service_id)?;
        route(&shared.senders, notifications);
        Ok(())
    }

    /// Registers a subscription; returns the initial matches for the
    /// session to report before its `accept`.
    pub fn subscribe(
        &self,
        client_id: ClientId,
        subscription_id: SubscriptionId,
        filter: Option<&str>,
    ) -> Result<Vec<ServiceView>, DomainError> {
        self.lock()
            .domain
            .subscribe(client_id, subscription_id, filter)
    }

    /// Drops a subscription.
    pub fn unsubscribe(
        &self,
        client_id: ClientId,
        subscription_id: SubscriptionId,
    ) -> Result<(), DomainError> {
        self.lock().domain.unsubscribe(client_id, subscription_id)
    }

    /// Snapshot of the catalogue, optionally filtered.
    pub fn services(&self, filter: Option<&str>) -> Result<Vec<ServiceView>, DomainError> {
        self.lock().domain.services(filter)
    }

    /// Snapshot of the registered subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionView> {
        self.lock().domain.subscriptions()
    }

    /// Snapshot of the live sessions.
    #[must_use]
    pub fn clients(&self) -> Vec<ClientView> {
        self.lock().domain.clients()
    }

    /// Earliest orphan deadline, for the expiry task.
    #[must_use]
    pub fn next_orphan_deadline(&self) -> Option<DateTime<Utc>> {
        self.lock().domain.next_orphan_deadline()
    }

    /// Destroys expired orphans and routes their `disappeared`
    /// notifications.
    pub fn timeout_orphans(&self, now: DateTime<Utc>) {
        let shared = &mut *self.lock();
        let notifications = shared.domain.timeout_orphans(now);
        route(&shared.senders, notifications);
    }
}

/// Delivers a notification batch onto the owning sessions' queues. A
/// session that raced away is skipped; its queue died with it.
fn route(
    senders: &HashMap<ClientId, UnboundedSender<SessionEvent>>,
    notifications: Vec<Notification>,
) {
    for notification in notifications {
        let Some(sender) = senders.get(&notification.client_id) else {
            trace!(client = %notification.client_id, "dropping notification for departed session");
            continue;
        };
        let _ = sender.send(SessionEvent::Notify(notification));
    }
}
