//! The domain state machine.
//!
//! A [`Domain`] aggregates one namespace: the ordered service catalogue,
//! the registered subscriptions with their match caches, the live-client
//! table, a reverse index from owning client to service ids, and a
//! min-heap of orphan deadlines. Commands are synchronous: each mutates
//! the domain and returns its own result together with the notifications
//! owed to subscribers, which the caller routes onto per-session queues.
//!
//! # Orphans
//!
//! When a session departs, its services are not deleted; they are marked
//! orphaned and a deadline of `departure + ttl` is armed. Subscribers are
//! not told. Either a later session republishes the id with a strictly
//! greater generation (re-adoption: the orphan mark is cleared and
//! matching subscribers see a single `modified`), or the deadline fires
//! and the record is destroyed with ordinary `disappeared`
//! notifications. A network blip therefore never churns observers.
//!
//! # Invariants
//!
//! - Stored generations never decrease.
//! - A subscription's match cache holds exactly the services whose last
//!   notification to it was `appeared` or `modified`.
//! - Every command that fails leaves the domain untouched.
//! - Resource tallies satisfy `total == sum over users` at all times.

mod error;


use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

pub use self::error::DomainError;
use crate::filter::{Filter, FilterError};
use crate::ids::{ClientId, ServiceId, SubscriptionId};
use crate::props::Props;
use crate::resources::{Resource, ResourceLedger, ResourceLimits};
use crate::service::{Service, ServiceView};
use crate::subscription::{Subscription, SubscriptionView};

/// Default cap on compiled nodes in one subscription filter.
pub const DEFAULT_MAX_FILTER_NODES: usize = 128;

/// Policy for a republish that repeats the stored generation with
/// different content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SameGenerationPolicy {
    /// Reject with a dedicated error. The safe default: two writers
    /// disagreeing about one generation is a client bug worth surfacing.
    #[default]
    Reject,
    /// Treat like any stale generation and ignore silently.
    Idempotent,
}

/// Tunables of one domain.
#[derive(Debug, Clone, Default)]
pub struct DomainConfig {
    /// Per-user resource limits.
    pub user_limits: ResourceLimits,
    /// Domain-total resource limits.
    pub total_limits: ResourceLimits,
    /// Per-subscription filter complexity cap. Zero means
    /// [`DEFAULT_MAX_FILTER_NODES`].
    pub max_filter_nodes: usize,
    /// Equal-generation conflict policy.
    pub same_generation_policy: SameGenerationPolicy,
}

impl DomainConfig {
    fn max_filter_nodes(&self) -> usize {
        if self.max_filter_nodes == 0 {
            DEFAULT_MAX_FILTER_NODES
        } else {
            self.max_filter_nodes
        }
    }
}

/// Kind of a subscription notification.
///
/// Serialized in kebab-case as the wire `match-type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchType {
    /// The service matches and did not before.
    Appeared,
    /// The service matched before and still does, with new content.
    Modified,
    /// The service matched before and no longer does (or was removed).
    Disappeared,
}

impl std::fmt::Display for MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Appeared => f.write_str("appeared"),
            Self::Modified => f.write_str("modified"),
            Self::Disappeared => f.write_str("disappeared"),
        }
    }
}

/// One notification owed to a subscriber, produced by a command.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Session to deliver to.
    pub client_id: ClientId,
    /// Subscription the event belongs to (the routing key).
    pub subscription_id: SubscriptionId,
    /// Visibility change.
    pub match_type: MatchType,
    /// The service the change is about.
    pub service_id: ServiceId,
    /// Snapshot of the service; `None` for `disappeared`.
    pub service: Option<ServiceView>,
}

/// Row of the `clients` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientView {
    /// Session id.
    pub id: ClientId,
    /// Remote address string.
    pub addr: String,
    /// User identity the session's charges are booked under.
    pub user: String,
    /// Connect timestamp.
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ClientRecord {
    user: String,
    addr: String,
    connected_at: DateTime<Utc>,
}

/// Heap entry for one armed orphan deadline.
///
/// Entries are never removed eagerly; re-adoption leaves a stale entry
/// behind which is skipped when it surfaces (it no longer agrees with
/// the service's current `orphan_deadline`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrphanDeadline {
    deadline: DateTime<Utc>,
    service_id: ServiceId,
}

/// The aggregate state of one discovery namespace.
#[derive(Debug)]
pub struct Domain {
    config: DomainConfig,
    ledger: ResourceLedger,
    services: BTreeMap<ServiceId, Service>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    clients: BTreeMap<ClientId, ClientRecord>,
    /// Reverse index: live client -> ids of the services it owns.
    owned: HashMap<ClientId, BTreeSet<ServiceId>>,
    deadlines: BinaryHeap<Reverse<OrphanDeadline>>,
    next_client_id: u64,
}

impl Domain {
    /// Creates an empty domain with the given configuration.
    #[must_use]
    pub fn new(config: DomainConfig) -> Self {
        let ledger = ResourceLedger::new(config.user_limits, config.total_limits);
        Self {
            config,
            ledger,
            services: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            clients: BTreeMap::new(),
            owned: HashMap::new(),
            deadlines: BinaryHeap::new(),
            next_client_id: 1,
        }
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Admits a client session.
    ///
    /// Charges the `clients` resource for `user`. A reconnecting client
    /// may propose the id of its previous session so a later republish
    /// re-adopts the services that session left behind; a proposed id
    /// held by a live session is refused.
    ///
    /// # Errors
    ///
    /// [`DomainError::ClientIdExists`] or a resource denial; neither
    /// mutates the domain.
    pub fn connect_client(
        &mut self,
        proposed: Option<ClientId>,
        user: &str,
        addr: &str,
        now: DateTime<Utc>,
    ) -> Result<ClientId, DomainError> {
        if let Some(id) = proposed {
            if self.clients.contains_key(&id) {
                return Err(DomainError::ClientIdExists(id));
            }
        }
        self.ledger.charge(user, Resource::Clients, 1)?;

        let id = proposed.unwrap_or_else(|| self.allocate_client_id());
        self.clients.insert(
            id,
            ClientRecord {
                user: user.to_owned(),
                addr: addr.to_owned(),
                connected_at: now,
            },
        );
        info!(client = %id, %user, %addr, "client connected");
        Ok(id)
    }

    fn allocate_client_id(&mut self) -> ClientId {
        loop {
            let id = ClientId(self.next_client_id);
            self.next_client_id = self.next_client_id.wrapping_add(1).max(1);
            if !self.clients.contains_key(&id) {
                return id;
            }
        }
    }

    /// Removes a departed session: its subscriptions are dropped (no
    /// notifications), its services become orphans with deadlines armed
    /// at `now + ttl`, and its charges are released. Unknown ids are a
    /// no-op.
    pub fn disconnect_client(&mut self, client_id: ClientId, now: DateTime<Utc>) {
        let Some(record) = self.clients.remove(&client_id) else {
            return;
        };

        let sub_ids: Vec<SubscriptionId> = self
            .subscriptions
            .values()
            .filter(|s| s.owner == client_id)
            .map(|s| s.id)
            .collect();
        for sub_id in sub_ids {
            let sub = self.subscriptions.remove(&sub_id).expect("listed above");
            self.ledger
                .release(&record.user, Resource::Subscriptions, 1);
            self.ledger
                .release(&record.user, Resource::FilterNodes, sub.filter_nodes());
        }

        for service_id in self.owned.remove(&client_id).unwrap_or_default() {
            let service = self
                .services
                .get_mut(&service_id)
                .expect("owned index entry without service");
            service.orphan_since = Some(now);
            let deadline = service
                .orphan_deadline()
                .expect("orphan_since was just set");
            self.deadlines.push(Reverse(OrphanDeadline {
                deadline,
                service_id,
            }));
            debug!(service = %service_id, %deadline, "service orphaned");
        }

        self.ledger.release(&record.user, Resource::Clients, 1);
        info!(client = %client_id, user = %record.user, "client disconnected");
    }

    // ------------------------------------------------------------------
    // Publication
    // ------------------------------------------------------------------

    /// Publishes or republishes a service.
    ///
    /// A new id charges the `services` resource for the caller's user.
    /// A republish charges nothing and is accepted only with a strictly
    /// greater generation; re-adopting an orphan additionally moves the
    /// standing charge to the caller's user. Returns the notifications
    /// owed to subscribers.
    ///
    /// # Errors
    ///
    /// Generation conflicts, ownership denial for a live-owned service,
    /// or a resource denial. Failures do not mutate the domain and
    /// produce no notifications.
    pub fn publish(
        &mut self,
        client_id: ClientId,
        service_id: ServiceId,
        generation: u32,
        props: Props,
        ttl: u64,
    ) -> Result<Vec<Notification>, DomainError> {
        let user = self
            .clients
            .get(&client_id)
            .ok_or(DomainError::UnknownClient(client_id))?
            .user
            .clone();

        if let Some(existing) = self.services.get(&service_id).cloned() {
            self.republish(client_id, &user, service_id, generation, props, ttl, existing)
        } else {
            self.ledger.charge(&user, Resource::Services, 1)?;
            let service = Service {
                id: service_id,
                generation,
                props,
                ttl,
                owner: client_id,
                owner_user: user,
                orphan_since: None,
            };
            let view = service.view();
            self.services.insert(service_id, service);
            self.owned.entry(client_id).or_default().insert(service_id);
            debug!(service = %service_id, generation, client = %client_id, "service published");

            let mut notifications = Vec::new();
            for sub in self.subscriptions.values_mut() {
                if sub.matches_props(&view.props) {
                    sub.matches.insert(service_id);
                    notifications.push(Notification {
                        client_id: sub.owner,
                        subscription_id: sub.id,
                        match_type: MatchType::Appeared,
                        service_id,
                        service: Some(view.clone()),
                    });
                }
            }
            Ok(notifications)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn republish(
        &mut self,
        client_id: ClientId,
        user: &str,
        service_id: ServiceId,
        generation: u32,
        props: Props,
        ttl: u64,
        existing: Service,
    ) -> Result<Vec<Notification>, DomainError> {
        // A live owner is exclusive; an orphan may be adopted by anyone
        // able to outbid its generation.
        if !existing.is_orphan() && existing.owner != client_id {
            return Err(DomainError::PermissionDenied { client: client_id });
        }

        if generation <= existing.generation {
            if generation == existing.generation
                && !existing.same_content(generation, &props, ttl)
                && self.config.same_generation_policy == SameGenerationPolicy::Reject
            {
                return Err(DomainError::SameGenerationButDifferent {
                    service: service_id,
                    generation,
                });
            }
            return Err(DomainError::OldGeneration {
                service: service_id,
                stored: existing.generation,
                requested: generation,
            });
        }

        if existing.is_orphan() {
            self.ledger
                .transfer(&existing.owner_user, user, Resource::Services, 1)?;
            info!(service = %service_id, client = %client_id, "orphan re-adopted");
        }

        let service = self.services.get_mut(&service_id).expect("checked above");
        service.generation = generation;
        service.props = props;
        service.ttl = ttl;
        service.owner = client_id;
        service.owner_user = user.to_owned();
        // Clearing the orphan mark disarms the deadline; the heap entry
        // goes stale and is skipped when it surfaces.
        service.orphan_since = None;
        let view = service.view();
        self.owned.entry(client_id).or_default().insert(service_id);
        debug!(service = %service_id, generation, client = %client_id, "service republished");

        let mut notifications = Vec::new();
        for sub in self.subscriptions.values_mut() {
            let was_matching = sub.matches.contains(&service_id);
            let now_matching = sub.matches_props(&view.props);
            let match_type = match (was_matching, now_matching) {
                (true, true) => MatchType::Modified,
                (false, true) => {
                    sub.matches.insert(service_id);
                    MatchType::Appeared
                },
                (true, false) => {
                    sub.matches.remove(&service_id);
                    MatchType::Disappeared
                },
                (false, false) => continue,
            };
            notifications.push(Notification {
                client_id: sub.owner,
                subscription_id: sub.id,
                match_type,
                service_id,
                service: (match_type != MatchType::Disappeared).then(|| view.clone()),
            });
        }
        Ok(notifications)
    }

    /// Removes a service owned by the caller. Returns the `disappeared`
    /// notifications owed to subscribers that were matching it.
    ///
    /// # Errors
    ///
    /// [`DomainError::NonExistentService`] or
    /// [`DomainError::PermissionDenied`]; neither mutates the domain.
    pub fn unpublish(
        &mut self,
        client_id: ClientId,
        service_id: ServiceId,
    ) -> Result<Vec<Notification>, DomainError> {
        if !self.clients.contains_key(&client_id) {
            return Err(DomainError::UnknownClient(client_id));
        }
        let service = self
            .services
            .get(&service_id)
            .ok_or(DomainError::NonExistentService(service_id))?;
        if service.owner != client_id {
            return Err(DomainError::PermissionDenied { client: client_id });
        }

        let service = self.services.remove(&service_id).expect("checked above");
        self.ledger
            .release(&service.owner_user, Resource::Services, 1);
        if let Some(owned) = self.owned.get_mut(&client_id) {
            owned.remove(&service_id);
        }
        debug!(service = %service_id, client = %client_id, "service unpublished");
        Ok(self.drop_from_caches(service_id))
    }

    /// Emits `disappeared` for every subscription caching `service_id`
    /// and clears it from the caches.
    fn drop_from_caches(&mut self, service_id: ServiceId) -> Vec<Notification> {
        let mut notifications = Vec::new();
        for sub in self.subscriptions.values_mut() {
            if sub.matches.remove(&service_id) {
                notifications.push(Notification {
                    client_id: sub.owner,
                    subscription_id: sub.id,
                    match_type: MatchType::Disappeared,
                    service_id,
                    service: None,
                });
            }
        }
        notifications
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Registers a subscription and primes its match cache.
    ///
    /// Charges one subscription plus the compiled node count against the
    /// caller's user. Returns the snapshot of currently-matching services
    /// so the session can report them as `appeared` before acknowledging.
    ///
    /// # Errors
    ///
    /// Duplicate id, filter syntax error, complexity cap, or resource
    /// denial; failures do not register anything.
    pub fn subscribe(
        &mut self,
        client_id: ClientId,
        subscription_id: SubscriptionId,
        filter_text: Option<&str>,
    ) -> Result<Vec<ServiceView>, DomainError> {
        let user = self
            .clients
            .get(&client_id)
            .ok_or(DomainError::UnknownClient(client_id))?
            .user
            .clone();
        if self.subscriptions.contains_key(&subscription_id) {
            return Err(DomainError::SubscriptionIdExists(subscription_id));
        }

        let filter = filter_text.map(Filter::parse).transpose()?;
        if let Some(filter) = &filter {
            let nodes = filter.node_count();
            let max = self.config.max_filter_nodes();
            if nodes > max {
                return Err(FilterError::TooComplex { nodes, max }.into());
            }
        }

        let mut sub = Subscription {
            id: subscription_id,
            owner: client_id,
            filter,
            filter_text: filter_text.map(str::to_owned),
            matches: BTreeSet::new(),
        };
        self.ledger.charge_all(
            &user,
            &[
                (Resource::Subscriptions, 1),
                (Resource::FilterNodes, sub.filter_nodes()),
            ],
        )?;

        let mut initial = Vec::new();
        for service in self.services.values() {
            if sub.matches_props(&service.props) {
                sub.matches.insert(service.id);
                initial.push(service.view());
            }
        }
        debug!(
            subscription = %subscription_id,
            client = %client_id,
            matches = initial.len(),
            "subscription registered"
        );
        self.subscriptions.insert(subscription_id, sub);
        Ok(initial)
    }

    /// Drops a subscription owned by the caller. No notifications are
    /// produced; the cancelled subscriber is not told about the services
    /// it will no longer see.
    ///
    /// # Errors
    ///
    /// [`DomainError::NonExistentSubscription`] or
    /// [`DomainError::PermissionDenied`].
    pub fn unsubscribe(
        &mut self,
        client_id: ClientId,
        subscription_id: SubscriptionId,
    ) -> Result<(), DomainError> {
        let user = self
            .clients
            .get(&client_id)
            .ok_or(DomainError::UnknownClient(client_id))?
            .user
            .clone();
        let sub = self
            .subscriptions
            .get(&subscription_id)
            .ok_or(DomainError::NonExistentSubscription(subscription_id))?;
        if sub.owner != client_id {
            return Err(DomainError::PermissionDenied { client: client_id });
        }

        let sub = self
            .subscriptions
            .remove(&subscription_id)
            .expect("checked above");
        self.ledger.release(&user, Resource::Subscriptions, 1);
        self.ledger
            .release(&user, Resource::FilterNodes, sub.filter_nodes());
        debug!(subscription = %subscription_id, client = %client_id, "subscription dropped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Snapshot of the catalogue, optionally filtered.
    ///
    /// # Errors
    ///
    /// [`FilterError::Syntax`] via [`DomainError::Filter`] when a filter
    /// is given and does not compile.
    pub fn services(&self, filter_text: Option<&str>) -> Result<Vec<ServiceView>, DomainError> {
        let filter = filter_text.map(Filter::parse).transpose()?;
        Ok(self
            .services
            .values()
            .filter(|s| filter.as_ref().map_or(true, |f| f.matches(&s.props)))
            .map(Service::view)
            .collect())
    }

    /// Snapshot of the registered subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionView> {
        self.subscriptions.values().map(Subscription::view).collect()
    }

    /// Snapshot of the live sessions.
    #[must_use]
    pub fn clients(&self) -> Vec<ClientView> {
        self.clients
            .iter()
            .map(|(id, record)| ClientView {
                id: *id,
                addr: record.addr.clone(),
                user: record.user.clone(),
                connected_at: record.connected_at,
            })
            .collect()
    }

    /// The resource ledger, for admission inspection and tests.
    #[must_use]
    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Looks up a service record.
    #[must_use]
    pub fn service(&self, id: ServiceId) -> Option<&Service> {
        self.services.get(&id)
    }

    // ------------------------------------------------------------------
    // Orphan timers
    // ------------------------------------------------------------------

    /// The earliest armed orphan deadline, discarding stale entries.
    ///
    /// `None` while no service is orphaned.
    pub fn next_orphan_deadline(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse(entry)) = self.deadlines.peek().copied() {
            if self.deadline_is_live(entry) {
                return Some(entry.deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    fn deadline_is_live(&self, entry: OrphanDeadline) -> bool {
        self.services
            .get(&entry.service_id)
            .and_then(Service::orphan_deadline)
            == Some(entry.deadline)
    }

    /// Destroys every orphan whose TTL has elapsed at `now` and returns
    /// the `disappeared` notifications owed for them. Fires each orphan
    /// at most once; re-adopted services are skipped via their stale
    /// heap entries.
    pub fn timeout_orphans(&mut self, now: DateTime<Utc>) -> Vec<Notification> {
        let mut notifications = Vec::new();
        while let Some(Reverse(entry)) = self.deadlines.peek().copied() {
            if !self.deadline_is_live(entry) {
                self.deadlines.pop();
                continue;
            }
            if entry.deadline > now {
                break;
            }
            self.deadlines.pop();

            let service = self
                .services
                .remove(&entry.service_id)
                .expect("live deadline entry");
            self.ledger
                .release(&service.owner_user, Resource::Services, 1);
            if let Some(owned) = self.owned.get_mut(&service.owner) {
                owned.remove(&service.id);
            }
            info!(service = %service.id, "orphan timed out");
            notifications.extend(self.drop_from_caches(entry.service_id));
        }
        notifications
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::new(DomainConfig::default())
    }
}
