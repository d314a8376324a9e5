//! Authoritative record of one published service.

use chrono::{DateTime, Duration, Utc};

use crate::ids::{ClientId, ServiceId};
use crate::props::Props;

/// One service's authoritative state within a domain.
///
/// The generation is a client-driven monotonic counter: a republish is
/// accepted only with a strictly greater generation, which is what makes
/// re-adoption after a reconnect unambiguous. `orphan_since` is set while
/// the owning session is gone and the TTL clock is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Domain-unique identifier.
    pub id: ServiceId,
    /// Monotonically non-decreasing per-id counter.
    pub generation: u32,
    /// The published property bag.
    pub props: Props,
    /// Seconds the record survives as an orphan.
    pub ttl: u64,
    /// Session currently owning the record.
    pub owner: ClientId,
    /// User identity the record's resource charge is booked under.
    pub owner_user: String,
    /// When the owning session departed, while unadopted.
    pub orphan_since: Option<DateTime<Utc>>,
}

impl Service {
    /// Returns `true` while the owning session is gone.
    #[must_use]
    pub const fn is_orphan(&self) -> bool {
        self.orphan_since.is_some()
    }

    /// The instant the orphan TTL elapses, while orphaned.
    #[must_use]
    pub fn orphan_deadline(&self) -> Option<DateTime<Utc>> {
        self.orphan_since
            .map(|since| since + Duration::seconds(i64::try_from(self.ttl).unwrap_or(i64::MAX)))
    }

    /// Snapshot for notifications and listings.
    #[must_use]
    pub fn view(&self) -> ServiceView {
        ServiceView {
            id: self.id,
            generation: self.generation,
            props: self.props.clone(),
            ttl: self.ttl,
            owner: self.owner,
            orphan_since: self.orphan_since,
        }
    }

    /// Returns `true` when a republish carries exactly the stored
    /// content. Used to tell an idempotent retry from a conflicting
    /// publish at the same generation.
    #[must_use]
    pub fn same_content(&self, generation: u32, props: &Props, ttl: u64) -> bool {
        self.generation == generation && self.props == *props && self.ttl == ttl
    }
}

/// Immutable snapshot of a service, as carried by notifications and the
/// `services` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceView {
    /// Domain-unique identifier.
    pub id: ServiceId,
    /// Generation at snapshot time.
    pub generation: u32,
    /// Property bag at snapshot time.
    pub props: Props,
    /// Configured TTL in seconds.
    pub ttl: u64,
    /// Owning session.
    pub owner: ClientId,
    /// Orphan timestamp, when orphaned at snapshot time.
    pub orphan_since: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Service {
        let mut props = Props::new();
        props.add("name", "echo");
        Service {
            id: ServiceId(0x4711),
            generation: 3,
            props,
            ttl: 60,
            owner: ClientId(1),
            owner_user: "10.0.0.1".to_owned(),
            orphan_since: None,
        }
    }

    #[test]
    fn orphan_deadline_is_since_plus_ttl() {
        let mut svc = service();
        assert_eq!(svc.orphan_deadline(), None);

        let since = Utc::now();
        svc.orphan_since = Some(since);
        assert_eq!(svc.orphan_deadline(), Some(since + Duration::seconds(60)));
    }

    #[test]
    fn same_content_compares_generation_props_and_ttl() {
        let svc = service();
        assert!(svc.same_content(3, &svc.props.clone(), 60));
        assert!(!svc.same_content(4, &svc.props.clone(), 60));
        assert!(!svc.same_content(3, &svc.props.clone(), 61));

        let mut other = svc.props.clone();
        other.add("color", "green");
        assert!(!svc.same_content(3, &other, 60));
    }
}
