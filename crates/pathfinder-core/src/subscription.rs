//! One registered subscription and its match cache.

use std::collections::BTreeSet;

use crate::filter::Filter;
use crate::ids::{ClientId, ServiceId, SubscriptionId};
use crate::props::Props;

/// A subscription: an optional compiled filter owned by one session, plus
/// the set of services it currently matches.
///
/// The match cache is what turns a publish into a differential: a service
/// moving into the set is an `appeared`, staying in it a `modified`,
/// leaving it a `disappeared`. A subscription with no filter matches
/// every service.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Domain-unique, client-chosen identifier.
    pub id: SubscriptionId,
    /// Owning session.
    pub owner: ClientId,
    /// Compiled predicate; `None` matches everything.
    pub filter: Option<Filter>,
    /// The source text the filter was compiled from, for listings.
    pub filter_text: Option<String>,
    /// Services currently matching, by id.
    pub matches: BTreeSet<ServiceId>,
}

impl Subscription {
    /// Charge of this subscription against the `subscription_filter_nodes`
    /// resource.
    #[must_use]
    pub fn filter_nodes(&self) -> u64 {
        self.filter
            .as_ref()
            .map_or(0, |f| f.node_count() as u64)
    }

    /// Evaluates the predicate against a property bag.
    #[must_use]
    pub fn matches_props(&self, props: &Props) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(props))
    }

    /// Snapshot row for the `subscriptions` listing.
    #[must_use]
    pub fn view(&self) -> SubscriptionView {
        SubscriptionView {
            id: self.id,
            owner: self.owner,
            filter_text: self.filter_text.clone(),
        }
    }
}

/// Immutable snapshot of a subscription for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionView {
    /// Subscription identifier.
    pub id: SubscriptionId,
    /// Owning session.
    pub owner: ClientId,
    /// Source filter text, when a filter is set.
    pub filter_text: Option<String>,
}
