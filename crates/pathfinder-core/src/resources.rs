//! Two-scope resource accounting.
//!
//! Four resources are countable: connected clients, published services,
//! registered subscriptions, and compiled filter nodes. Each is tracked in
//! two dimensions: the domain total and per transport-supplied user
//! identity. Every admission charges both dimensions atomically; if either
//! scope is at its limit the whole charge is rolled back and the caller
//! reports `insufficient-resources` (or refuses the connection, for
//! clients).
//!
//! The ledger maintains `total == sum of per-user tallies` for every
//! resource at all times; releases are exact inverses of charges.

use std::collections::HashMap;

use thiserror::Error;

/// A countable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Connected client sessions.
    Clients,
    /// Published services.
    Services,
    /// Registered subscriptions.
    Subscriptions,
    /// Compiled filter nodes across all subscriptions.
    FilterNodes,
}

impl Resource {
    /// All resources, in charge order.
    pub const ALL: [Self; 4] = [
        Self::Clients,
        Self::Services,
        Self::Subscriptions,
        Self::FilterNodes,
    ];

    /// Stable lowercase name used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Clients => "clients",
            Self::Services => "services",
            Self::Subscriptions => "subscriptions",
            Self::FilterNodes => "subscription-filter-nodes",
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The scope a denial happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The per-user tally for one user identity.
    User,
    /// The domain-wide tally.
    Total,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str("per-user"),
            Self::Total => f.write_str("total"),
        }
    }
}

/// Error charging a resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// The charge would push a tally past its limit.
    #[error("{scope} {resource} limit exhausted: {used} used of {limit}, {requested} requested")]
    Exhausted {
        /// Which resource was denied.
        resource: Resource,
        /// Which scope denied it.
        scope: Scope,
        /// Tally at the time of denial.
        used: u64,
        /// The configured limit.
        limit: u64,
        /// Amount the caller asked for.
        requested: u64,
    },
}

impl ResourceError {
    /// Which resource was denied.
    #[must_use]
    pub const fn resource(&self) -> Resource {
        match self {
            Self::Exhausted { resource, .. } => *resource,
        }
    }
}

/// Optional per-resource limits for one scope. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Limit on connected clients.
    pub clients: Option<u64>,
    /// Limit on published services.
    pub services: Option<u64>,
    /// Limit on registered subscriptions.
    pub subscriptions: Option<u64>,
    /// Limit on total compiled filter nodes.
    pub filter_nodes: Option<u64>,
}

impl ResourceLimits {
    /// A scope with no limits at all.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            clients: None,
            services: None,
            subscriptions: None,
            filter_nodes: None,
        }
    }

    const fn limit(&self, resource: Resource) -> Option<u64> {
        match resource {
            Resource::Clients => self.clients,
            Resource::Services => self.services,
            Resource::Subscriptions => self.subscriptions,
            Resource::FilterNodes => self.filter_nodes,
        }
    }
}

/// Per-scope tallies, one slot per resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally {
    counts: [u64; 4],
}

impl Tally {
    fn get(&self, resource: Resource) -> u64 {
        self.counts[Self::slot(resource)]
    }

    fn add(&mut self, resource: Resource, amount: u64) {
        self.counts[Self::slot(resource)] += amount;
    }

    fn sub(&mut self, resource: Resource, amount: u64) {
        let slot = Self::slot(resource);
        debug_assert!(
            self.counts[slot] >= amount,
            "release of {amount} exceeds tally {} for {resource:?}",
            self.counts[slot],
        );
        self.counts[slot] = self.counts[slot].saturating_sub(amount);
    }

    fn is_zero(&self) -> bool {
        self.counts.iter().all(|&c| c == 0)
    }

    const fn slot(resource: Resource) -> usize {
        match resource {
            Resource::Clients => 0,
            Resource::Services => 1,
            Resource::Subscriptions => 2,
            Resource::FilterNodes => 3,
        }
    }
}

/// The accounting ledger of one domain.
#[derive(Debug, Clone)]
pub struct ResourceLedger {
    user_limits: ResourceLimits,
    total_limits: ResourceLimits,
    total: Tally,
    users: HashMap<String, Tally>,
}

impl ResourceLedger {
    /// Creates a ledger with the given per-user and total limits.
    #[must_use]
    pub fn new(user_limits: ResourceLimits, total_limits: ResourceLimits) -> Self {
        Self {
            user_limits,
            total_limits,
            total: Tally::default(),
            users: HashMap::new(),
        }
    }

    /// Charges `amount` of `resource` to `user` and to the total.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Exhausted`] without mutating either tally
    /// when either scope is at its limit.
    pub fn charge(
        &mut self,
        user: &str,
        resource: Resource,
        amount: u64,
    ) -> Result<(), ResourceError> {
        let user_tally = self.users.get(user).copied().unwrap_or_default();

        if let Some(limit) = self.user_limits.limit(resource) {
            let used = user_tally.get(resource);
            if used + amount > limit {
                return Err(ResourceError::Exhausted {
                    resource,
                    scope: Scope::User,
                    used,
                    limit,
                    requested: amount,
                });
            }
        }
        if let Some(limit) = self.total_limits.limit(resource) {
            let used = self.total.get(resource);
            if used + amount > limit {
                return Err(ResourceError::Exhausted {
                    resource,
                    scope: Scope::Total,
                    used,
                    limit,
                    requested: amount,
                });
            }
        }

        self.users.entry(user.to_owned()).or_default().add(resource, amount);
        self.total.add(resource, amount);
        Ok(())
    }

    /// Charges several `(resource, amount)` pairs as one admission.
    ///
    /// # Errors
    ///
    /// On the first denial, every pair already charged is released and
    /// the error is returned; the ledger is unchanged.
    pub fn charge_all(
        &mut self,
        user: &str,
        charges: &[(Resource, u64)],
    ) -> Result<(), ResourceError> {
        for (index, &(resource, amount)) in charges.iter().enumerate() {
            if let Err(err) = self.charge(user, resource, amount) {
                for &(resource, amount) in &charges[..index] {
                    self.release(user, resource, amount);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Releases a previous charge.
    ///
    /// Releasing more than was charged is a logic error; tallies saturate
    /// at zero rather than wrapping.
    pub fn release(&mut self, user: &str, resource: Resource, amount: u64) {
        if let Some(tally) = self.users.get_mut(user) {
            tally.sub(resource, amount);
            if tally.is_zero() {
                self.users.remove(user);
            }
        }
        self.total.sub(resource, amount);
    }

    /// Moves a standing charge from one user to another, as when an
    /// orphaned service is re-adopted by a session of a different user.
    ///
    /// # Errors
    ///
    /// Fails (leaving the original charge in place) when the receiving
    /// user is at their limit. The total is unaffected either way.
    pub fn transfer(
        &mut self,
        from_user: &str,
        to_user: &str,
        resource: Resource,
        amount: u64,
    ) -> Result<(), ResourceError> {
        if from_user == to_user {
            return Ok(());
        }
        if let Some(limit) = self.user_limits.limit(resource) {
            let used = self
                .users
                .get(to_user)
                .copied()
                .unwrap_or_default()
                .get(resource);
            if used + amount > limit {
                return Err(ResourceError::Exhausted {
                    resource,
                    scope: Scope::User,
                    used,
                    limit,
                    requested: amount,
                });
            }
        }
        if let Some(tally) = self.users.get_mut(from_user) {
            tally.sub(resource, amount);
            if tally.is_zero() {
                self.users.remove(from_user);
            }
        }
        self.users.entry(to_user.to_owned()).or_default().add(resource, amount);
        Ok(())
    }

    /// Current total tally for `resource`.
    #[must_use]
    pub fn total(&self, resource: Resource) -> u64 {
        self.total.get(resource)
    }

    /// Current tally of `resource` for `user`.
    #[must_use]
    pub fn of_user(&self, user: &str, resource: Resource) -> u64 {
        self.users
            .get(user)
            .copied()
            .unwrap_or_default()
            .get(resource)
    }

    /// Sum of the per-user tallies for `resource`. Equal to
    /// [`total`](Self::total) by construction; exposed for tests.
    #[must_use]
    pub fn user_sum(&self, resource: Resource) -> u64 {
        self.users.values().map(|t| t.get(resource)).sum()
    }
}
