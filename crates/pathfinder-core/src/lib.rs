//! pathfinder-core - Service discovery domain kernel.
//!
//! This crate owns the authoritative state of one discovery *domain* and the
//! transitions over it: the service catalogue with publish / republish /
//! unpublish / orphan / timeout semantics, the subscription engine with
//! differential notifications, and the two-scope resource accounting that
//! gates admission.
//!
//! The crate is deliberately transport-free and synchronous. Every command
//! is a plain function call that mutates the [`domain::Domain`] and returns
//! its result together with the batch of notifications owed to other
//! clients. The server crate routes those batches onto per-session outbound
//! queues; a different transport could do the same without touching this
//! crate.
//!
//! # Modules
//!
//! - [`props`]: typed property multimaps, the unit of service payload
//! - [`filter`]: LDAP-like predicate compilation and matching
//! - [`service`]: one service's authoritative record
//! - [`subscription`]: one registered predicate and its match cache
//! - [`domain`]: the aggregate state machine
//! - [`resources`]: per-user / total counters with optional limits

pub mod domain;
pub mod filter;
mod ids;
pub mod props;
pub mod resources;
pub mod service;
pub mod subscription;

pub use domain::{Domain, DomainConfig, DomainError, MatchType, Notification};
pub use filter::{Filter, FilterError};
pub use ids::{ClientId, ServiceId, SubscriptionId};
pub use props::{PropValue, Props};
pub use resources::{Resource, ResourceError, ResourceLedger, ResourceLimits};
pub use service::{Service, ServiceView};
pub use subscription::{Subscription, SubscriptionView};
