//! Identifier newtypes shared across the domain.
//!
//! All three identifiers are 64-bit values that travel on the wire as plain
//! JSON numbers. Service ids are conventionally written in hexadecimal in
//! logs (clients tend to mint them from random bits), client and
//! subscription ids in decimal.

use serde::{Deserialize, Serialize};

/// Identifier of a published service, unique within a domain for the
/// lifetime of the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub u64);

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Server-side identifier of a client session.
///
/// Assigned at `hello` time. A reconnecting client may propose the id of
/// its previous session to re-adopt the services that session left
/// orphaned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-chosen identifier of a subscription, unique within a domain
/// while the subscription is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
