//! Structured errors for domain commands.

use thiserror::Error;

use crate::filter::FilterError;
use crate::ids::{ClientId, ServiceId, SubscriptionId};
use crate::resources::ResourceError;

/// Error from a domain command.
///
/// Callers branch on the variant to pick the wire `fail-reason`; every
/// variant leaves the domain exactly as it was before the command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// A `hello` proposed a client id held by a live session.
    #[error("client id {0} is held by a live session")]
    ClientIdExists(ClientId),

    /// The issuing client id is not registered in this domain.
    #[error("client {0} is not connected to this domain")]
    UnknownClient(ClientId),

    /// A republish did not advance the generation.
    #[error(
        "generation {requested} is not newer than stored generation {stored} \
         for service {service}"
    )]
    OldGeneration {
        /// Target service.
        service: ServiceId,
        /// Generation currently stored.
        stored: u32,
        /// Generation the publish carried.
        requested: u32,
    },

    /// A republish repeated the stored generation with different content.
    #[error("publish of service {service} repeats generation {generation} with different content")]
    SameGenerationButDifferent {
        /// Target service.
        service: ServiceId,
        /// The repeated generation.
        generation: u32,
    },

    /// The caller does not own the record it tried to mutate.
    #[error("client {client} does not own the target record")]
    PermissionDenied {
        /// The denied caller.
        client: ClientId,
    },

    /// `unpublish` of an id that is not in the catalogue.
    #[error("service {0} does not exist")]
    NonExistentService(ServiceId),

    /// `subscribe` with an id already registered.
    #[error("subscription {0} already exists")]
    SubscriptionIdExists(SubscriptionId),

    /// `unsubscribe` of an id that is not registered.
    #[error("subscription {0} does not exist")]
    NonExistentSubscription(SubscriptionId),

    /// The filter text did not compile or is over the complexity cap.
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// A resource charge was denied.
    #[error(transparent)]
    Resource(#[from] ResourceError),
}
