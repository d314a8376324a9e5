//! Wire message types.
//!
//! Every message is a JSON record. Requests carry a client-chosen
//! transaction id (`ta-id`) and a command discriminant (`cmd`); responses
//! echo the `ta-id` and carry a `msg-type` of `accept`, `notify`,
//! `complete` or `fail`. Unknown commands and message types fail decoding
//! rather than coercing to a default.
//!
//! Most commands are single-response: one `accept` or one `fail` ends the
//! transaction. The listings (`services`, `subscriptions`, `clients`)
//! respond `accept`, a `notify` per row, then `complete`. A `subscribe`
//! reports currently-matching services as `notify` rows *before* its
//! `accept` and then stays open, streaming `notify` until the
//! subscription is dropped.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use pathfinder_core::domain::ClientView;
use pathfinder_core::{
    ClientId, DomainError, FilterError, MatchType, Props, ServiceId, ServiceView, SubscriptionId,
    SubscriptionView,
};
use serde::{Deserialize, Serialize};

use super::error::ProtocolError;

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Client-chosen transaction id, echoed on every response.
    #[serde(rename = "ta-id")]
    pub ta_id: u64,
    /// The command and its arguments.
    #[serde(flatten)]
    pub command: Command,
}

impl Request {
    /// Decodes a request from one frame payload.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Malformed`] when the payload is not a valid
    /// request record.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(frame)?)
    }

    /// Encodes the request into a frame payload.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// The commands of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum Command {
    /// Version negotiation; must be the first command of a session.
    Hello {
        /// Lowest version the client speaks.
        #[serde(rename = "proto-min-version")]
        min_version: u32,
        /// Highest version the client speaks.
        #[serde(rename = "proto-max-version")]
        max_version: u32,
        /// Client id of a previous session, proposed for re-adoption.
        #[serde(rename = "client-id", default, skip_serializing_if = "Option::is_none")]
        client_id: Option<ClientId>,
    },
    /// Publish or republish a service.
    Publish {
        /// Service identifier.
        #[serde(rename = "service-id")]
        service_id: ServiceId,
        /// Monotonic generation counter.
        generation: u32,
        /// The property bag.
        #[serde(rename = "service-props", default)]
        props: Props,
        /// Orphan TTL in seconds.
        ttl: u64,
    },
    /// Withdraw an owned service.
    Unpublish {
        /// Service identifier.
        #[serde(rename = "service-id")]
        service_id: ServiceId,
    },
    /// Register a subscription.
    Subscribe {
        /// Client-chosen subscription id.
        #[serde(rename = "subscription-id")]
        subscription_id: SubscriptionId,
        /// Filter text; absent matches every service.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    /// Drop a subscription.
    Unsubscribe {
        /// Subscription id.
        #[serde(rename = "subscription-id")]
        subscription_id: SubscriptionId,
    },
    /// Snapshot the service catalogue.
    Services {
        /// Optional filter text.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    /// Snapshot the registered subscriptions.
    Subscriptions,
    /// Snapshot the live sessions.
    Clients,
    /// Liveness probe.
    Ping,
}

impl Command {
    /// The wire name of the command, for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Publish { .. } => "publish",
            Self::Unpublish { .. } => "unpublish",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Services { .. } => "services",
            Self::Subscriptions => "subscriptions",
            Self::Clients => "clients",
            Self::Ping => "ping",
        }
    }
}

/// A server response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Transaction id the response belongs to.
    #[serde(rename = "ta-id")]
    pub ta_id: u64,
    /// Response kind and payload.
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl Response {
    /// A bare `accept`.
    #[must_use]
    pub fn accept(ta_id: u64) -> Self {
        Self {
            ta_id,
            body: ResponseBody::Accept(AcceptBody::default()),
        }
    }

    /// The `accept` of a successful `hello`.
    #[must_use]
    pub fn hello_accept(ta_id: u64, proto_version: u32, client_id: ClientId) -> Self {
        Self {
            ta_id,
            body: ResponseBody::Accept(AcceptBody {
                proto_version: Some(proto_version),
                client_id: Some(client_id),
            }),
        }
    }

    /// A `notify` with the given payload.
    #[must_use]
    pub fn notify(ta_id: u64, body: NotifyBody) -> Self {
        Self {
            ta_id,
            body: ResponseBody::Notify(body),
        }
    }

    /// The `complete` closing a multi-response transaction.
    #[must_use]
    pub fn complete(ta_id: u64) -> Self {
        Self {
            ta_id,
            body: ResponseBody::Complete,
        }
    }

    /// A `fail` with a machine-readable reason.
    #[must_use]
    pub fn fail(ta_id: u64, reason: FailReason) -> Self {
        Self {
            ta_id,
            body: ResponseBody::Fail { reason },
        }
    }

    /// Encodes the response into a frame payload.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decodes a response from one frame payload.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Malformed`] when the payload is not a valid
    /// response record.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(frame)?)
    }
}

/// The four response kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg-type", rename_all = "kebab-case")]
pub enum ResponseBody {
    /// The transaction was admitted.
    Accept(AcceptBody),
    /// One row or event of a multi-response transaction.
    Notify(NotifyBody),
    /// End of a multi-response transaction.
    Complete,
    /// The transaction was refused.
    Fail {
        /// Machine-readable reason.
        #[serde(rename = "fail-reason")]
        reason: FailReason,
    },
}

/// Payload of an `accept`; populated for `hello` only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcceptBody {
    /// Negotiated protocol version.
    #[serde(rename = "proto-version", default, skip_serializing_if = "Option::is_none")]
    pub proto_version: Option<u32>,
    /// The session's client id.
    #[serde(rename = "client-id", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
}

/// Payload of a `notify`: a subscription event or a listing row.
///
/// The protocol keeps these flat; which fields are present follows from
/// the transaction the notify belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyBody {
    /// Visibility change, on subscription events.
    #[serde(rename = "match-type", default, skip_serializing_if = "Option::is_none")]
    pub match_type: Option<MatchType>,
    /// Service the event or row is about.
    #[serde(rename = "service-id", default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<ServiceId>,
    /// Service generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u32>,
    /// Service property bag.
    #[serde(rename = "service-props", default, skip_serializing_if = "Option::is_none")]
    pub props: Option<Props>,
    /// Service TTL in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Owning client (service rows) or listed client (client rows).
    #[serde(rename = "client-id", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// Epoch seconds the service became an orphan, while orphaned.
    #[serde(rename = "orphan-since", default, skip_serializing_if = "Option::is_none")]
    pub orphan_since: Option<f64>,
    /// Subscription id, on subscription rows.
    #[serde(rename = "subscription-id", default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<SubscriptionId>,
    /// Filter text, on subscription rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Remote address, on client rows.
    #[serde(rename = "client-address", default, skip_serializing_if = "Option::is_none")]
    pub client_address: Option<String>,
    /// Connect timestamp in epoch seconds, on client rows.
    #[serde(rename = "connect-time", default, skip_serializing_if = "Option::is_none")]
    pub connect_time: Option<f64>,
}

impl NotifyBody {
    /// A subscription event. `appeared` and `modified` carry the service
    /// snapshot; `disappeared` carries the id alone.
    #[must_use]
    pub fn match_event(
        match_type: MatchType,
        service_id: ServiceId,
        service: Option<&ServiceView>,
    ) -> Self {
        let mut body = Self {
            match_type: Some(match_type),
            service_id: Some(service_id),
            ..Self::default()
        };
        if let Some(view) = service {
            body.generation = Some(view.generation);
            body.props = Some(view.props.clone());
            body.ttl = Some(view.ttl);
            body.client_id = Some(view.owner);
            body.orphan_since = view.orphan_since.map(epoch_seconds);
        }
        body
    }

    /// One row of a `services` listing.
    #[must_use]
    pub fn service_row(view: &ServiceView) -> Self {
        Self {
            service_id: Some(view.id),
            generation: Some(view.generation),
            props: Some(view.props.clone()),
            ttl: Some(view.ttl),
            client_id: Some(view.owner),
            orphan_since: view.orphan_since.map(epoch_seconds),
            ..Self::default()
        }
    }

    /// One row of a `subscriptions` listing.
    #[must_use]
    pub fn subscription_row(view: &SubscriptionView) -> Self {
        Self {
            subscription_id: Some(view.id),
            client_id: Some(view.owner),
            filter: view.filter_text.clone(),
            ..Self::default()
        }
    }

    /// One row of a `clients` listing.
    #[must_use]
    pub fn client_row(view: &ClientView) -> Self {
        Self {
            client_id: Some(view.id),
            client_address: Some(view.addr.clone()),
            connect_time: Some(epoch_seconds(view.connected_at)),
            ..Self::default()
        }
    }
}

/// Wall-clock timestamp as fractional epoch seconds, the wire form of
/// all timestamps.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// The closed set of failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailReason {
    /// A command arrived before `hello`.
    NoHello,
    /// The proposed client id is held by a live session.
    ClientIdExists,
    /// The filter text does not parse.
    InvalidFilterSyntax,
    /// The subscription id is already registered.
    SubscriptionIdExists,
    /// No such subscription.
    NonExistentSubscription,
    /// No such service.
    NonExistentService,
    /// No common protocol version.
    UnsupportedProtocolVersion,
    /// The caller does not own the target record.
    PermissionDenied,
    /// The publish did not advance the generation.
    OldGeneration,
    /// The publish repeated the generation with different content.
    SameGenerationButDifferent,
    /// A resource charge was denied.
    InsufficientResources,
}

impl FailReason {
    /// The wire spelling of the reason.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoHello => "no-hello",
            Self::ClientIdExists => "client-id-exists",
            Self::InvalidFilterSyntax => "invalid-filter-syntax",
            Self::SubscriptionIdExists => "subscription-id-exists",
            Self::NonExistentSubscription => "non-existent-subscription",
            Self::NonExistentService => "non-existent-service",
            Self::UnsupportedProtocolVersion => "unsupported-protocol-version",
            Self::PermissionDenied => "permission-denied",
            Self::OldGeneration => "old-generation",
            Self::SameGenerationButDifferent => "same-generation-but-different",
            Self::InsufficientResources => "insufficient-resources",
        }
    }
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&DomainError> for FailReason {
    fn from(err: &DomainError) -> Self {
        match err {
            DomainError::ClientIdExists(_) => Self::ClientIdExists,
            DomainError::UnknownClient(_) | DomainError::PermissionDenied { .. } => {
                Self::PermissionDenied
            },
            DomainError::OldGeneration { .. } => Self::OldGeneration,
            DomainError::SameGenerationButDifferent { .. } => Self::SameGenerationButDifferent,
            DomainError::NonExistentService(_) => Self::NonExistentService,
            DomainError::SubscriptionIdExists(_) => Self::SubscriptionIdExists,
            DomainError::NonExistentSubscription(_) => Self::NonExistentSubscription,
            DomainError::Filter(FilterError::Syntax { .. }) => Self::InvalidFilterSyntax,
            DomainError::Filter(FilterError::TooComplex { .. })
            | DomainError::Resource(_) => Self::InsufficientResources,
        }
    }
}
