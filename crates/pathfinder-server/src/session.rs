//! Per-connection session: protocol state machine and event loop.
//!
//! A session travels a strict forward-only phase progression:
//!
//! ```text
//! Connecting --> Greeted --> Accepted --> Closing --> Closed
//! ```
//!
//! In `Connecting` the only admissible command is `hello`; anything else
//! fails its transaction with `no-hello` and closes the connection. A
//! successful `hello` negotiates the protocol version and admits the
//! client against the `clients` resource (`Greeted`), after which the
//! acknowledgement is written and arbitrary commands flow (`Accepted`).
//! Any close cause drives `Closing`: the session unregisters from the
//! domain (dropping its subscriptions and orphaning its services) and is
//! reaped (`Closed`).
//!
//! The connection task multiplexes three sources: inbound frames,
//! notification events queued by other sessions' commands, and the
//! optional idle deadline. Queued events drain ahead of new requests so
//! notification delivery keeps up under request pressure.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use pathfinder_core::{ClientId, MatchType, ServiceView, SubscriptionId};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::protocol::{
    FailReason, FrameCodec, NotifyBody, PROTO_MAX_VERSION, PROTO_MIN_VERSION, ProtocolError,
    Request, Response,
};
use crate::state::{SessionEvent, SharedDomain};
use crate::transport::{Peer, Stream};

/// Session tunables, derived from the domain's configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    /// Close the session when no frame arrives within this window; the
    /// client keeps the window open with `ping`. `None` disables.
    pub idle_timeout: Option<Duration>,
}

/// Phase of the per-connection state machine. Transitions are
/// forward-only and validated; an illegal jump is a server bug surfaced
/// as an error rather than coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Transport accepted, `hello` not yet seen.
    Connecting,
    /// `hello` admitted; acknowledgement not yet on the wire.
    Greeted,
    /// In full command exchange.
    Accepted,
    /// Close cause hit; unwinding domain state.
    Closing,
    /// Reaped.
    Closed,
}

impl SessionPhase {
    /// Ordinal used to enforce forward-only movement.
    const fn ordinal(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Greeted => 1,
            Self::Accepted => 2,
            Self::Closing => 3,
            Self::Closed => 4,
        }
    }

    /// Advances to `next`, refusing regressions and skips other than the
    /// universally legal jump into `Closing`.
    pub fn advance(self, next: Self) -> Result<Self, SessionPhaseError> {
        let legal = next == Self::Closing && self != Self::Closed
            || next.ordinal() == self.ordinal() + 1;
        if legal {
            Ok(next)
        } else {
            Err(SessionPhaseError::IllegalTransition { from: self, to: next })
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Greeted => "greeted",
            Self::Accepted => "accepted",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Illegal phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionPhaseError {
    /// Attempted a regression or skip.
    #[error("illegal session phase transition from {from} to {to}")]
    IllegalTransition {
        /// Phase the session was in.
        from: SessionPhase,
        /// Phase the caller attempted.
        to: SessionPhase,
    },
}

/// Why a session left its event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseCause {
    PeerClosed,
    ProtocolViolation,
    Transport,
    IdleTimeout,
    AdmissionRefused,
    Shutdown,
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PeerClosed => "peer closed",
            Self::ProtocolViolation => "protocol violation",
            Self::Transport => "transport failure",
            Self::IdleTimeout => "idle timeout",
            Self::AdmissionRefused => "admission refused",
            Self::Shutdown => "server shutdown",
        };
        f.write_str(name)
    }
}

struct Session {
    domain: SharedDomain,
    peer: Peer,
    phase: SessionPhase,
    client_id: Option<ClientId>,
    proto_version: Option<u32>,
    /// Transaction id of each open subscription, the routing key for
    /// streamed notifications.
    subscription_tas: HashMap<SubscriptionId, u64>,
}

type Transport = Framed<Stream, FrameCodec>;

/// Serves one connection to completion.
///
/// Runs until a close cause is hit, then unwinds the session's domain
/// state (subscriptions dropped, services orphaned) and returns.
pub async fn run_session(
    stream: Stream,
    peer: Peer,
    domain: SharedDomain,
    config: SessionConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut framed = Framed::new(stream, FrameCodec::new());
    // The local sender keeps the channel open while no client is
    // registered yet; the domain gets its own clone at hello time.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut session = Session {
        domain,
        peer,
        phase: SessionPhase::Connecting,
        client_id: None,
        proto_version: None,
        subscription_tas: HashMap::new(),
    };

    let mut idle_deadline = config.idle_timeout.map(|d| tokio::time::Instant::now() + d);

    let cause = loop {
        let result = tokio::select! {
            biased;

            _ = shutdown.changed() => Err(CloseCause::Shutdown),

            event = event_rx.recv() => {
                let event = event.expect("local sender keeps the event channel open");
                session.deliver(&mut framed, event).await
            },

            frame = framed.next() => match frame {
                None => Err(CloseCause::PeerClosed),
                Some(Err(err)) => {
                    warn!(peer = %session.peer.addr, %err, "closing on frame error");
                    Err(close_cause_of(&err))
                },
                Some(Ok(payload)) => {
                    if let Some(timeout) = config.idle_timeout {
                        idle_deadline = Some(tokio::time::Instant::now() + timeout);
                    }
                    match Request::decode(&payload) {
                        Err(err) => {
                            warn!(peer = %session.peer.addr, %err, "closing on malformed request");
                            Err(CloseCause::ProtocolViolation)
                        },
                        Ok(request) => session.handle(&mut framed, request, &event_tx).await,
                    }
                },
            },

            () = idle_sleep(idle_deadline) => Err(CloseCause::IdleTimeout),
        };

        if let Err(cause) = result {
            break cause;
        }
    };

    session.close(cause, &mut framed).await;
}

/// Sleeps until the idle deadline; never wakes when idling is disabled.
async fn idle_sleep(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

const fn close_cause_of(err: &ProtocolError) -> CloseCause {
    match err {
        ProtocolError::Io(_) => CloseCause::Transport,
        ProtocolError::FrameTooLarge { .. } | ProtocolError::Malformed(_) => {
            CloseCause::ProtocolViolation
        },
    }
}

impl Session {
    /// Processes one request. `Ok` keeps the session running; `Err`
    /// carries the close cause.
    async fn handle(
        &mut self,
        framed: &mut Transport,
        request: Request,
        event_tx: &UnboundedSender<SessionEvent>,
    ) -> Result<(), CloseCause> {
        trace!(
            peer = %self.peer.addr,
            ta_id = request.ta_id,
            cmd = request.command.name(),
            "request"
        );
        match self.phase {
            SessionPhase::Connecting => self.handle_connecting(framed, request, event_tx).await,
            SessionPhase::Accepted => self.handle_accepted(framed, request).await,
            // Transient or terminal phases never read frames.
            SessionPhase::Greeted | SessionPhase::Closing | SessionPhase::Closed => {
                Err(CloseCause::ProtocolViolation)
            },
        }
    }

    async fn handle_connecting(
        &mut self,
        framed: &mut Transport,
        request: Request,
        event_tx: &UnboundedSender<SessionEvent>,
    ) -> Result<(), CloseCause> {
        use crate::protocol::Command;

        let ta_id = request.ta_id;
        let cmd_name = request.command.name();
        let Command::Hello {
            min_version,
            max_version,
            client_id: proposed,
        } = request.command
        else {
            warn!(peer = %self.peer.addr, cmd = cmd_name, "command before hello");
            self.send(framed, Response::fail(ta_id, FailReason::NoHello))
                .await?;
            return Err(CloseCause::ProtocolViolation);
        };

        let low = min_version.max(PROTO_MIN_VERSION);
        let high = max_version.min(PROTO_MAX_VERSION);
        if low > high {
            info!(
                peer = %self.peer.addr,
                client_min = min_version,
                client_max = max_version,
                "no common protocol version"
            );
            // The failed transaction leaves the session in Connecting;
            // the client may retry with another range.
            return self
                .send(
                    framed,
                    Response::fail(ta_id, FailReason::UnsupportedProtocolVersion),
                )
                .await;
        }
        let version = high;

        match self.domain.connect(
            proposed,
            &self.peer.user,
            &self.peer.addr,
            Utc::now(),
            event_tx.clone(),
        ) {
            Ok(client_id) => {
                self.phase = self
                    .phase
                    .advance(SessionPhase::Greeted)
                    .expect("hello only handled in Connecting");
                self.client_id = Some(client_id);
                self.proto_version = Some(version);
                self.send(framed, Response::hello_accept(ta_id, version, client_id))
                    .await?;
                self.phase = self
                    .phase
                    .advance(SessionPhase::Accepted)
                    .expect("greeted advances to accepted");
                info!(
                    peer = %self.peer.addr,
                    client = %client_id,
                    version,
                    "session accepted"
                );
                Ok(())
            },
            Err(err) => {
                let reason = FailReason::from(&err);
                self.send(framed, Response::fail(ta_id, reason)).await?;
                if reason == FailReason::InsufficientResources {
                    // Client admission is refused at the boundary, not
                    // left to retry.
                    Err(CloseCause::AdmissionRefused)
                } else {
                    Ok(())
                }
            },
        }
    }

    async fn handle_accepted(
        &mut self,
        framed: &mut Transport,
        request: Request,
    ) -> Result<(), CloseCause> {
        use crate::protocol::Command;

        let ta_id = request.ta_id;
        let client_id = self.client_id.expect("accepted sessions have a client id");
        match request.command {
            Command::Hello { .. } => {
                warn!(peer = %self.peer.addr, "hello repeated after acceptance");
                Err(CloseCause::ProtocolViolation)
            },

            Command::Publish {
                service_id,
                generation,
                props,
                ttl,
            } => {
                let response =
                    match self
                        .domain
                        .publish(client_id, service_id, generation, props, ttl)
                    {
                        Ok(()) => Response::accept(ta_id),
                        Err(err) => {
                            debug!(%client_id, %service_id, %err, "publish refused");
                            Response::fail(ta_id, FailReason::from(&err))
                        },
                    };
                self.send(framed, response).await
            },

            Command::Unpublish { service_id } => {
                let response = match self.domain.unpublish(client_id, service_id) {
                    Ok(()) => Response::accept(ta_id),
                    Err(err) => {
                        debug!(%client_id, %service_id, %err, "unpublish refused");
                        Response::fail(ta_id, FailReason::from(&err))
                    },
                };
                self.send(framed, response).await
            },

            Command::Subscribe {
                subscription_id,
                filter,
            } => {
                self.handle_subscribe(framed, ta_id, subscription_id, filter.as_deref())
                    .await
            },

            Command::Unsubscribe { subscription_id } => {
                let response = match self.domain.unsubscribe(client_id, subscription_id) {
                    Ok(()) => {
                        self.subscription_tas.remove(&subscription_id);
                        Response::accept(ta_id)
                    },
                    Err(err) => Response::fail(ta_id, FailReason::from(&err)),
                };
                self.send(framed, response).await
            },

            Command::Services { filter } => match self.domain.services(filter.as_deref()) {
                Ok(views) => {
                    self.send(framed, Response::accept(ta_id)).await?;
                    for view in &views {
                        self.send(framed, Response::notify(ta_id, NotifyBody::service_row(view)))
                            .await?;
                    }
                    self.send(framed, Response::complete(ta_id)).await
                },
                Err(err) => {
                    self.send(framed, Response::fail(ta_id, FailReason::from(&err)))
                        .await
                },
            },

            Command::Subscriptions => {
                self.send(framed, Response::accept(ta_id)).await?;
                for view in &self.domain.subscriptions() {
                    self.send(
                        framed,
                        Response::notify(ta_id, NotifyBody::subscription_row(view)),
                    )
                    .await?;
                }
                self.send(framed, Response::complete(ta_id)).await
            },

            Command::Clients => {
                self.send(framed, Response::accept(ta_id)).await?;
                for view in &self.domain.clients() {
                    self.send(framed, Response::notify(ta_id, NotifyBody::client_row(view)))
                        .await?;
                }
                self.send(framed, Response::complete(ta_id)).await
            },

            Command::Ping => self.send(framed, Response::accept(ta_id)).await,
        }
    }

    /// `subscribe` is the one notify-before-accept transaction: every
    /// currently-matching service is reported as `appeared` ahead of the
    /// acknowledgement, after which the transaction stays open streaming
    /// notifications.
    async fn handle_subscribe(
        &mut self,
        framed: &mut Transport,
        ta_id: u64,
        subscription_id: SubscriptionId,
        filter: Option<&str>,
    ) -> Result<(), CloseCause> {
        let client_id = self.client_id.expect("accepted sessions have a client id");
        let initial: Vec<ServiceView> =
            match self.domain.subscribe(client_id, subscription_id, filter) {
                Ok(initial) => initial,
                Err(err) => {
                    debug!(%client_id, %subscription_id, %err, "subscribe refused");
                    return self
                        .send(framed, Response::fail(ta_id, FailReason::from(&err)))
                        .await;
                },
            };

        self.subscription_tas.insert(subscription_id, ta_id);
        for view in &initial {
            self.send(
                framed,
                Response::notify(
                    ta_id,
                    NotifyBody::match_event(MatchType::Appeared, view.id, Some(view)),
                ),
            )
            .await?;
        }
        self.send(framed, Response::accept(ta_id)).await
    }

    /// Writes one queued notification, stamped with the transaction id
    /// of the subscription it belongs to.
    async fn deliver(
        &mut self,
        framed: &mut Transport,
        event: SessionEvent,
    ) -> Result<(), CloseCause> {
        let SessionEvent::Notify(notification) = event;
        let Some(&ta_id) = self.subscription_tas.get(&notification.subscription_id) else {
            // The subscription was dropped while the event was queued.
            trace!(
                subscription = %notification.subscription_id,
                "dropping event for cancelled subscription"
            );
            return Ok(());
        };
        let body = NotifyBody::match_event(
            notification.match_type,
            notification.service_id,
            notification.service.as_ref(),
        );
        self.send(framed, Response::notify(ta_id, body)).await
    }

    async fn send(&mut self, framed: &mut Transport, response: Response) -> Result<(), CloseCause> {
        let payload = response.encode().map_err(|err| {
            warn!(peer = %self.peer.addr, %err, "cannot encode response");
            CloseCause::ProtocolViolation
        })?;
        framed.send(payload).await.map_err(|err| {
            debug!(peer = %self.peer.addr, %err, "write failed");
            CloseCause::Transport
        })
    }

    /// Unwinds the session: subscriptions dropped, services orphaned,
    /// socket closed.
    async fn close(mut self, cause: CloseCause, framed: &mut Transport) {
        self.phase = self
            .phase
            .advance(SessionPhase::Closing)
            .unwrap_or(SessionPhase::Closing);
        if let Some(client_id) = self.client_id.take() {
            self.domain.disconnect(client_id, Utc::now());
            info!(
                peer = %self.peer.addr,
                client = %client_id,
                version = self.proto_version,
                %cause,
                "session closed"
            );
        } else {
            debug!(peer = %self.peer.addr, %cause, "connection closed before hello");
        }
        let _ = framed.close().await;
        self.phase = SessionPhase::Closed;
    }
}
