//! Server lifecycle: bind, serve, shut down.
//!
//! One [`DomainHandle`] is created per configured domain, each with one
//! or more listeners. Per listener an accept task admits connections and
//! spawns session tasks; per domain an expiry task sleeps until the
//! earliest orphan deadline and destroys expired orphans. Everything
//! runs cooperatively on the runtime the binary builds (a
//! current-thread runtime, so catalogue commands serialize naturally).
//!
//! Shutdown is edge-triggered through a watch channel: the accept loops
//! stop, sessions unwind their domain state, and Unix socket files are
//! unlinked.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pathfinder_core::Domain;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::session::{SessionConfig, run_session};
use crate::state::{DomainHandle, SharedDomain};
use crate::transport::{ListenAddr, Listener};

/// Error starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A listener could not be bound.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        /// The address that failed.
        addr: ListenAddr,
        /// The underlying bind failure.
        #[source]
        source: std::io::Error,
    },
}

struct DomainRuntime {
    handle: SharedDomain,
    listeners: Vec<(Listener, ListenAddr)>,
    session_config: SessionConfig,
}

/// A bound server, ready to run.
pub struct Server {
    domains: Vec<DomainRuntime>,
}

impl Server {
    /// Binds every listener of every configured domain.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] on the first address that cannot be bound;
    /// startup is all-or-nothing.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let mut domains = Vec::with_capacity(config.domains.len());
        for spec in &config.domains {
            let handle = Arc::new(DomainHandle::new(
                &spec.name,
                Domain::new(spec.domain_config()),
            ));
            let mut listeners = Vec::with_capacity(spec.addrs.len());
            for addr in &spec.addrs {
                let listener = Listener::bind(addr).await.map_err(|source| ServerError::Bind {
                    addr: addr.clone(),
                    source,
                })?;
                let local = listener.local_addr().map_err(|source| ServerError::Bind {
                    addr: addr.clone(),
                    source,
                })?;
                info!(domain = %spec.name, addr = %local, "listening");
                listeners.push((listener, local));
            }
            domains.push(DomainRuntime {
                handle,
                listeners,
                session_config: SessionConfig {
                    idle_timeout: spec.idle_timeout,
                },
            });
        }
        Ok(Self { domains })
    }

    /// The bound addresses, per domain in configuration order, with
    /// kernel-assigned ports resolved.
    #[must_use]
    pub fn local_addrs(&self) -> Vec<Vec<ListenAddr>> {
        self.domains
            .iter()
            .map(|d| d.listeners.iter().map(|(_, addr)| addr.clone()).collect())
            .collect()
    }

    /// Serves until `shutdown` resolves, then unwinds.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        for domain in self.domains {
            let DomainRuntime {
                handle,
                listeners,
                session_config,
            } = domain;
            for (listener, addr) in listeners {
                tasks.push(tokio::spawn(accept_loop(
                    listener,
                    addr,
                    handle.clone(),
                    session_config,
                    shutdown_rx.clone(),
                )));
            }
            tasks.push(tokio::spawn(orphan_expiry(handle, shutdown_rx.clone())));
        }
        drop(shutdown_rx);

        shutdown.await;
        info!("shutting down");
        let _ = shutdown_tx.send(true);
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Accepts connections on one listener until shutdown.
async fn accept_loop(
    listener: Listener,
    addr: ListenAddr,
    domain: SharedDomain,
    session_config: SessionConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(domain = %domain.name(), peer = %peer.addr, "connection accepted");
                    tokio::spawn(run_session(
                        stream,
                        peer,
                        domain.clone(),
                        session_config,
                        shutdown.clone(),
                    ));
                },
                Err(err) => {
                    warn!(%addr, %err, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                },
            },
        }
    }
    listener.cleanup();
    debug!(%addr, "listener closed");
}

/// Sleeps until the earliest orphan deadline of one domain and fires
/// expirations. The domain rings [`DomainHandle::timer`] whenever the
/// deadline set may have changed; a ring just recomputes the sleep.
async fn orphan_expiry(domain: SharedDomain, mut shutdown: watch::Receiver<bool>) {
    loop {
        let next = domain.next_orphan_deadline();
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            () = domain.timer().notified() => {},

            () = sleep_until_wallclock(next) => {
                domain.timeout_orphans(Utc::now());
            },
        }
    }
}

/// Sleeps until a wall-clock instant; pends forever on `None`.
async fn sleep_until_wallclock(deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(deadline) => {
            let wait = (deadline - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(wait).await;
        },
        None => std::future::pending().await,
    }
}
