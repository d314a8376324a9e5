//! pathfinder-server - the service discovery daemon.
//!
//! This crate wraps the [`pathfinder_core`] domain kernel in everything a
//! running server needs: the framed JSON wire protocol, TCP and Unix
//! socket transports, the per-connection session state machine, the
//! accept and orphan-expiry loops, and configuration loading.
//!
//! # Modules
//!
//! - [`protocol`]: framing and wire message types
//! - [`transport`]: listen addresses, listeners, peer identity
//! - [`session`]: the per-connection state machine
//! - [`state`]: the shared handle tying a domain to its sessions
//! - [`server`]: bind / serve / shutdown lifecycle
//! - [`config`]: TOML and flag configuration

pub mod config;
pub mod protocol;
pub mod server;
pub mod session;
pub mod state;
pub mod transport;

pub use config::{ConfigError, DomainSpec, ServerConfig};
pub use server::{Server, ServerError};
pub use transport::ListenAddr;
