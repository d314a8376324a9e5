//! pathfinder-server binary.
//!
//! Hosts one or more discovery domains, each on one or more listen
//! addresses, per the TOML configuration or a repeated `--addr` flag.
//! The runtime is a current-thread tokio runtime built explicitly:
//! all catalogue mutation happens on one cooperative worker, which is
//! what makes every command atomic between suspension points.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use pathfinder_server::{Server, ServerConfig};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Pathfinder service discovery server.
#[derive(Parser, Debug)]
#[command(name = "pathfinder-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, conflicts_with = "addr")]
    config: Option<PathBuf>,

    /// Listen address (repeatable) for a single default domain,
    /// e.g. `tcp:127.0.0.1:4711` or `ux:/run/pathfinder.sock`.
    #[arg(short, long)]
    addr: Vec<String>,

    /// Log filter directive when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match (&args.config, args.addr.is_empty()) {
        (Some(path), _) => {
            ServerConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        },
        (None, false) => ServerConfig::single_domain(&args.addr)?,
        (None, true) => bail!("either --config or at least one --addr is required"),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .context("building runtime")?;

    runtime.block_on(async move {
        let server = Server::bind(&config).await?;
        server.run(shutdown_signal()).await;
        Ok::<_, anyhow::Error>(())
    })?;

    info!("exited cleanly");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            tracing::warn!(%err, "cannot install SIGTERM handler");
            // Fall back to SIGINT alone.
            let _ = tokio::signal::ctrl_c().await;
            return;
        },
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = term.recv() => {},
    }
}
