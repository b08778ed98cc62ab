//! portshare
//!
//! Runs a process group of one primary and N workers sharing ports.
//!
//! Started without `PORTSHARE_ROLE`, the process is the primary: it builds
//! the binder, spawns `PORTSHARE_WORKERS` copies of itself connected over
//! Unix socket pairs, and serves their listen requests. Each worker asks
//! for the ports in `PORTSHARE_WORKER_PORTS` and echoes whatever its
//! clients send.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portshare_broker::{Config, Role};

mod cluster;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Invalid PORTSHARE_* configuration")?;

    // Initialize tracing (prefer RUST_LOG, fallback to PORTSHARE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    match config.role {
        Role::Primary => cluster::run_primary(config).await,
        Role::Worker => cluster::run_worker(config).await,
    }
}
