//! kubexit: wrap a container command with birth/death dependency
//! coordination.
//!
//! Usage: `kubexit <cmd> [args...]`. All configuration comes from
//! `KUBEXIT_*` environment variables; the exit code is the child's own
//! exit code whenever the engine completes cleanly.

use kubexit::config;
use kubexit_core::engine;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .is_err()
    {
        eprintln!("kubexit: failed to initialize logging");
        return 2;
    }

    let config = match config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to parse config");
            return 1;
        }
    };
    match serde_json::to_string(&config) {
        Ok(resolved) => info!(config = %resolved, "kubexit initialized"),
        Err(err) => {
            error!(error = %err, "failed to serialize config");
            return 1;
        }
    }

    let argv: Vec<String> = std::env::args().skip(1).collect();
    engine::run(config, argv).await
}
