//! Meridian
//!
//! Loads the configuration, installs logging and runs the load balancer
//! until Ctrl-C.
//!
//! The configuration path is the first argument, else `MERIDIAN_CONFIG`,
//! else `meridian.yaml` in the working directory.

use meridian_core::Config;
use meridian_proxy::{logging, server};
use std::process::ExitCode;
use tracing::{error, info};

const CONFIG_ENV: &str = "MERIDIAN_CONFIG";
const DEFAULT_CONFIG: &str = "meridian.yaml";

/// Entry point for the `meridian` binary.
#[tokio::main]
async fn main() -> ExitCode {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());

    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("meridian: cannot load {path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = logging::init(&config.logging) {
        eprintln!("meridian: {err}");
        return ExitCode::FAILURE;
    }
    info!(config = %path, "configuration loaded");

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "cannot listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    };

    match server::run(config, shutdown).await {
        Ok(()) => {
            info!("shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "meridian stopped");
            ExitCode::FAILURE
        }
    }
}
