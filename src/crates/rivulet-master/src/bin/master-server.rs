//! Master server binary: bootstraps the cluster entry and runs until a
//! shutdown signal or a cluster shutdown request arrives.

use rivulet_core::config::RuntimeConfig;
use rivulet_core::state::ApplicationStatus;
use rivulet_master::{ClusterEntry, RUNTIME_FAILURE_EXIT_CODE, STARTUP_FAILURE_EXIT_CODE};

#[tokio::main]
async fn main() {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let config = match std::env::var("RIVULET_CONFIG") {
        Ok(path) => {
            tracing::info!(path, "loading configuration");
            match RuntimeConfig::load(&path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!("failed to load configuration: {e}");
                    std::process::exit(STARTUP_FAILURE_EXIT_CODE);
                }
            }
        }
        Err(_) => {
            tracing::info!("RIVULET_CONFIG not set, using defaults");
            RuntimeConfig::default()
        }
    };

    let components = match ClusterEntry::start(config).await {
        Ok(components) => components,
        Err(e) => {
            tracing::error!("cluster entry failed: {e}");
            std::process::exit(STARTUP_FAILURE_EXIT_CODE);
        }
    };

    tracing::info!(address = %components.config.address, "master up");
    components.shutdown.install_signal_handlers();

    let status = components.shutdown.wait_for_shutdown().await;
    tracing::info!(?status, "master shutting down");

    match status {
        ApplicationStatus::Succeeded | ApplicationStatus::Canceled => {}
        ApplicationStatus::Failed => std::process::exit(RUNTIME_FAILURE_EXIT_CODE),
    }
}
