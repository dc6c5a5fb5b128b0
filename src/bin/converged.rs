//! Converge Control Service Daemon
//!
//! Loads configuration, opens (and migrates) the persisted deployment
//! document, then serves the control protocol until interrupted.

use anyhow::Context;
use clap::Parser;
use converge::config::ServiceConfig;
use converge::logging::init_logging;
use converge::persist::{DeploymentStore, FileDeploymentStore};
use converge::protocol::service::{run_server, ControlService, ControlServiceConfig};
use converge::protocol::tls;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "converged", about = "Converge cluster control service")]
struct Cli {
    /// Path to the TOML service configuration; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match ServiceConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load configuration {:?}: {}", path, e);
                process::exit(1);
            }
        },
        None => ServiceConfig::default(),
    };

    // Initialize logging early
    if let Err(e) = init_logging(Some(&config.logging)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!("converge control service starting");

    if let Err(e) = run(config) {
        error!("control service failed: {:#}", e);
        eprintln!("{:#}", e);
        process::exit(1);
    }
}

fn run(config: ServiceConfig) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    runtime.block_on(serve(config))
}

async fn serve(config: ServiceConfig) -> anyhow::Result<()> {
    // A migration failure here is fatal; running against a document the
    // daemon cannot interpret would silently lose configuration.
    let store = FileDeploymentStore::open(&config.deployment_path)
        .with_context(|| format!("opening deployment document {:?}", config.deployment_path))?;
    let initial = store.get().await;

    let (service, handle) = ControlService::new(
        ControlServiceConfig {
            expiry_window_secs: config.expiry_window_secs,
            keepalive_interval: Duration::from_secs(config.keepalive_interval_secs),
            generation_capacity: config.generation_capacity,
        },
        initial,
    );
    tokio::spawn(service.run());

    // Configuration saves fan out to connected agents through the service.
    let mut configuration_rx = store.subscribe();
    let config_handle = handle.clone();
    tokio::spawn(async move {
        while configuration_rx.changed().await.is_ok() {
            let deployment = configuration_rx.borrow_and_update().clone();
            config_handle.configuration_changed(deployment).await;
        }
    });

    let acceptor = match &config.tls {
        Some(tls_config) => Some(tls::acceptor(tls_config).context("building TLS acceptor")?),
        None => {
            warn!("TLS is not configured, agent connections are unauthenticated");
            None
        }
    };

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(listen = %config.listen, "accepting agent connections");

    tokio::select! {
        result = run_server(listener, acceptor, handle) => {
            result.context("control protocol server")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }
    Ok(())
}
