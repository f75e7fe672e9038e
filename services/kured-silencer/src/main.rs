//! kured-silencer
//!
//! Silences Alertmanager alerts for nodes that kured has labelled for a
//! reboot, and lifts the silences once the label is gone.
//!
//! ## Architecture
//!
//! - **Leader Election**: Only the replica holding the lease runs the loop
//!   (skipped when running from a local kubeconfig)
//! - **Reconciler**: Watches node labels and hands each event to the handler
//! - **Event Handler**: Opens silences on label added, closes them on removal
//! - **Alertmanager Client**: Creates and deletes silences over the v2 API

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kured_silencer::cluster::new_kube_client;
use kured_silencer::config::Config;
use kured_silencer::reconciler::forward_shutdown;
use kured_silencer::{
    AlertSilencer, AlertmanagerClient, EventHandler, KubeLeaseLock, LeaderElector,
    NodeLabelWatch, Reconciler, WatchSource,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kured-silencer");

    let endpoint = config.validate().context("invalid configuration")?;
    info!(
        kured_label = %config.kured_label,
        alertmanager_endpoint = %endpoint,
        silence_duration_mins = config.silence_duration_mins,
        removal_buffer_secs = config.removal_buffer_secs,
        severities = ?config.severities,
        leader_election = config.leader_election_enabled(),
        "Configuration loaded"
    );

    let client = new_kube_client(config.kubeconfig_path.as_deref()).await?;

    let silencer: Arc<dyn AlertSilencer> = Arc::new(AlertmanagerClient::new(
        &endpoint,
        config.silence_template(),
        config.request_timeout(),
    )?);
    let source: Arc<dyn WatchSource> = Arc::new(NodeLabelWatch::new(
        client.clone(),
        config.kured_label.clone(),
        config.watch_timeout(),
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(forward_shutdown(wait_for_shutdown_signal(), shutdown_tx));

    let handler_config = config.handler_config();
    let reconciler_config = config.reconciler_config();

    if config.leader_election_enabled() {
        let lease = config.lease_settings()?;
        let lock = Arc::new(KubeLeaseLock::new(client, lease.namespace, lease.name));
        let mut elector = LeaderElector::new(lock, lease.election);

        elector
            .run(shutdown_rx, move |stop| {
                let handler = EventHandler::new(Arc::clone(&silencer), handler_config.clone());
                let mut reconciler =
                    Reconciler::new(Arc::clone(&source), handler, reconciler_config.clone());
                async move {
                    reconciler.run(stop).await;
                }
            })
            .await;
    } else {
        let handler = EventHandler::new(silencer, handler_config);
        let mut reconciler = Reconciler::new(source, handler, reconciler_config);
        reconciler.run(shutdown_rx).await;
    }

    info!("kured-silencer shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, listening for ctrl-c only");
            return tokio::signal::ctrl_c().await;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
