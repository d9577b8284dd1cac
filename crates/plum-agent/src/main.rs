use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::{mpsc, watch},
};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod artifact;
mod config;
mod http;
mod nudger;
mod reconciler;
mod reporter;
mod supervisor;

use artifact::ArtifactStore;
use config::AgentConfig;
use http::{CONTROL_TIMEOUT, HttpClient};
use reconciler::Reconciler;
use reporter::StatusReporter;

/// Reconcile cadence when no nudge arrives.
const TICK: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::from_env();

    // The data directory is the only fatal bootstrap dependency.
    std::fs::create_dir_all(cfg.node_dir())
        .with_context(|| format!("create data dir {}", cfg.node_dir().display()))?;

    // Persist agent logs under the data root and keep stdout logs for dev.
    let log_dir = cfg.node_dir().join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "agent.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    let _file_guard = file_guard;

    info!(
        node_id = %cfg.node_id,
        controller = %cfg.controller_base,
        data_dir = %cfg.data_dir.display(),
        "starting plum agent"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        info!("received stop signal");
        let _ = shutdown_tx.send(true);
    });

    let http = Arc::new(HttpClient::new());

    let (nudge_tx, mut nudge_rx) = mpsc::channel::<()>(100);
    nudger::spawn(
        http.clone(),
        cfg.controller_base.clone(),
        cfg.node_id.clone(),
        nudge_tx,
        shutdown_rx.clone(),
    );

    let reporter = StatusReporter::new(
        http.clone(),
        cfg.controller_base.clone(),
        cfg.node_id.clone(),
        cfg.node_ip.clone(),
    );
    let artifacts = ArtifactStore::new(cfg.node_dir(), http.clone());
    let mut reconciler = Reconciler::new(
        cfg.node_id.clone(),
        cfg.controller_grpc_addr(),
        artifacts,
        reporter.clone(),
    );

    let assignments_url = format!(
        "{}/v1/assignments?nodeId={}",
        cfg.controller_base, cfg.node_id
    );
    let mut shutdown = shutdown_rx;

    while !*shutdown.borrow() {
        reporter.heartbeat_node().await;

        let resp = http.get(&assignments_url, CONTROL_TIMEOUT).await;
        if resp.is_ok() && !resp.body.is_empty() {
            let mut items = reconciler::parse_assignments(&resp.body);
            for item in &mut items {
                item.artifact_url =
                    reconciler::normalize_artifact_url(&cfg.controller_base, &item.artifact_url);
            }
            reconciler.sync(&items).await;
            reconciler.refresh_services(&items).await;
        } else {
            // Includes status 0 (network failure): never infer an empty
            // desired set from a failed call.
            warn!(status = resp.status, "failed to fetch assignments");
        }

        tokio::select! {
            _ = shutdown.changed() => {}
            _ = nudge_rx.recv() => {}
            _ = tokio::time::sleep(TICK) => {}
        }
    }

    info!("draining instances before exit");
    reconciler.sync(&[]).await;
    reconciler.drain().await;
    info!("plum agent stopped");

    Ok(())
}
