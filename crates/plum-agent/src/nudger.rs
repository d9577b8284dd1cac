use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::http::HttpClient;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Subscribe to the controller's push channel for this node and wake the
/// reconciler whenever anything arrives. The payload is never parsed: the
/// assignments endpoint stays the single source of truth and the stream is
/// only a latency optimisation. Reconnects forever until shutdown.
pub fn spawn(
    http: Arc<HttpClient>,
    controller: String,
    node_id: String,
    nudge_tx: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let url = format!("{controller}/v1/stream?nodeId={node_id}");
        loop {
            if *shutdown.borrow() {
                return;
            }

            let res = http
                .stream(
                    &url,
                    |_chunk| {
                        // Full queue means a nudge is already pending.
                        let _ = nudge_tx.try_send(());
                    },
                    &mut shutdown,
                )
                .await;

            if *shutdown.borrow() {
                return;
            }
            match res {
                Ok(()) => debug!("event stream closed, reconnecting"),
                Err(e) => debug!(error = %e, "event stream failed, reconnecting"),
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => {}
            }
        }
    })
}
