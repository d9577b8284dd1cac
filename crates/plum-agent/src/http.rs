use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::watch;

/// Timeout for control-plane calls (heartbeats, assignments, status posts).
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for artifact downloads, which can be large.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of one HTTP exchange. A failed network exchange surfaces as
/// status 0 rather than an error; callers decide policy.
#[derive(Debug, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Thin wrapper around one shared reqwest client. Per-request options are
/// set per call, so the client can be reused freely across requests.
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("plum-agent/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .expect("failed to build reqwest client");
        Self { client }
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        timeout: Duration,
    ) -> HttpResponse {
        let res = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await;
        collect(res).await
    }

    pub async fn get(&self, url: &str, timeout: Duration) -> HttpResponse {
        let res = self.client.get(url).timeout(timeout).send().await;
        collect(res).await
    }

    pub async fn delete(&self, url: &str, timeout: Duration) -> HttpResponse {
        let res = self.client.delete(url).timeout(timeout).send().await;
        collect(res).await
    }

    /// Consume an unbounded response body, invoking `on_chunk` for each
    /// received fragment. Returns when the server closes the connection or
    /// the shutdown flag flips; no overall deadline applies.
    pub async fn stream<F>(
        &self,
        url: &str,
        mut on_chunk: F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()>
    where
        F: FnMut(&[u8]),
    {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        let mut body = resp.bytes_stream();
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => on_chunk(&bytes),
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                }
            }
        }
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn collect(res: Result<reqwest::Response, reqwest::Error>) -> HttpResponse {
    match res {
        Ok(resp) => {
            let status = resp.status().as_u16();
            match resp.bytes().await {
                Ok(bytes) => HttpResponse {
                    status,
                    body: bytes.to_vec(),
                },
                Err(_) => HttpResponse::default(),
            }
        }
        Err(_) => HttpResponse::default(),
    }
}
