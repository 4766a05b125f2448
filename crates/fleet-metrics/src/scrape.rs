//! Exposition scrape against a single runner.
//!
//! Opens a plain TCP connection and speaks HTTP/1.1 over it with hyper so
//! the connect error keeps its `io::ErrorKind`, which is what tells a
//! runner that is still booting apart from one whose task is gone.

use std::io;
use std::time::Duration;

use http_body_util::BodyExt;
use tracing::debug;

/// Why a scrape produced no payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeFailure {
    /// The deadline passed. The runner is alive but not answering.
    Timeout,
    /// Nothing listens on the port yet.
    Refused,
    /// The runner's network interface is gone.
    Unreachable,
    /// Any other transport or HTTP error.
    Other(String),
}

impl ScrapeFailure {
    fn from_connect(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => ScrapeFailure::Refused,
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                ScrapeFailure::Unreachable
            }
            io::ErrorKind::TimedOut => ScrapeFailure::Timeout,
            _ => ScrapeFailure::Other(e.to_string()),
        }
    }
}

/// Fetch `http://{endpoint}{path}` and return the body text.
///
/// `endpoint` is `host:port`. The whole exchange (connect, request, body)
/// is bounded by `timeout`.
pub async fn scrape(endpoint: &str, path: &str, timeout: Duration) -> Result<String, ScrapeFailure> {
    match tokio::time::timeout(timeout, fetch(endpoint, path)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%endpoint, "scrape timed out");
            Err(ScrapeFailure::Timeout)
        }
    }
}

async fn fetch(endpoint: &str, path: &str) -> Result<String, ScrapeFailure> {
    let stream = tokio::net::TcpStream::connect(endpoint)
        .await
        .map_err(|e| {
            debug!(error = %e, %endpoint, "scrape connection failed");
            ScrapeFailure::from_connect(&e)
        })?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ScrapeFailure::Other(format!("handshake: {e}")))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", endpoint)
        .header("accept", "text/plain")
        .header("user-agent", "fleet-metrics/0.1")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .map_err(|e| ScrapeFailure::Other(format!("request: {e}")))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| ScrapeFailure::Other(format!("request: {e}")))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(ScrapeFailure::Other(format!("status {status}")));
    }

    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ScrapeFailure::Other(format!("body: {e}")))?
        .to_bytes();

    String::from_utf8(body.to_vec()).map_err(|_| ScrapeFailure::Other("body is not UTF-8".to_string()))
}
