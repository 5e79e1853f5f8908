//! Health probes.

use std::time::Duration;

use stackgrid_core::config::parse_duration;
use stackgrid_core::{HealthCheckConfig, ServiceNode};
use tracing::debug;

use crate::checker::ProbeResult;
use crate::readiness::BoxFuture;

/// Executes one health check against a node.
pub trait Prober: Send + Sync {
    fn probe<'a>(&'a self, node: &'a ServiceNode, config: &'a HealthCheckConfig) -> BoxFuture<'a, ProbeResult>;
}

/// Probes `GET http://{host}:{primary_port}{path}`.
#[derive(Debug, Clone)]
pub struct HttpProber {
    host: String,
}

impl HttpProber {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new("127.0.0.1")
    }
}

impl Prober for HttpProber {
    fn probe<'a>(&'a self, node: &'a ServiceNode, config: &'a HealthCheckConfig) -> BoxFuture<'a, ProbeResult> {
        Box::pin(async move {
            let Some(port) = node.primary_port() else {
                debug!(node = %node.id, "no port mapping to probe");
                return ProbeResult::Failed;
            };
            let timeout = parse_duration(&config.timeout).unwrap_or(Duration::from_secs(2));
            http_probe(&format!("{}:{port}", self.host), &config.path, timeout).await
        })
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "stackgrid-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "invalid health probe request");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "health probe timed out");
        ProbeResult::Failed
    })
}
