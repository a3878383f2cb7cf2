//! Pooled HTTP client for forwarding requests to the gateway
//!
//! Connections to the loopback target are kept alive between requests so a
//! busy UI does not pay a TCP handshake per call.

use crate::config::GatewayTarget;
use crate::error::ProxyBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, CONNECTION};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Headers that describe a single connection and are never forwarded.
/// Upgrades take a separate path and keep theirs.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Connect refused, reset, malformed response
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections kept to the gateway
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Pooled client bound to the gateway target
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    target: GatewayTarget,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(target: GatewayTarget, config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            target = %target,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Gateway client pool initialized"
        );

        Self {
            client,
            target,
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn target(&self) -> GatewayTarget {
        self.target
    }

    /// Forward `req` to the gateway with method, path, query, end-to-end
    /// headers and body intact. The response comes back the same way.
    pub async fn send_request(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, PoolError> {
        let uri = self
            .target
            .url(req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/"));

        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let mut builder = Request::builder().method(parts.method).uri(&uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = parts.headers;
        }
        let outbound = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let response = self.client.request(outbound).await?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Remove connection-scoped headers, including any named by `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session-hint", HeaderValue::from_static("abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-request-id", HeaderValue::from_static("req-1"));
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key("x-request-id"));
        assert!(headers.contains_key("authorization"));
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let pool = ConnectionPool::new(
            GatewayTarget::loopback(18789),
            PoolConfig {
                max_idle_per_host: 5,
                idle_timeout: Duration::from_secs(30),
            },
        );

        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.target().port(), 18789);
    }
}
