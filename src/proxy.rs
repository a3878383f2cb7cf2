use crate::error::{json_error_response, ProxyBody, ProxyErrorCode};
use crate::gateway::GatewayManager;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::setup::{is_setup_path, SetupApi, SETUP_PREFIX};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Largest upgrade response head accepted from the gateway
const MAX_UPGRADE_HEAD: usize = 16 * 1024;
/// Largest non-101 upgrade response body relayed to the client
const MAX_UPGRADE_REJECT_BODY: usize = 64 * 1024;

/// Reasons a connection is dropped without a response
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// An upgrade cannot be redirected or answered with an error page, so the
    /// connection is closed instead
    #[error("upgrade refused: {0}")]
    UpgradeRefused(String),
}

/// State shared by every connection
struct ProxyContext {
    gateway: Arc<GatewayManager>,
    setup: Arc<SetupApi>,
    pool: ConnectionPool,
    request_timeout: Option<Duration>,
}

/// The public listener: setup namespace, configuration gate and reverse proxy
pub struct ProxyServer {
    bind_addr: SocketAddr,
    context: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        gateway: Arc<GatewayManager>,
        setup: Arc<SetupApi>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(bind_addr, gateway, setup, shutdown_rx, PoolConfig::default(), None)
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        gateway: Arc<GatewayManager>,
        setup: Arc<SetupApi>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
        request_timeout: Option<Duration>,
    ) -> Self {
        let pool = ConnectionPool::new(gateway.target(), pool_config);
        Self {
            bind_addr,
            context: Arc::new(ProxyContext {
                gateway,
                setup,
                pool,
                request_timeout,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(
            addr = %self.bind_addr,
            target = %self.context.gateway.target(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, context: Arc<ProxyContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    context: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, ProxyError> {
    // The setup namespace always answers, configured or not
    if is_setup_path(req.uri().path()) {
        return Ok(context.setup.handle(req).await);
    }

    let upgrade = is_upgrade_request(&req);
    let gateway = &context.gateway;

    if !gateway.is_configured() {
        if upgrade {
            debug!(uri = %req.uri(), "Closing upgrade while unconfigured");
            return Err(ProxyError::UpgradeRefused("gateway is not configured".to_string()));
        }
        debug!(uri = %req.uri(), "Not configured, redirecting to setup");
        return Ok(redirect_to_setup());
    }

    if let Err(e) = gateway.ensure_running().await {
        if upgrade {
            warn!(uri = %req.uri(), error = %e, "Closing upgrade, gateway unavailable");
            return Err(ProxyError::UpgradeRefused(e.to_string()));
        }
        error!(uri = %req.uri(), error = %e, "Gateway unavailable");
        return Ok(json_error_response(e.code(), format!("Gateway not ready: {}", e)));
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Overwrite rather than append: this proxy is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(method = %req.method(), uri = %req.uri(), request_id, upgrade, "Proxying request");

    if upgrade {
        return Ok(handle_upgrade(req, context.pool.target().addr(), request_id).await);
    }

    let forwarded = context.pool.send_request(req);
    let result = match context.request_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, forwarded).await {
            Ok(result) => result,
            Err(_) => {
                warn!(request_id, timeout_secs = timeout.as_secs(), "Request timed out");
                return Ok(json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request timed out after {} seconds", timeout.as_secs()),
                ));
            }
        },
        None => forwarded.await,
    };

    match result {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(request_id, target = %context.pool.target(), error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to gateway",
            ))
        }
    }
}

fn redirect_to_setup() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, SETUP_PREFIX)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("Redirecting to setup"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Get the value of the Upgrade header
fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Replay the upgrade request head for the gateway, pointing Host at it
fn build_upgrade_request<B>(req: &Request<B>, target: SocketAddr) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", target));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Position just past the blank line ending a response head
fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse the status line and headers of the gateway's upgrade response
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Read from the gateway until a full response head has arrived.
/// Returns the buffer and the offset where the head ends.
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, usize)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "gateway closed connection before responding to upgrade",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            return Ok((buf, end));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
    }
}

/// Forward bytes bidirectionally between client and gateway connections
async fn forward_bidirectional(client: Upgraded, backend: TcpStream, early: Vec<u8>, request_id: &str) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;

    // Frames the gateway sent right behind its 101
    if !early.is_empty() {
        if let Err(e) = client_io.write_all(&early).await {
            debug!(request_id, error = %e, "Failed to relay early upgrade bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                request_id,
                client_to_backend, backend_to_client, "WebSocket connection closed normally"
            );
        }
        Err(e) => {
            debug!(request_id, error = %e, "WebSocket connection closed with error");
        }
    }
}

/// Tunnel an upgrade request to the gateway
async fn handle_upgrade(req: Request<Incoming>, target: SocketAddr, request_id: String) -> Response<ProxyBody> {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, target);

    let mut backend_stream = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(target = %target, error = %e, "Failed to connect to gateway for upgrade");
            return json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to gateway",
            );
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(target = %target, error = %e, "Failed to send upgrade request to gateway");
        return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to send upgrade request");
    }

    let (buf, head_end) = match read_response_head(&mut backend_stream).await {
        Ok(read) => read,
        Err(e) => {
            error!(target = %target, error = %e, "Failed to read upgrade response from gateway");
            return json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from gateway",
            );
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&buf[..head_end]) {
        Some(parsed) => parsed,
        None => {
            error!(target = %target, "Failed to parse gateway upgrade response");
            return json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Invalid upgrade response from gateway",
            );
        }
    };
    let remainder = buf[head_end..].to_vec();

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(request_id, status = %status, "Gateway rejected upgrade request");
        return relay_rejection(status, &response_headers, remainder, &mut backend_stream).await;
    }

    info!(request_id, upgrade_type, "WebSocket upgrade successful");

    // Framing headers are hyper's business
    let response = relayed_response(
        StatusCode::SWITCHING_PROTOCOLS,
        &response_headers,
        &["content-length", "transfer-encoding"],
        empty_body(),
    );

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(request_id, "Client upgrade complete, starting forwarding");
                forward_bidirectional(upgraded, backend_stream, remainder, &request_id).await;
            }
            Err(e) => {
                error!(request_id, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    response
}

/// Relay a non-101 answer to an upgrade, including a bounded body
async fn relay_rejection(
    status: StatusCode,
    headers: &[(String, String)],
    mut body: Vec<u8>,
    backend: &mut TcpStream,
) -> Response<ProxyBody> {
    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .map(|len| len.min(MAX_UPGRADE_REJECT_BODY));

    if let Some(expected) = content_length {
        let mut chunk = [0u8; 4096];
        while body.len() < expected {
            match backend.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
            }
        }
        body.truncate(expected);
    }

    relayed_response(
        status,
        headers,
        &["content-length", "transfer-encoding", "connection"],
        Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed(),
    )
}

/// Rebuild a response from raw gateway header lines. Names or values that
/// are not valid HTTP are dropped.
fn relayed_response(
    status: StatusCode,
    headers: &[(String, String)],
    skip: &[&str],
    body: ProxyBody,
) -> Response<ProxyBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;

    for (name, value) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(header = %name, "Dropping invalid header name from gateway");
            continue;
        };
        if skip.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            response.headers_mut().append(name, value);
        }
    }

    response
}

fn empty_body() -> ProxyBody {
    http_body_util::Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().method("GET").uri("/ws?room=1");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_is_upgrade_request() {
        assert!(is_upgrade_request(&request(&[
            ("Connection", "keep-alive, Upgrade"),
            ("Upgrade", "websocket"),
        ])));
        assert!(!is_upgrade_request(&request(&[("Upgrade", "websocket")])));
        assert!(!is_upgrade_request(&request(&[("Connection", "upgrade")])));
        assert!(!is_upgrade_request(&request(&[])));
    }

    #[test]
    fn test_get_upgrade_type() {
        let req = request(&[("Upgrade", "WebSocket")]);
        assert_eq!(get_upgrade_type(&req).as_deref(), Some("websocket"));
    }

    #[test]
    fn test_build_upgrade_request_rewrites_host() {
        let req = request(&[
            ("Host", "public.example.com"),
            ("Connection", "Upgrade"),
            ("Upgrade", "websocket"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ]);
        let target: SocketAddr = "127.0.0.1:18789".parse().unwrap();
        let raw = String::from_utf8(build_upgrade_request(&req, target)).unwrap();

        assert!(raw.starts_with("GET /ws?room=1 HTTP/1.1\r\n"));
        assert!(raw.contains("sec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n"));
        assert!(raw.contains("Host: 127.0.0.1:18789\r\n"));
        assert!(!raw.contains("public.example.com"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_upgrade_response() {
        let data = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: abc=\r\n\r\n";
        let (status, headers) = parse_upgrade_response(data).unwrap();

        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1], ("Sec-WebSocket-Accept".to_string(), "abc=".to_string()));
    }

    #[test]
    fn test_parse_upgrade_response_rejects_garbage() {
        assert!(parse_upgrade_response(b"garbage").is_none());
        assert!(parse_upgrade_response(b"HTTP/1.1 abc Nope\r\n\r\n").is_none());
    }

    #[test]
    fn test_find_head_end() {
        let data = b"HTTP/1.1 101 OK\r\nA: b\r\n\r\n\x81\x02hi";
        let end = find_head_end(data).unwrap();
        assert_eq!(&data[end..], b"\x81\x02hi");
        assert!(find_head_end(b"HTTP/1.1 101 OK\r\n").is_none());
    }

    #[test]
    fn test_relayed_response_drops_invalid_header_names() {
        let data = b"HTTP/1.1 101 Switching Protocols\r\nBad Header: x\r\nUpgrade: websocket\r\nContent-Length: 0\r\nX-Ok: \x01\r\n\r\n";
        let (status, headers) = parse_upgrade_response(data).unwrap();
        assert_eq!(headers.len(), 4);

        let response = relayed_response(status, &headers, &["content-length"], empty_body());

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers().len(), 1);
        assert_eq!(response.headers().get("upgrade").unwrap(), "websocket");
    }

    #[test]
    fn test_redirect_to_setup() {
        let response = redirect_to_setup();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get("location").unwrap(), "/setup");
    }
}
