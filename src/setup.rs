//! Setup namespace: password-gated HTTP handlers under `/setup`
//!
//! The handlers are thin: they shell out to the wrapped CLI through
//! [`crate::runner`], touch the configuration artifact on disk and ask the
//! [`GatewayManager`] to apply the result.

use crate::archive::{self, ArchiveError};
use crate::config::SetupConfig;
use crate::error::{json_error_response, GatewayError, ProxyBody, ProxyErrorCode};
use crate::gateway::{GatewayManager, GatewayStatus};
use crate::redact::Redactor;
use crate::runner::{run_cli, RunOutput};
use crate::setup_page;
use base64::Engine;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE, WWW_AUTHENTICATE,
};
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Root of the setup namespace
pub const SETUP_PREFIX: &str = "/setup";

/// Version of the wrapper reported by the status endpoint
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const MAX_JSON_BODY: usize = 1024 * 1024;
const DEFAULT_LOG_TAIL: u32 = 200;
const MAX_LOG_TAIL: u32 = 1000;
const MAX_IDENTIFIER_LEN: usize = 128;

/// Whether `path` belongs to the setup namespace
pub fn is_setup_path(path: &str) -> bool {
    path == SETUP_PREFIX || path.starts_with("/setup/")
}

#[derive(Debug)]
struct ApiError {
    code: ProxyErrorCode,
    message: String,
}

impl ApiError {
    fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ProxyErrorCode::BadRequest, message)
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(ProxyErrorCode::InternalError, err.to_string())
    }

    fn into_response(self) -> Response<ProxyBody> {
        json_error_response(self.code, self.message)
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(err)
    }
}

impl From<ArchiveError> for ApiError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Invalid(msg) => Self::new(ProxyErrorCode::InvalidArchive, msg),
            ArchiveError::Io(e) => Self::internal(e),
        }
    }
}

type ApiResult = Result<Response<ProxyBody>, ApiError>;

/// Result of a CLI call as returned to the browser
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CliResponse {
    pub ok: bool,
    pub exit_code: i32,
    /// Combined stdout/stderr with credentials removed
    pub output: String,
}

impl CliResponse {
    fn message(ok: bool, output: impl Into<String>) -> Self {
        Self {
            ok,
            exit_code: if ok { 0 } else { 1 },
            output: output.into(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    configured: bool,
    config_path: PathBuf,
    gateway: GatewayStatus,
    cli_version: Option<String>,
    wrapper_version: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct RunRequest {
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConsoleRequest {
    cmd: String,
    #[serde(default)]
    arg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigWriteRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
struct PairingRequest {
    channel: String,
    code: String,
}

/// Handlers for the setup namespace
pub struct SetupApi {
    gateway: Arc<GatewayManager>,
    config: SetupConfig,
    redactor: Redactor,
}

impl SetupApi {
    pub fn new(gateway: Arc<GatewayManager>, config: SetupConfig) -> Arc<Self> {
        let redactor = Redactor::new([
            gateway.config().token().to_string(),
            config.password.clone().unwrap_or_default(),
        ]);
        Arc::new(Self {
            gateway,
            config,
            redactor,
        })
    }

    /// Answer a request inside the setup namespace. Never redirects.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = normalize_path(req.uri().path()).to_string();

        debug!(%method, %path, "Setup request");

        if method == Method::GET && path == "/setup/healthz" {
            return json_response(StatusCode::OK, &serde_json::json!({ "ok": true }));
        }

        if let Err(response) = self.authorize(req.headers()) {
            return response;
        }

        let result = match (&method, path.as_str()) {
            (&Method::GET, "/setup") => Ok(setup_page::serve_setup_page()),
            (&Method::GET, "/setup/api/status") => self.status().await,
            (&Method::POST, "/setup/api/run") => self.run_onboarding(req).await,
            (&Method::POST, "/setup/api/console") => self.console(req).await,
            (&Method::GET, "/setup/api/config/raw") => self.read_config().await,
            (&Method::POST, "/setup/api/config/raw") => self.write_config(req).await,
            (&Method::POST, "/setup/api/reset") => self.reset().await,
            (&Method::POST, "/setup/api/pairing/approve") => self.approve_pairing(req).await,
            (&Method::GET, "/setup/export") => self.export().await,
            (&Method::POST, "/setup/import") => self.import(req).await,
            _ => Err(ApiError::new(ProxyErrorCode::NotFound, "Not found")),
        };

        result.unwrap_or_else(|e| {
            if e.code == ProxyErrorCode::InternalError {
                error!(%method, %path, error = %e.message, "Setup request failed");
            } else {
                debug!(%method, %path, code = e.code.as_header_value(), error = %e.message, "Setup request rejected");
            }
            e.into_response()
        })
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), Response<ProxyBody>> {
        let Some(expected) = self.config.password.as_deref().filter(|p| !p.is_empty()) else {
            return Err(json_error_response(
                ProxyErrorCode::SetupDisabled,
                "Setup is disabled: set SETUP_PASSWORD",
            ));
        };

        let authorized = basic_auth_password(headers)
            .is_some_and(|supplied| constant_time_eq(supplied.as_bytes(), expected.as_bytes()));
        if authorized {
            return Ok(());
        }

        debug!("Setup request without valid credentials");
        let mut response = json_error_response(ProxyErrorCode::Unauthorized, "Authentication required");
        response
            .headers_mut()
            .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"setup\""));
        Err(response)
    }

    /// Run a CLI subcommand bounded by the setup command timeout
    async fn cli<S: AsRef<str>>(&self, args: &[S]) -> Result<RunOutput, ApiError> {
        let timeout = self.config.command_timeout();
        match tokio::time::timeout(timeout, run_cli(self.gateway.config(), args)).await {
            Ok(output) => Ok(output),
            Err(_) => {
                let first = args.first().map(|a| a.as_ref().to_string()).unwrap_or_default();
                warn!(command = %first, timeout_secs = timeout.as_secs(), "CLI command timed out");
                Err(ApiError::new(
                    ProxyErrorCode::CommandTimeout,
                    format!("command timed out after {} seconds", timeout.as_secs()),
                ))
            }
        }
    }

    fn cli_response(&self, output: RunOutput) -> CliResponse {
        CliResponse {
            ok: output.success(),
            exit_code: output.exit_code,
            output: self.redactor.redact(&output.output),
        }
    }

    fn lifecycle_response(&self, result: Result<(), GatewayError>, success: &str) -> CliResponse {
        match result {
            Ok(()) => CliResponse::message(true, success),
            Err(e) => CliResponse::message(false, self.redactor.redact(&e.to_string())),
        }
    }

    async fn status(&self) -> ApiResult {
        let cli_version = match self.cli(&["--version"]).await {
            Ok(output) if output.success() => Some(self.redactor.redact(output.output.trim())),
            _ => None,
        };

        let body = StatusResponse {
            configured: self.gateway.is_configured(),
            config_path: self.gateway.config().config_path(),
            gateway: self.gateway.status(),
            cli_version,
            wrapper_version: VERSION,
        };
        Ok(json_response(StatusCode::OK, &body))
    }

    async fn run_onboarding(&self, req: Request<Incoming>) -> ApiResult {
        let request: RunRequest = read_json(req).await?;
        let gateway = self.gateway.config();

        tokio::fs::create_dir_all(&gateway.state_dir).await?;
        tokio::fs::create_dir_all(&gateway.workspace_dir).await?;

        let mut args = vec![
            "onboard".to_string(),
            "--non-interactive".to_string(),
            "--workspace".to_string(),
            gateway.workspace_dir.display().to_string(),
        ];
        args.extend(request.args);

        info!(extra_args = args.len() - 4, "Running onboarding");
        let output = self.cli(&args).await?;
        let mut response = self.cli_response(output);

        if response.ok && self.gateway.is_configured() {
            if let Err(e) = self.gateway.restart().await {
                warn!(error = %e, "Gateway did not start after onboarding");
                response.output.push_str(&format!("\n[gateway] {}\n", e));
            }
        }

        Ok(json_response(StatusCode::OK, &response))
    }

    async fn console(&self, req: Request<Incoming>) -> ApiResult {
        let request: ConsoleRequest = read_json(req).await?;
        let arg = request.arg.as_deref().map(str::trim).filter(|a| !a.is_empty());

        info!(cmd = %request.cmd, "Console command");

        let response = match request.cmd.as_str() {
            "gateway.start" => {
                self.lifecycle_response(self.gateway.ensure_running().await, "gateway started")
            }
            "gateway.stop" => {
                self.gateway.stop().await;
                CliResponse::message(true, "gateway stopped")
            }
            "gateway.restart" => {
                self.lifecycle_response(self.gateway.restart().await, "gateway restarted")
            }
            "cli.version" => self.cli_response(self.cli(&["--version"]).await?),
            "cli.status" => self.cli_response(self.cli(&["status"]).await?),
            "cli.health" => self.cli_response(self.cli(&["health"]).await?),
            "cli.doctor" => self.cli_response(self.cli(&["doctor"]).await?),
            "cli.logs" => {
                let tail = parse_tail(arg)?.to_string();
                self.cli_response(self.cli(&["logs", "--tail", tail.as_str()]).await?)
            }
            "cli.config.get" => {
                let key = arg.ok_or_else(|| ApiError::bad_request("cli.config.get requires a key"))?;
                validate_config_key(key)?;
                self.cli_response(self.cli(&["config", "get", key]).await?)
            }
            other => {
                return Err(ApiError::bad_request(format!("command '{}' is not allowed", other)));
            }
        };

        Ok(json_response(StatusCode::OK, &response))
    }

    async fn read_config(&self) -> ApiResult {
        let path = self.gateway.config().config_path();
        let (exists, content) = match tokio::fs::read_to_string(&path).await {
            Ok(content) => (true, content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (false, String::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({ "path": path, "exists": exists, "content": content }),
        ))
    }

    async fn write_config(&self, req: Request<Incoming>) -> ApiResult {
        let request: ConfigWriteRequest = read_json(req).await?;
        let path = self.gateway.config().config_path();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let backup = if tokio::fs::try_exists(&path).await? {
            let backup = backup_path(&path);
            tokio::fs::copy(&path, &backup).await?;
            Some(backup)
        } else {
            None
        };

        tokio::fs::write(&path, request.content.as_bytes()).await?;
        info!(path = %path.display(), bytes = request.content.len(), "Configuration written");

        let was_running = self.gateway.is_running();
        let restart_error = if was_running {
            self.gateway.restart().await.err().map(|e| e.to_string())
        } else {
            None
        };

        Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({
                "ok": true,
                "path": path,
                "backup": backup,
                "restarted": was_running && restart_error.is_none(),
                "error": restart_error,
            }),
        ))
    }

    async fn reset(&self) -> ApiResult {
        self.gateway.stop().await;

        let path = self.gateway.config().config_path();
        let removed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), removed, "Configuration reset");

        Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({ "ok": true, "removed": removed }),
        ))
    }

    async fn approve_pairing(&self, req: Request<Incoming>) -> ApiResult {
        let request: PairingRequest = read_json(req).await?;
        validate_identifier("channel", &request.channel)?;
        validate_identifier("code", &request.code)?;

        info!(channel = %request.channel, "Approving pairing");
        let output = self
            .cli(&["pairing", "approve", request.channel.as_str(), request.code.as_str()])
            .await?;
        Ok(json_response(StatusCode::OK, &self.cli_response(output)))
    }

    async fn export(&self) -> ApiResult {
        let gateway = self.gateway.config();
        let root = self.config.backup_root.clone();
        let state_dir = gateway.state_dir.clone();
        let workspace_dir = gateway.workspace_dir.clone();

        let data = tokio::task::spawn_blocking(move || {
            archive::export_dirs(&root, &[state_dir.as_path(), workspace_dir.as_path()])
        })
        .await
        .map_err(ApiError::internal)??;

        let disposition = format!("attachment; filename=\"{}\"", backup_file_name(Utc::now()));

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/gzip")
            .header(CONTENT_DISPOSITION, disposition)
            .body(full(data))
            .map_err(ApiError::internal)
    }

    async fn import(&self, req: Request<Incoming>) -> ApiResult {
        let limit = self.config.max_import_bytes;
        let body = match Limited::new(req.into_body(), limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return Err(ApiError::new(
                    ProxyErrorCode::PayloadTooLarge,
                    format!("backup exceeds {} bytes", limit),
                ));
            }
            Err(e) => return Err(ApiError::bad_request(format!("failed to read upload: {}", e))),
        };
        if body.is_empty() {
            return Err(ApiError::bad_request("empty upload"));
        }

        // Reject bad uploads before the gateway is touched
        let candidate = body.clone();
        tokio::task::spawn_blocking(move || archive::validate_archive(&candidate))
            .await
            .map_err(ApiError::internal)??;

        self.gateway.stop().await;

        let dest = self.config.backup_root.clone();
        let imported = tokio::task::spawn_blocking(move || archive::import_archive(&body, &dest))
            .await
            .map_err(ApiError::internal)
            .and_then(|result| result.map_err(ApiError::from));

        // The gateway comes back whenever an artifact exists, even after a failed unpack
        let configured = self.gateway.is_configured();
        let restart_error = if configured {
            self.gateway.ensure_running().await.err().map(|e| e.to_string())
        } else {
            None
        };

        let summary = match imported {
            Ok(summary) => summary,
            Err(e) => {
                warn!(
                    error = %e.message,
                    restarted = configured && restart_error.is_none(),
                    "Backup import failed after the gateway was stopped"
                );
                return Err(e);
            }
        };

        Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({
                "ok": true,
                "entries": summary.entries,
                "restarted": configured && restart_error.is_none(),
                "error": restart_error,
            }),
        ))
    }
}

fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(full(bytes))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => json_error_response(ProxyErrorCode::InternalError, e.to_string()),
    }
}

/// Parse a JSON body; an empty body reads as `{}`
async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, ApiError> {
    let bytes = Limited::new(req.into_body(), MAX_JSON_BODY)
        .collect()
        .await
        .map_err(|e| ApiError::bad_request(format!("failed to read body: {}", e)))?
        .to_bytes();

    let body: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        &bytes
    };
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {}", e)))
}

/// Password from an `Authorization: Basic` header. The username is ignored.
fn basic_auth_password(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (_, password) = decoded.split_once(':')?;
    Some(password.to_string())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn parse_tail(arg: Option<&str>) -> Result<u32, ApiError> {
    match arg {
        None => Ok(DEFAULT_LOG_TAIL),
        Some(raw) => raw
            .parse::<u32>()
            .map(|n| n.clamp(1, MAX_LOG_TAIL))
            .map_err(|_| ApiError::bad_request(format!("invalid tail count '{}'", raw))),
    }
}

fn validate_identifier(field: &str, value: &str) -> Result<(), ApiError> {
    // A leading dash would reach the CLI as a flag
    let valid = !value.is_empty()
        && value.len() <= MAX_IDENTIFIER_LEN
        && !value.starts_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!("invalid {}", field)))
    }
}

fn validate_config_key(key: &str) -> Result<(), ApiError> {
    let valid = key.len() <= MAX_IDENTIFIER_LEN
        && !key.starts_with('-')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!("invalid config key '{}'", key)))
    }
}

/// Download name for an export taken at `at`
fn backup_file_name(at: DateTime<Utc>) -> String {
    format!("gatewrap-backup-{}.tar.gz", at.format("%Y%m%d-%H%M%SZ"))
}

/// `<path>.bak` next to the artifact
fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        headers
    }

    fn basic(user: &str, password: &str) -> String {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, password));
        format!("Basic {}", encoded)
    }

    #[test]
    fn test_is_setup_path() {
        assert!(is_setup_path("/setup"));
        assert!(is_setup_path("/setup/"));
        assert!(is_setup_path("/setup/api/status"));
        assert!(!is_setup_path("/setupx"));
        assert!(!is_setup_path("/"));
        assert!(!is_setup_path("/api/setup"));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/setup/"), "/setup");
        assert_eq!(normalize_path("/setup/api/status"), "/setup/api/status");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_basic_auth_password_ignores_username() {
        assert_eq!(
            basic_auth_password(&headers_with(&basic("anyone", "s3cret"))).as_deref(),
            Some("s3cret")
        );
        assert_eq!(
            basic_auth_password(&headers_with(&basic("", "with:colon"))).as_deref(),
            Some("with:colon")
        );
        assert_eq!(basic_auth_password(&headers_with("Bearer s3cret")), None);
        assert_eq!(basic_auth_password(&headers_with("Basic !!!")), None);
        assert_eq!(basic_auth_password(&HeaderMap::new()), None);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_parse_tail() {
        assert_eq!(parse_tail(None).unwrap(), 200);
        assert_eq!(parse_tail(Some("50")).unwrap(), 50);
        assert_eq!(parse_tail(Some("5000")).unwrap(), 1000);
        assert_eq!(parse_tail(Some("0")).unwrap(), 1);
        assert!(parse_tail(Some("ten")).is_err());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("channel", "telegram").is_ok());
        assert!(validate_identifier("code", "AB-12_cd").is_ok());
        assert!(validate_identifier("code", "").is_err());
        assert!(validate_identifier("code", "a b").is_err());
        assert!(validate_identifier("code", "x;rm").is_err());
        assert!(validate_identifier("code", &"a".repeat(200)).is_err());
        assert!(validate_identifier("channel", "--help").is_err());
        assert!(validate_identifier("code", "-x").is_err());
        assert!(validate_identifier("code", "x-1").is_ok());
    }

    #[test]
    fn test_validate_config_key() {
        assert!(validate_config_key("gateway.port").is_ok());
        assert!(validate_config_key("--help").is_err());
        assert!(validate_config_key("a/b").is_err());
    }

    #[test]
    fn test_backup_file_name_is_utc_stamp() {
        let at = DateTime::parse_from_rfc3339("2026-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(backup_file_name(at), "gatewrap-backup-20260304-050607Z.tar.gz");
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/data/state/gateway.json")),
            PathBuf::from("/data/state/gateway.json.bak")
        );
    }

    #[test]
    fn test_cli_response_serializes_camel_case() {
        let json = serde_json::to_string(&CliResponse::message(false, "nope")).unwrap();
        assert_eq!(json, r#"{"ok":false,"exitCode":1,"output":"nope"}"#);
    }
}
