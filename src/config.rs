use serde::Deserialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name (inside the state directory) used to persist a generated gateway token
pub const TOKEN_FILE_NAME: &str = "gateway.token";

/// Global configuration for the wrapper
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// How to launch and probe the wrapped gateway
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Setup namespace settings
    #[serde(default)]
    pub setup: SetupConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle connections kept open to the gateway (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for the gateway to answer a proxied request, 0 disables (default: 300)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Configuration of the wrapped gateway binary
///
/// # Security Warning
///
/// `command`, `base_args` and `env` are executed as given. The configuration
/// file must only be writable by the service user.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Executable of the wrapped CLI
    #[serde(default = "default_gateway_command")]
    pub command: String,

    /// Arguments placed before every subcommand (e.g. an entry script)
    #[serde(default)]
    pub base_args: Vec<String>,

    /// Arguments that make the CLI run as a server; `{port}` and `{token}` are substituted
    #[serde(default = "default_run_args")]
    pub run_args: Vec<String>,

    /// Loopback port the gateway listens on
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    /// Bearer token the gateway requires. Loaded or generated at startup when unset.
    pub token: Option<String>,

    /// State directory handed to the gateway
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Workspace directory handed to the gateway
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// Configuration artifact whose existence means "onboarding completed"
    /// (default: `<state_dir>/gateway.json`)
    pub config_path: Option<PathBuf>,

    /// Extra environment variables for every gateway and CLI invocation
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Total time to wait for the gateway port to answer after a spawn
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,

    /// Pause between readiness rounds
    #[serde(default = "default_ready_interval")]
    pub ready_interval_ms: u64,

    /// Paths probed in order each round; any HTTP response counts as ready
    #[serde(default = "default_ready_paths")]
    pub ready_paths: Vec<String>,

    /// Upper bound for a single readiness probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Wait after SIGTERM before the handle is dropped
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            command: default_gateway_command(),
            base_args: Vec::new(),
            run_args: default_run_args(),
            internal_port: default_internal_port(),
            token: None,
            state_dir: default_state_dir(),
            workspace_dir: default_workspace_dir(),
            config_path: None,
            env: HashMap::new(),
            ready_timeout_ms: default_ready_timeout(),
            ready_interval_ms: default_ready_interval(),
            ready_paths: default_ready_paths(),
            probe_timeout_ms: default_probe_timeout(),
            grace_period_ms: default_grace_period(),
        }
    }
}

impl GatewayConfig {
    pub fn config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("gateway.json"))
    }

    pub fn token(&self) -> &str {
        self.token.as_deref().unwrap_or_default()
    }

    pub fn target(&self) -> GatewayTarget {
        GatewayTarget::loopback(self.internal_port)
    }

    /// Full server argv (after the executable) with placeholders substituted
    pub fn server_args(&self) -> Vec<String> {
        let port = self.internal_port.to_string();
        self.base_args
            .iter()
            .cloned()
            .chain(self.run_args.iter().map(|arg| {
                arg.replace("{port}", &port).replace("{token}", self.token())
            }))
            .collect()
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Fill in `token` from the persisted token file, generating one if needed.
    /// Returns true when a new token was generated.
    pub fn resolve_token(&mut self) -> anyhow::Result<bool> {
        if self.token.as_deref().is_some_and(|t| !t.trim().is_empty()) {
            return Ok(false);
        }

        let token_path = self.state_dir.join(TOKEN_FILE_NAME);
        if let Ok(existing) = std::fs::read_to_string(&token_path) {
            let existing = existing.trim();
            if !existing.is_empty() {
                self.token = Some(existing.to_string());
                return Ok(false);
            }
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        std::fs::create_dir_all(&self.state_dir).map_err(|e| {
            anyhow::anyhow!("Failed to create state directory '{}': {}", self.state_dir.display(), e)
        })?;
        std::fs::write(&token_path, format!("{}\n", token)).map_err(|e| {
            anyhow::anyhow!("Failed to persist gateway token to '{}': {}", token_path.display(), e)
        })?;
        self.token = Some(token);
        Ok(true)
    }
}

/// Setup namespace configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SetupConfig {
    /// Password for the setup namespace. Setup is disabled when unset.
    pub password: Option<String>,

    /// Root directory that backups are relative to and imports restore into
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,

    /// Max runtime for a CLI call made on behalf of a setup request
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Largest accepted backup upload
    #[serde(default = "default_max_import_bytes")]
    pub max_import_bytes: usize,
}

impl SetupConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn password_configured(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            password: None,
            backup_root: default_backup_root(),
            command_timeout_secs: default_command_timeout(),
            max_import_bytes: default_max_import_bytes(),
        }
    }
}

/// Fixed loopback address of the gateway, computed once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayTarget {
    addr: SocketAddr,
}

impl GatewayTarget {
    pub fn loopback(port: u16) -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Absolute URL for a path (which must start with '/')
    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }
}

impl std::fmt::Display for GatewayTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.addr.fmt(f)
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    300
}

fn default_gateway_command() -> String {
    "gateway".to_string()
}

fn default_run_args() -> Vec<String> {
    [
        "gateway", "run", "--bind", "loopback", "--port", "{port}", "--auth", "token", "--token",
        "{token}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_internal_port() -> u16 {
    18789
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./data/state")
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("./data/workspace")
}

fn default_ready_timeout() -> u64 {
    20_000
}

fn default_ready_interval() -> u64 {
    250
}

fn default_ready_paths() -> Vec<String> {
    vec!["/".to_string(), "/health".to_string(), "/healthz".to_string()]
}

fn default_probe_timeout() -> u64 {
    1_000
}

fn default_grace_period() -> u64 {
    750
}

fn default_backup_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_command_timeout() -> u64 {
    120
}

fn default_max_import_bytes() -> usize {
    256 * 1024 * 1024
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides from the process environment
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` to resolve variable names
    pub fn apply_env_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = get("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid PORT '{}': {}", port, e))?;
        }
        if let Some(port) = get("INTERNAL_GATEWAY_PORT") {
            self.gateway.internal_port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid INTERNAL_GATEWAY_PORT '{}': {}", port, e))?;
        }
        if let Some(password) = get("SETUP_PASSWORD") {
            self.setup.password = Some(password);
        }
        if let Some(command) = get("GATEWAY_COMMAND") {
            let mut words = shell_words::split(&command)
                .map_err(|e| anyhow::anyhow!("Invalid GATEWAY_COMMAND '{}': {}", command, e))?;
            if words.is_empty() {
                anyhow::bail!("GATEWAY_COMMAND is empty");
            }
            self.gateway.command = words.remove(0);
            self.gateway.base_args = words;
        }
        if let Some(token) = get("GATEWAY_TOKEN") {
            self.gateway.token = Some(token.trim().to_string());
        }
        if let Some(dir) = get("GATEWAY_STATE_DIR") {
            self.gateway.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("GATEWAY_WORKSPACE_DIR") {
            self.gateway.workspace_dir = PathBuf::from(dir);
        }
        if let Some(path) = get("GATEWAY_CONFIG_PATH") {
            self.gateway.config_path = Some(PathBuf::from(path));
        }
        if let Some(root) = get("BACKUP_ROOT") {
            self.setup.backup_root = PathBuf::from(root);
        }

        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.gateway.command.trim().is_empty() {
            errors.push("gateway 'command' must not be empty".to_string());
        }
        if self.gateway.internal_port == 0 {
            errors.push("gateway 'internal_port' must be greater than 0".to_string());
        }
        if self.gateway.internal_port == self.server.port {
            errors.push(format!(
                "gateway 'internal_port' ({}) must differ from the public port",
                self.gateway.internal_port
            ));
        }
        if self.gateway.ready_interval_ms == 0 {
            errors.push("gateway 'ready_interval_ms' must be greater than 0".to_string());
        }
        if self.gateway.ready_paths.is_empty() {
            errors.push("gateway 'ready_paths' must list at least one path".to_string());
        }
        for path in &self.gateway.ready_paths {
            if !path.starts_with('/') {
                errors.push(format!("gateway ready path '{}' must start with '/'", path));
            }
        }
        if self.setup.max_import_bytes == 0 {
            errors.push("setup 'max_import_bytes' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
