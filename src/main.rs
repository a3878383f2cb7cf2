use gatewrap::config::Config;
use gatewrap::gateway::GatewayManager;
use gatewrap::pool::PoolConfig;
use gatewrap::proxy::ProxyServer;
use gatewrap::setup::{SetupApi, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Config file picked up from the working directory when no path is given
const DEFAULT_CONFIG_FILE: &str = "gatewrap.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gatewrap=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = load_config()?;
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = GatewayManager::new(config.gateway.clone());
    let setup = SetupApi::new(gateway.clone(), config.setup.clone());

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::with_pool_config(
        addr,
        gateway.clone(),
        setup,
        shutdown_rx,
        pool_config,
        config.server.request_timeout(),
    );

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    info!("Stopping gateway...");
    gateway.stop().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Config file from argv, then `gatewrap.toml`, then built-in defaults;
/// environment overrides applied on top
fn load_config() -> anyhow::Result<Config> {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let fallback = Path::new(DEFAULT_CONFIG_FILE);

    let mut config = match explicit {
        Some(path) => load_file(&path)?,
        None if fallback.exists() => load_file(fallback)?,
        None => {
            info!("No configuration file, using defaults");
            Config::default()
        }
    };

    config.apply_env()?;

    if config.gateway.resolve_token()? {
        info!(
            state_dir = %config.gateway.state_dir.display(),
            "Generated gateway token (persisted in the state directory)"
        );
    }

    config.validate()?;
    Ok(config)
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let config = Config::load(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = VERSION,
        "Starting gateway wrapper"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Public listener"
    );
    info!(
        command = %config.gateway.command,
        target = %config.gateway.target(),
        state_dir = %config.gateway.state_dir.display(),
        workspace_dir = %config.gateway.workspace_dir.display(),
        config_path = %config.gateway.config_path().display(),
        "Gateway"
    );

    if config.setup.password_configured() {
        info!("Setup namespace enabled at /setup");
    } else {
        warn!("SETUP_PASSWORD is not set; the setup namespace is disabled");
    }
}
