use boardgate::config::Config;
use boardgate::launcher::Launcher;
use boardgate::registry::{InstanceRegistry, RegistrySettings};
use boardgate::server::{GatewayServer, PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "boardgate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("boardgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    // Only the implicit default may be missing
    let config = if explicit_path.is_none() && !config_path.exists() {
        info!(path = %config_path.display(), "No configuration file, using defaults");
        Config::default()
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    print_startup_banner(&config);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let settings = RegistrySettings::from_config(&config.backend)?;
    let registry = InstanceRegistry::new(Launcher::new(config.backend.clone()), settings);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = GatewayServer::new(bind_addr, std::sync::Arc::clone(&registry), shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

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

    let _ = shutdown_tx.send(true);

    info!(count = registry.len(), "Stopping all instances...");
    registry.terminate_all(true).await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        command = %config.backend.command,
        version = config.backend.version.as_deref().unwrap_or("auto"),
        bind_all = config.backend.effective_bind_all(),
        purge_orphaned_data = config.backend.purge_orphaned_data,
        default_reload_interval_secs = config.backend.default_reload_interval_secs,
        "Backend defaults"
    );
    info!(
        startup_attempts = config.backend.startup_attempts,
        startup_interval_ms = config.backend.startup_interval_ms,
        shutdown_grace_period_secs = config.backend.shutdown_grace_period_secs,
        "Backend lifecycle"
    );
}
