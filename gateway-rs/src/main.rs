//! gateway-rs: domain-routed reverse proxy
//!
//! Usage: `gateway-rs [config.toml]`. Settings can also be given as
//! `GATEWAY__SECTION__KEY` environment variables.

use gateway_rs::{GatewayConfig, GatewayServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    let config = match &config_path {
        Some(path) => GatewayConfig::load(Some(path.as_path()))?,
        None if std::env::vars().any(|(key, _)| key.starts_with("GATEWAY__")) => GatewayConfig::load(None)?,
        None => GatewayConfig::development(),
    };

    init_logging(&config.logging.format);

    info!("Starting gateway-rs v{}", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("No config file specified"),
    }

    let server = Arc::new(GatewayServer::new(config)?);
    info!(
        "TLS: {}",
        if server.https_enabled() { "enabled (on-demand certificates)" } else { "disabled (HTTP only)" }
    );

    #[cfg(unix)]
    {
        if let Some(path) = config_path.clone() {
            tokio::spawn(reload_on_sighup(server.clone(), path));
        }
    }

    server.run(shutdown_signal()).await?;

    Ok(())
}

fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "gateway_rs=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Re-read the routes from the config file on every SIGHUP
#[cfg(unix)]
async fn reload_on_sighup(server: Arc<GatewayServer>, path: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!("Cannot listen for SIGHUP: {}", e);
            return;
        }
    };

    while hangups.recv().await.is_some() {
        info!("SIGHUP received, reloading routes from {}", path.display());
        match GatewayConfig::load(Some(path.as_path())) {
            Ok(config) => {
                server.update_routes(config.routes);
            }
            Err(e) => error!("Route reload failed, keeping current routes: {}", e),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
