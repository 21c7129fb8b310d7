mod api;
mod auth;
mod broker;
mod channel;
mod config;
mod error;
mod tunnel;

use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::auth::SessionToken;
use crate::broker::Registry;
use crate::config::{Cli, Config};
use crate::tunnel::TunnelSupervisor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    let cli = Cli::parse();
    let config = Config::from_env_and_cli(&cli);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("copilot_bridge=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .init();

    let token = SessionToken::generate();
    let registry = Registry::new();

    let tunnel = if config.tunnel_enabled {
        match TunnelSupervisor::start(&config).await {
            Ok(t) => {
                tracing::info!(url = %t.url, "tunnel established");
                Some(t)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to start tunnel, continuing without one");
                None
            }
        }
    } else {
        None
    };

    let app_state = AppState {
        config: Arc::new(config.clone()),
        registry: registry.clone(),
        token: token.clone(),
    };

    let app = api::create_app(app_state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    let bound_addr = listener.local_addr()?;

    println!("Listening on http://{bound_addr}");
    println!("Session token: {}", token.as_str());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown().await;
    if let Some(tunnel) = tunnel {
        tunnel.shutdown().await;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
