mod api;
mod bootstrap;
mod config;
mod error;
mod ledger;
mod middleware;
mod orders;
mod payments;
mod queue;
mod reconcile;
mod server;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,printshop=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal(notify: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for ctrl-c");
    }
    info!("🛑 Shutdown signal received");
    let _ = notify.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting print-shop token ledger backend");

    let config = config::Config::load().context("failed to load configuration")?;
    let bind_address = config.server.bind_address.clone();
    let reconcile_enabled = config.reconcile.enabled;

    let application = bootstrap::initialize_app_state(config)
        .await
        .context("failed to initialize application")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = if reconcile_enabled {
        Some(application.reconciler.clone().start(shutdown_rx))
    } else {
        info!("Dispatch reconciler disabled");
        None
    };

    let app = server::create_app(application.state);

    server::run_server(app, &bind_address, shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    if let Some(handle) = reconciler {
        if let Err(e) = handle.await {
            error!(error = %e, "Dispatch reconciler task panicked");
        }
    }

    info!("👋 Server stopped");
    Ok(())
}
