mod api;
mod billing;
mod bootstrap;
mod config;
mod error;
mod ledger;
mod metering;
mod middleware;
mod providers;
mod server;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,credit_ledger=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env first so RUST_LOG from it is honoured
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting credit ledger service");

    let config = config::Config::from_env()?;
    info!(
        "📋 Store: {:?}, sweep every {}s (enabled: {})",
        config.store_backend, config.sweep_interval_secs, config.sweep_enabled
    );

    let state = bootstrap::initialize_app_state(&config).await?;

    // Create HTTP server
    let app = server::create_app(state, &server::ServerOptions::from(&config));

    // Run the Server
    server::run_server(app, &config.bind_address).await?;

    Ok(())
}
