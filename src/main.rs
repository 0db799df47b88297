use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pgfe::backend::StaticBackend;
use pgfe::config::Config;
use pgfe::pg::PgServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pgfe=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    info!("Configuration loaded: {:?}", config);

    let server = Arc::new(PgServer::new(&config, Arc::new(StaticBackend)));
    let addr = server
        .start(&config.listen_host, &config.listen_service)
        .await?;

    info!("Connect with: psql -h {} -p {} -U postgres", addr.ip(), addr.port());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    server.stop().await?;
    Ok(())
}
