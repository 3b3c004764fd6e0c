use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use portfolio_analytics::config::Config;
use portfolio_analytics::geo::IpApiResolver;
use portfolio_analytics::migrations::open_database;
use portfolio_analytics::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    info!("Starting portfolio analytics server...");

    let db = open_database(&config.database_path).await?;
    info!("Database ready at {}", config.database_path);

    let geo = Arc::new(IpApiResolver::from_config(&config)?);
    let addr = config.bind_address();
    let app = router(AppState::new(db, geo, config));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
