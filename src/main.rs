//! ValueBot - Multi-Source Property Valuation Engine
//! Mission: Every public estimate for an address, streamed as it lands

use anyhow::{Context, Result};
use axum::middleware;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use valuebot_backend::{api, middleware::request_logging, Config, ValuationService};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing();

    info!("🚀 ValueBot valuation engine starting");
    info!("📊 History database: {}", config.database_path);

    let service = ValuationService::from_config(&config).context("Failed to build valuation service")?;
    info!("🗂️  History entries on disk: {}", service.history().len());

    let app = api::create_router(service)
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "valuebot=info,valuebot_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
