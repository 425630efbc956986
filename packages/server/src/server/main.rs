// Main entry point for the courier service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use courier_core::config::LogSection;
use courier_core::server::build_app;
use courier_core::{Config, Engine};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for the engine teardown after the listener stops.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(60);

fn init_tracing(log: &LogSection) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("{},sqlx=warn", log.level)));
    let registry = tracing_subscriber::registry().with(filter);
    if log.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    init_tracing(&config.log);

    tracing::info!("starting courier");

    let engine = Arc::new(
        Engine::init(&config)
            .await
            .context("failed to initialize task engine")?,
    );
    engine.start().await.context("failed to start task engine")?;

    let app = build_app(Arc::clone(&engine));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Err(err) = engine.shutdown(SHUTDOWN_DEADLINE).await {
        tracing::warn!(error = %err, "engine shutdown incomplete");
    }
    Ok(())
}
