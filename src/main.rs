use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::Router;
use sentinel_relay::{
    AppState, Settings, broadcast::Broadcaster, config::Config, creds, liveness,
    outbox::OutboxBridge, registry::Registry, relay, stats, store,
};
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = Config::from_env();
    let credentials = creds::resolve(&config).await?;

    // No resolvable store means live-relay-only service out of an
    // in-memory database: presence, typing and receipts still work, the
    // outbox just never has rows.
    let database_url = credentials.database_url.clone().unwrap_or_else(|| {
        warn!("serving degraded: no durable store configured");
        "sqlite::memory:".to_owned()
    });
    let db_pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(&database_url)
        .await
        .with_context(|| format!("connecting to store at {database_url}"))?;
    store::ensure_schema(&db_pool).await?;

    let registry = Registry::new();
    let broadcaster = Broadcaster::new(registry.clone());
    let settings = Arc::new(Settings {
        broadcast_secret: credentials.broadcast_secret,
        default_room: config.default_room.clone(),
        started: Instant::now(),
    });
    let app_state = AppState {
        db_pool: db_pool.clone(),
        registry: registry.clone(),
        broadcaster: broadcaster.clone(),
        settings,
    };

    let bridge = OutboxBridge::new(
        db_pool,
        broadcaster.clone(),
        config.poll_interval,
        config.delivery_grace,
        config.batch_size,
    );
    tokio::spawn(bridge.run());
    tokio::spawn(liveness::run_pinger(registry.clone(), config.ping_interval));
    tokio::spawn(liveness::run_reaper(
        registry.clone(),
        broadcaster,
        config.reap_interval,
        config.idle_timeout,
    ));

    let app = Router::new()
        .merge(relay::router())
        .merge(stats::router())
        .with_state(app_state)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cooperative shutdown: stop accepting (done above), then ask every
    // open connection to close.
    registry.close_all().await;
    info!("relay stopped");
    Ok(())
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    fmt().with_env_filter(env_filter).init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
}
