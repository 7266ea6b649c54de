use anyhow::Context;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use clinic_relay::{
    cli::Cli,
    config::Config,
    handlers::{
        consume_qr, create_mapping, create_registration, current_qr, end_mapping, generate_qr,
        get_mapping, get_registration, health_check, update_registration, validate_token,
        AppState,
    },
    rooms::RoomRegistry,
    storage::Storage,
    tokens::TokenVault,
    websocket::websocket_handler,
};

/// How often expired tokens are swept from the in-memory vault.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(redis_url) = cli.redis_url {
        config.redis_url = redis_url;
    }

    info!("starting clinic relay on port {}", config.port);
    info!("redis url: {}", config.redis_url);
    info!("record ttl: {} seconds", config.record_ttl_seconds);
    info!("public origin: {}", config.public_url);

    let storage = Storage::new(&config.redis_url, config.record_ttl_seconds)
        .await
        .context("failed to connect to redis")?;

    let state = AppState {
        rooms: Arc::new(RoomRegistry::new()),
        vault: Arc::new(TokenVault::with_ttl(config.record_ttl_seconds)),
        storage: Arc::new(storage),
    };

    // Periodic eviction keeps the in-memory vault aligned with the TTL
    // Redis applies to the persisted records.
    let sweeper = state.vault.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sweeper.sweep_expired();
        }
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/qr/generate", get(generate_qr))
        .route("/qr/current", get(current_qr))
        .route("/qr/validate/:token", get(validate_token))
        .route("/qr/consume/:token", post(consume_qr))
        .route("/device-doctor-mapping", post(create_mapping))
        .route("/device-doctor-mapping/:device_id", delete(end_mapping))
        .route("/device-doctor-mapping/device/:device_id", get(get_mapping))
        .route("/registration/:token", post(create_registration))
        .route("/registration/token/:token", get(get_registration))
        .route("/registration/token/:token", put(update_registration))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("clinic relay listening on {addr}");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
