use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use trivia_backend::api::{self, AppState};
use trivia_backend::auth;
use trivia_backend::config::{self, Config, LOCAL_USERNAME, LOCAL_USER_ID};
use trivia_backend::db::Database;
use trivia_backend::deadline;
use trivia_backend::engine::hub::SessionHub;
use trivia_backend::metrics;
use trivia_backend::rate_limit::RateLimiter;

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "trivia-backend" }))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::load();
    config::set_local_mode(config.local_mode);
    metrics::register_metrics();

    let db = Database::new(&config.database_url)
        .await
        .expect("Failed to initialize database");
    let db = Arc::new(db);

    if config.local_mode {
        db.ensure_local_user(LOCAL_USER_ID, LOCAL_USERNAME)
            .await
            .expect("Failed to create local user");
        tracing::info!("Local mode: auth and rate limits disabled");
    }

    // Sessions left live by a previous run still count.
    match db.list_live_sessions().await {
        Ok(live) => metrics::LIVE_SESSIONS.set(live.len() as i64),
        Err(e) => tracing::error!("Failed to count live sessions: {e}"),
    }

    let hub = Arc::new(SessionHub::new());
    let state = AppState::new(db.clone(), hub, RateLimiter::new());

    deadline::spawn_deadline_worker(state.live.clone(), config.deadline_poll);

    let mut app = Router::new()
        .route("/health", get(health_check))
        // Auth routes (no auth required)
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/me", get(auth::me))
        .with_state(db)
        .merge(api::router(state));

    if let Some(dir) = &config.static_dir {
        tracing::info!("Serving static files from {}", dir.display());
        app = app.fallback_service(ServeDir::new(dir));
    }

    let app = app
        .layer(axum::middleware::from_fn(api::track_requests))
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!("Trivia backend listening on {addr}");
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
