use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use questline_common::Config;
use questline_engine::{Engine, ScanTokenSigner, TokenService};
use questline_events::PgAuditLog;
use questline_hub::Hub;
use questline_store::{PgStore, StateStore};

mod auth;
mod error;
mod rest;
mod ws;

pub struct AppState {
    pub engine: Engine,
    pub store: Arc<dyn StateStore>,
    pub tokens: TokenService,
    pub hub: Hub,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("questline=info".parse()?))
        .init();

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    let store = Arc::new(PgStore::new(pool.clone()));
    store.ensure_schema().await?;
    let log = Arc::new(PgAuditLog::new(pool));
    log.ensure_schema().await?;

    let hub = Hub::new();
    let tokens = TokenService::new(&config.session_secret, config.token_issuer.clone());
    let engine = Engine::new(
        store.clone(),
        log,
        hub.clone(),
        ScanTokenSigner::new(config.scan_token_secret.clone()),
    );

    let state = Arc::new(AppState { engine, store, tokens, hub });

    let app = Router::new()
        // Health check
        .route("/", get(rest::health))
        // Sessions
        .route("/auth/session", post(rest::create_session))
        // Station host
        .route("/station/scan", post(rest::station_scan))
        .route("/station/visit/arrive", post(rest::visit_arrive))
        .route("/station/visit/start", post(rest::visit_start))
        .route("/station/visit/finish", post(rest::visit_finish))
        // Organizer
        .route("/admin/teams", post(rest::create_team))
        .route("/admin/teams/{team_id}/assign", post(rest::assign_team))
        .route("/admin/teams/{team_id}/recall", post(rest::recall_team))
        .route("/admin/teams/{team_id}/scan-token", post(rest::issue_scan_token))
        .route("/admin/stations", post(rest::create_station))
        .route("/admin/players", post(rest::register_player))
        .route("/admin/content", post(rest::create_content))
        .route("/admin/content/{content_block_id}/deliver", post(rest::deliver_content))
        .route("/admin/threads", post(rest::create_thread))
        .route("/admin/threads/{thread_id}/messages", post(rest::create_message))
        .route("/admin/log", get(rest::read_log))
        // Player
        .route("/player/dialogues/{key}", get(rest::leaked_thread))
        .route("/player/dialogues/{key}/reply", post(rest::dialogue_reply))
        .route("/player/ratings", post(rest::submit_rating))
        // Live updates
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        // Logging layer: method + path + status + latency only
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        );

    let addr = format!("{}:{}", config.web_host, config.web_port);
    info!("Questline starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
