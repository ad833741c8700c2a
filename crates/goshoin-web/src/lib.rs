//! Axum routes for the bookstore directory: sync trigger and read APIs.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use goshoin_storage::{BookstoreQuery, BookstoreStore, StoreError};
use goshoin_sync::SyncPipeline;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "goshoin-web";

pub const SECRET_HEADER: &str = "x-secret-key";

const DEFAULT_LOG_LIMIT: usize = 5;
const MAX_LOG_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub cron_secret: Option<String>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("GOSHOIN_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            cron_secret: std::env::var("CRON_SECRET_KEY")
                .ok()
                .filter(|v| !v.is_empty()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BookstoreStore>,
    pub pipeline: Arc<SyncPipeline>,
    /// Without a configured secret the trigger rejects every caller.
    pub cron_secret: Option<String>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn BookstoreStore>,
        pipeline: Arc<SyncPipeline>,
        cron_secret: Option<String>,
    ) -> Self {
        Self {
            store,
            pipeline,
            cron_secret,
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.cron_secret.as_deref() else {
            return false;
        };
        headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|given| given == expected)
    }
}

#[derive(Debug, Deserialize, Default)]
struct UpdateLogsQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/cron/update-bookstores/manual", post(trigger_sync_handler))
        .route("/api/bookstores", get(bookstores_handler))
        .route("/api/update-logs", get(update_logs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &WebConfig, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn trigger_sync_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        warn!("rejected sync trigger without a valid secret");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Unauthorized" })),
        )
            .into_response();
    }
    let outcome = state.pipeline.run_once().await;
    Json(outcome).into_response()
}

async fn bookstores_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BookstoreQuery>,
) -> Response {
    match state.store.search_bookstores(&query).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn update_logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UpdateLogsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    match state.store.recent_update_logs(limit).await {
        Ok(logs) => Json(logs).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "store query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
