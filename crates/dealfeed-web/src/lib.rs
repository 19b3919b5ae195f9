//! Axum JSON endpoints: poll trigger, deal feed, run log.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use dealfeed_core::{DataOrigin, DealMessage, RunRecord};
use dealfeed_storage::DealStore;
use dealfeed_sync::{FeedConfig, PollPipeline, PollSummary};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "dealfeed-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<PollPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<PollPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub processed: usize,
    pub total: usize,
    pub timestamp: DateTime<Utc>,
    pub dev_mode: bool,
    pub origin: DataOrigin,
}

impl From<&PollSummary> for PollResponse {
    fn from(summary: &PollSummary) -> Self {
        Self {
            processed: summary.processed,
            total: summary.total,
            timestamp: summary.timestamp,
            dev_mode: summary.dev_mode,
            origin: summary.origin,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub dev_mode: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub origin: DataOrigin,
    pub messages: Vec<DealMessage>,
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn resolve(&self) -> usize {
        self.limit.unwrap_or(50).clamp(1, 200)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/poll", get(poll_handler).post(poll_handler))
        .route("/messages", get(messages_handler))
        .route("/runs", get(runs_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &FeedConfig, pipeline: Arc<PollPipeline>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, dev_mode = pipeline.dev_mode(), "serving deal feed");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn poll_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run_once().await {
        Ok(summary) => Json(PollResponse::from(&summary)).into_response(),
        Err(err) => {
            error!(error = %err, "poll request failed");
            server_error(&state, err.to_string())
        }
    }
}

async fn messages_handler(State(state): State<Arc<AppState>>, Query(query): Query<LimitQuery>) -> Response {
    let limit = query.resolve();
    match state.pipeline.store().recent_messages(limit).await {
        Ok(messages) if !messages.is_empty() => Json(MessagesResponse {
            origin: DataOrigin::Live,
            messages,
        })
        .into_response(),
        Ok(_) => {
            let mut messages = state.pipeline.fallback_records();
            messages.truncate(limit);
            Json(MessagesResponse {
                origin: DataOrigin::Fallback,
                messages,
            })
            .into_response()
        }
        Err(err) => server_error(&state, err.to_string()),
    }
}

async fn runs_handler(State(state): State<Arc<AppState>>, Query(query): Query<LimitQuery>) -> Response {
    match state.pipeline.store().recent_runs(query.resolve()).await {
        Ok(runs) => Json::<Vec<RunRecord>>(runs).into_response(),
        Err(err) => server_error(&state, err.to_string()),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "dev_mode": state.pipeline.dev_mode(),
    }))
    .into_response()
}

fn server_error(state: &AppState, error: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error,
            timestamp: Utc::now(),
            dev_mode: state.pipeline.dev_mode(),
        }),
    )
        .into_response()
}
