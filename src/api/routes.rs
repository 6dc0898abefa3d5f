use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::consolidate;
use crate::error::SweepError;
use crate::history::{load_entry, time_ago, SourceView};
use crate::models::{HistoryEntry, SweepReport};
use crate::service::ValuationService;
use crate::sources::Source;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: ValuationService,
}

/// Create the API router
pub fn create_router(service: ValuationService) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/valuations", post(full_sweep))
        .route("/api/valuations/stream", get(stream_valuations))
        .route("/api/valuations/consolidate", post(consolidate_estimates))
        .route("/api/sources", get(list_sources))
        .route("/api/history", get(list_history).delete(clear_history))
        .route("/api/history/:id", get(get_history_entry).delete(delete_history_entry))
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// NDJSON progress stream, one event per line, sentinel last
async fn stream_valuations(
    State(state): State<AppState>,
    Query(params): Query<AddressQuery>,
) -> Result<Response, ApiError> {
    let rx = state
        .service
        .start_stream(params.address.as_deref().unwrap_or_default())?;

    let lines = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let line = serde_json::to_vec(&event).map(|mut bytes| {
            bytes.push(b'\n');
            Bytes::from(bytes)
        });
        Some((line, rx))
    });

    Ok((
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(lines),
    )
        .into_response())
}

/// Fallback: the whole sweep in one response
async fn full_sweep(
    State(state): State<AppState>,
    Json(request): Json<AddressRequest>,
) -> Result<Json<SweepReport>, ApiError> {
    let report = state.service.full_sweep(&request.address).await?;
    Ok(Json(report))
}

async fn consolidate_estimates(Json(request): Json<ConsolidateRequest>) -> Result<Json<ConsolidateResponse>, ApiError> {
    let summary = consolidate::consolidate(&request.estimates)
        .ok_or_else(|| ApiError::Unprocessable("No estimates to consolidate".to_string()))?;

    Ok(Json(ConsolidateResponse {
        best_estimate: summary.best_estimate,
        median: summary.median,
        count: request.estimates.len(),
    }))
}

async fn list_sources(State(state): State<AppState>) -> Json<Vec<Source>> {
    Json(state.service.registry().iter().cloned().collect())
}

async fn list_history(State(state): State<AppState>) -> Json<HistoryResponse> {
    let now = Utc::now();
    let entries: Vec<HistoryItem> = state
        .service
        .history()
        .entries()
        .into_iter()
        .map(|entry| HistoryItem {
            time_ago: time_ago(entry.timestamp, now),
            entry,
        })
        .collect();

    Json(HistoryResponse {
        count: entries.len(),
        entries,
    })
}

async fn get_history_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HistoryDetail>, ApiError> {
    let entry = state
        .service
        .history()
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("History entry {} not found", id)))?;

    let sources = load_entry(&entry, state.service.registry());
    let values: Vec<f64> = entry.estimates.iter().map(|e| e.estimate).collect();
    let best_estimate = consolidate::consolidate(&values).map(|r| r.best_estimate);

    Ok(Json(HistoryDetail {
        time_ago: time_ago(entry.timestamp, Utc::now()),
        entry,
        sources,
        best_estimate,
    }))
}

async fn delete_history_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.service.history().remove(&id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("History entry {} not found", id)))
    }
}

async fn clear_history(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.service.history().clear()?;
    Ok(StatusCode::NO_CONTENT)
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct AddressQuery {
    address: Option<String>,
}

#[derive(Deserialize)]
struct AddressRequest {
    #[serde(default)]
    address: String,
}

#[derive(Deserialize)]
struct ConsolidateRequest {
    #[serde(default)]
    estimates: Vec<f64>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsolidateResponse {
    best_estimate: f64,
    median: f64,
    count: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryItem {
    #[serde(flatten)]
    entry: HistoryEntry,
    time_ago: String,
}

#[derive(Serialize)]
struct HistoryResponse {
    count: usize,
    entries: Vec<HistoryItem>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryDetail {
    #[serde(flatten)]
    entry: HistoryEntry,
    time_ago: String,
    sources: Vec<SourceView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    best_estimate: Option<f64>,
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Internal(anyhow::Error),
    NotFound(String),
    BadRequest(String),
    /// Well-formed input with nothing to work on
    Unprocessable(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<SweepError> for ApiError {
    fn from(err: SweepError) -> Self {
        match err {
            SweepError::InvalidAddress(_) => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Valuation failed, please retry".to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
