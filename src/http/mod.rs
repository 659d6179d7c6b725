//! Analyzer HTTP surface.
//!
//! Thin axum layer over the analyze flow, the triage orchestrator and the
//! store queries. Handlers map error kinds to status codes and never leak
//! internals: upstream failures become stable messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::analyze::{AnalyzeRequest, Analyzer};
use crate::db::Db;
use crate::error::Error;
use crate::model::TimeRange;
use crate::triage::{SubmitOutcome, TriageOrchestrator};

const DEFAULT_EVENTS_LIMIT: i64 = 50;
const DEFAULT_SUMMARIES_LIMIT: i64 = 24;
const MAX_SUMMARIES_LIMIT: i64 = 200;

pub struct AppState {
    pub db: Arc<Db>,
    pub analyzer: Analyzer,
    pub triage: Arc<TriageOrchestrator>,
    pub ready: Arc<AtomicBool>,
    pub max_events: i64,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/analyze", post(handle_analyze))
        .route("/events", get(handle_events))
        .route("/summaries", get(handle_summaries))
        .route("/triage/jobs", post(handle_create_triage_job))
        .route("/triage/jobs/{id}", get(handle_get_triage_job))
        .route("/healthz", get(handle_health))
        .route("/readyz", get(handle_ready))
        .layer(axum::middleware::from_fn(log_requests))
        .with_state(state)
}

/// Minimal probe router for services without a request API.
pub fn probe_router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { StatusCode::OK }))
        .route(
            "/readyz",
            get(move || async move {
                if ready.load(Ordering::SeqCst) {
                    StatusCode::OK.into_response()
                } else {
                    (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
                }
            }),
        )
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

/// Internal detail is logged; the client sees `public_message`.
fn map_error(e: Error, public_message: &str) -> ApiError {
    match e {
        Error::InvalidField(message) => ApiError::bad_request(message),
        Error::NotFound(message) => ApiError::not_found(message),
        other => {
            error!(error = %other, "{public_message}");
            ApiError::internal(public_message)
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn handle_analyze(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Response, ApiError> {
    let response = state
        .analyzer
        .analyze(req)
        .await
        .map_err(|e| map_error(e, "analysis failed"))?;
    Ok(Json(response).into_response())
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    start: Option<String>,
    end: Option<String>,
    limit: Option<String>,
}

async fn handle_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Response, ApiError> {
    let range = parse_time_range(&query)?;
    let limit = parse_limit(query.limit.as_deref(), DEFAULT_EVENTS_LIMIT, state.max_events)?;

    let events = state
        .db
        .fetch_events(range.as_ref(), limit)
        .await
        .map_err(|e| map_error(e, "failed to fetch events"))?;

    Ok(Json(json!({"events": events, "count": events.len()})).into_response())
}

async fn handle_summaries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> Result<Response, ApiError> {
    let range = parse_time_range(&query)?;
    let limit = parse_limit(
        query.limit.as_deref(),
        DEFAULT_SUMMARIES_LIMIT,
        MAX_SUMMARIES_LIMIT,
    )?;

    let summaries = state
        .db
        .fetch_summaries(range.as_ref(), limit)
        .await
        .map_err(|e| map_error(e, "failed to fetch summaries"))?;

    Ok(Json(json!({"summaries": summaries, "count": summaries.len()})).into_response())
}

#[derive(Debug, Deserialize)]
struct TriageJobRequest {
    time_range: TimeRange,
}

async fn handle_create_triage_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TriageJobRequest>,
) -> Result<Response, ApiError> {
    match state.triage.submit(req.time_range) {
        Ok(SubmitOutcome::Created { job_id, status }) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({"job_id": job_id, "status": status})),
        )
            .into_response()),
        Ok(SubmitOutcome::Existing(job)) => Ok(Json(job).into_response()),
        Err(e) => Err(map_error(e, "failed to create job")),
    }
}

async fn handle_get_triage_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    if job_id.is_empty() {
        return Err(ApiError::bad_request("job_id required"));
    }
    match state.triage.get(&job_id) {
        Some(job) => Ok(Json(job).into_response()),
        None => Err(ApiError::not_found("job not found")),
    }
}

async fn handle_health() -> StatusCode {
    StatusCode::OK
}

async fn handle_ready(State(state): State<Arc<AppState>>) -> Response {
    if state.ready.load(Ordering::SeqCst) {
        StatusCode::OK.into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

// ---------------------------------------------------------------------------
// Query parsing
// ---------------------------------------------------------------------------

fn parse_time_range(query: &RangeQuery) -> Result<Option<TimeRange>, ApiError> {
    let start_raw = query.start.as_deref().map(str::trim).unwrap_or("");
    let end_raw = query.end.as_deref().map(str::trim).unwrap_or("");

    if start_raw.is_empty() && end_raw.is_empty() {
        return Ok(None);
    }
    if start_raw.is_empty() || end_raw.is_empty() {
        return Err(ApiError::bad_request(
            "start and end query params are required together",
        ));
    }

    let start = parse_rfc3339(start_raw).ok_or_else(|| ApiError::bad_request("invalid start time"))?;
    let end = parse_rfc3339(end_raw).ok_or_else(|| ApiError::bad_request("invalid end time"))?;

    let range = TimeRange { start, end };
    range
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Some(range))
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn parse_limit(raw: Option<&str>, default: i64, max: i64) -> Result<i64, ApiError> {
    let raw = raw.map(str::trim).unwrap_or("");
    if raw.is_empty() {
        return Ok(default.min(max));
    }

    match raw.parse::<i64>() {
        Ok(limit) if limit > 0 => Ok(limit.min(max)),
        _ => Err(ApiError::bad_request("limit must be a positive integer")),
    }
}

async fn log_requests(req: axum::extract::Request, next: axum::middleware::Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    if path != "/healthz" && path != "/readyz" {
        info!(
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "request"
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_caps() {
        assert_eq!(parse_limit(None, 50, 100).unwrap(), 50);
        assert_eq!(parse_limit(None, 300, 200).unwrap(), 200);
        assert_eq!(parse_limit(Some("25"), 50, 100).unwrap(), 25);
        assert_eq!(parse_limit(Some("9999"), 50, 100).unwrap(), 100);
        assert!(parse_limit(Some("0"), 50, 100).is_err());
        assert!(parse_limit(Some("nope"), 50, 100).is_err());
    }

    #[test]
    fn time_range_params_come_together() {
        let none = RangeQuery { start: None, end: None, limit: None };
        assert!(parse_time_range(&none).unwrap().is_none());

        let half = RangeQuery {
            start: Some("2026-01-01T00:00:00Z".to_string()),
            end: None,
            limit: None,
        };
        assert!(parse_time_range(&half).is_err());

        let both = RangeQuery {
            start: Some("2026-01-01T00:00:00Z".to_string()),
            end: Some("2026-01-01T01:00:00Z".to_string()),
            limit: None,
        };
        let range = parse_time_range(&both).unwrap().unwrap();
        assert!(range.start < range.end);

        let inverted = RangeQuery {
            start: Some("2026-01-01T02:00:00Z".to_string()),
            end: Some("2026-01-01T01:00:00Z".to_string()),
            limit: None,
        };
        assert!(parse_time_range(&inverted).is_err());
    }
}
