//! HTTP request handlers.

use super::AppState;
use crate::config::BasicAuth;
use crate::db::{NameListing, QueryParams, StoreError};

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

// ============================================================================
// Auth
// ============================================================================

pub async fn require_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(expected) = &state.auth {
        if !authorized(req.headers(), expected) {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"Restricted\"")],
                "Unauthorized",
            )
                .into_response();
        }
    }
    next.run(req).await
}

/// Whether the request carries exactly the expected basic credentials.
pub fn authorized(headers: &HeaderMap, expected: &BasicAuth) -> bool {
    let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Some(decoded) = STANDARD
        .decode(encoded.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
    else {
        return false;
    };

    match decoded.split_once(':') {
        Some((username, password)) => {
            username == expected.username && password == expected.password
        }
        None => false,
    }
}

// ============================================================================
// Query parameters
// ============================================================================

/// Query string shared by the read endpoints. Values are parsed leniently:
/// a bad timestamp is treated as unbounded and a bad count as zero.
#[derive(Debug, Default, Deserialize)]
pub struct RawQuery {
    pub job: Option<String>,
    pub target: Option<String>,
    pub app: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub num_lines: Option<String>,
    pub distinct: Option<String>,
    pub decode: Option<String>,
}

impl RawQuery {
    pub fn params(&self) -> QueryParams {
        QueryParams {
            job: self.job.clone().unwrap_or_default(),
            target: self.target.clone().unwrap_or_default(),
            app: self.app.clone().filter(|a| !a.is_empty()),
            start: parse_time(self.start.as_deref()),
            end: parse_time(self.end.as_deref()),
            num_lines: self
                .num_lines
                .as_deref()
                .and_then(|n| n.trim().parse().ok())
                .unwrap_or(0),
        }
    }

    fn flag(value: Option<&str>) -> bool {
        matches!(value, Some("true") | Some("1") | Some("yes"))
    }
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v.trim()).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn respond<T: Serialize>(result: Result<T, StoreError>) -> Response {
    match result {
        Ok(data) => Json(data).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// Endpoints
// ============================================================================

pub async fn handle_docs() -> impl IntoResponse {
    Json(json!({
        "/docs": {"method": "GET", "description": "lists available endpoints"},
        "/query": {"method": "GET", "params": ["job", "target", "start (RFC3339)", "end (RFC3339)", "decode (optional)"]},
        "/processes": {"method": "GET", "params": ["job", "target", "start (RFC3339)", "end (RFC3339)"]},
        "/logs": {"method": "GET", "params": ["job", "target", "app (optional)", "start (RFC3339)", "end (RFC3339)", "num_lines (optional)"]},
        "/apps": {"method": "GET", "params": ["job", "target", "start (RFC3339)", "end (RFC3339)", "distinct (optional)"]},
        "/target": {"method": "GET", "description": "lists targets with stored logs"},
        "/jobs": {"method": "GET", "params": ["target"]},
        "/health": {"method": "GET", "description": "scrape and storage health per target"},
        "/pm2/processes": {"method": "GET", "description": "processes managed by the local PM2 daemon"},
    }))
}

pub async fn handle_query(State(state): State<AppState>, Query(raw): Query<RawQuery>) -> Response {
    let q = raw.params();
    if RawQuery::flag(raw.decode.as_deref()) {
        respond(state.store.query_metrics_decoded(&q))
    } else {
        respond(state.store.query_metrics(&q))
    }
}

pub async fn handle_processes(
    State(state): State<AppState>,
    Query(raw): Query<RawQuery>,
) -> Response {
    respond(state.store.query_processes(&raw.params()))
}

pub async fn handle_logs(State(state): State<AppState>, Query(raw): Query<RawQuery>) -> Response {
    let q = raw.params();
    if q.num_lines > 0 {
        respond(state.store.tail_logs(&q))
    } else {
        respond(state.store.query_logs_range(&q))
    }
}

pub async fn handle_apps(State(state): State<AppState>, Query(raw): Query<RawQuery>) -> Response {
    let listing = if RawQuery::flag(raw.distinct.as_deref()) {
        NameListing::Distinct
    } else {
        NameListing::All
    };
    respond(state.store.query_app_names(&raw.params(), listing))
}

pub async fn handle_targets(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.list_targets())
}

pub async fn handle_jobs(State(state): State<AppState>, Query(raw): Query<RawQuery>) -> impl IntoResponse {
    Json(state.store.list_jobs(raw.target.as_deref().unwrap_or_default()))
}

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.snapshot())
}

pub async fn handle_local_processes(State(state): State<AppState>) -> Response {
    match state.lister.list().await {
        Ok(processes) => Json(processes).into_response(),
        Err(e) => {
            tracing::error!("Failed to list PM2 processes: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to list PM2 processes").into_response()
        }
    }
}
