//! HTTP surface of the daemon.
//!
//! `POST /activity` ingests one event. `/health`, `/ready` and `/status` are
//! read-only diagnostics. `/sessions` and `/projects/{id}` expose stored
//! entities to reporting. SQLite and aggregator work runs on the blocking
//! pool so request handling never stalls the runtime.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use worktime_core::new_event_id;
use worktime_protocol::{
    parse_activity, AckStatus, ActivityAck, ErrorInfo, ACTIVITY_PATH, MAX_REQUEST_BYTES,
};

use crate::aggregator::UserStatus;
use crate::model::Project;
use crate::state::{HealthReport, SharedState, UserHistory};

// ── Error Handling ──

struct ApiError {
    status: StatusCode,
    info: ErrorInfo,
}

impl ApiError {
    fn bad_request(info: ErrorInfo) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            info,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            info: ErrorInfo::new("internal_error", message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.info)).into_response()
    }
}

// ── Entrypoint ──

pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<SharedState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route(ACTIVITY_PATH, post(post_activity))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .route("/sessions", get(sessions))
        .route("/projects/{id}", get(project))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .with_state(state)
}

// ── POST /activity ──

async fn post_activity(
    State(state): State<Arc<SharedState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<ActivityAck>), ApiError> {
    let value: serde_json::Value = serde_json::from_slice(&body).map_err(|err| {
        ApiError::bad_request(ErrorInfo::new(
            "invalid_json",
            format!("request body is not valid JSON: {}", err),
        ))
    })?;
    let event = parse_activity(value)
        .and_then(|request| request.into_event(new_event_id))
        .map_err(|info| {
            tracing::debug!(code = %info.code, message = %info.message, "Rejected activity");
            ApiError::bad_request(info)
        })?;

    let activity_id = event.id.clone();
    let status = tokio::task::spawn_blocking(move || state.ingest(&event))
        .await
        .map_err(|err| ApiError::internal(format!("ingest task failed: {}", err)))?
        .map_err(|err| {
            tracing::error!(event_id = %activity_id, error = %err, "Failed to store activity");
            ApiError::internal(err)
        })?;

    let code = match status {
        AckStatus::Accepted | AckStatus::Duplicate => StatusCode::OK,
        AckStatus::Flagged => StatusCode::ACCEPTED,
    };
    Ok((
        code,
        Json(ActivityAck {
            status,
            activity_id,
            timestamp: Utc::now(),
        }),
    ))
}

// ── Diagnostics ──

async fn health(State(state): State<Arc<SharedState>>) -> Result<Json<HealthReport>, ApiError> {
    let report = tokio::task::spawn_blocking(move || state.health(Utc::now()))
        .await
        .map_err(|err| ApiError::internal(format!("health task failed: {}", err)))?;
    Ok(Json(report))
}

async fn ready(State(state): State<Arc<SharedState>>) -> Response {
    let ready = tokio::task::spawn_blocking(move || state.is_ready())
        .await
        .unwrap_or(false);
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(serde_json::json!({ "ready": ready }))).into_response()
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: Option<String>,
}

impl UserQuery {
    fn require(self) -> Result<String, ApiError> {
        self.user_id
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                ApiError::bad_request(ErrorInfo::new("missing_field", "user_id is required"))
            })
    }
}

async fn status(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<UserStatus>, ApiError> {
    let user_id = query.require()?;

    state
        .status(&user_id, Utc::now())
        .map(Json)
        .ok_or_else(|| ApiError {
            status: StatusCode::NOT_FOUND,
            info: ErrorInfo::new("unknown_user", format!("no activity for user {}", user_id)),
        })
}

// ── Stored history ──

async fn sessions(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<UserHistory>, ApiError> {
    let user_id = query.require()?;
    let history = tokio::task::spawn_blocking(move || state.history(&user_id))
        .await
        .map_err(|err| ApiError::internal(format!("history task failed: {}", err)))?
        .map_err(ApiError::internal)?;
    Ok(Json(history))
}

async fn project(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    let lookup = id.clone();
    tokio::task::spawn_blocking(move || state.project(&lookup))
        .await
        .map_err(|err| ApiError::internal(format!("project task failed: {}", err)))?
        .map_err(ApiError::internal)?
        .map(Json)
        .ok_or_else(|| ApiError {
            status: StatusCode::NOT_FOUND,
            info: ErrorInfo::new("unknown_project", format!("no project {}", id)),
        })
}
