//! HTTP surface: `POST /agent/run` drives a full agent run, `GET /health`
//! is a liveness probe, and finalized videos are served under `/videos/`.
//!
//! Every terminal run outcome — including `failed` — is a `200` with a
//! structured body. Only malformed requests and pre-allocation rejections
//! (unknown model, missing credential) surface as `4xx`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use uuid::Uuid;

use crate::config::Config;
use crate::model::BackendResolver;
use crate::prompt;
use crate::run::{Controller, RunRecord, RunSpec, RunStatus, Step};
use crate::Error;

/// Shared handler state: immutable config and registry, plus the
/// controller that owns run execution.
#[derive(Clone)]
pub struct AppState {
    config: Config,
    resolver: Arc<dyn BackendResolver>,
    controller: Arc<Controller>,
}

impl AppState {
    pub fn new(
        config: Config,
        resolver: Arc<dyn BackendResolver>,
        controller: Arc<Controller>,
    ) -> Self {
        Self {
            config,
            resolver,
            controller,
        }
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    let artifacts = state.config.video.artifacts_dir.clone();
    Router::new()
        .route("/agent/run", post(run_agent))
        .route("/health", get(health))
        .nest_service("/videos", ServeDir::new(artifacts))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub prompt: String,
    pub max_steps: Option<u32>,
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub run_id: String,
    pub status: RunStatus,
    pub model: String,
    pub steps: Vec<Step>,
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    pub duration_ms: u64,
}

/// Pure packaging of a finished run into the response payload.
pub fn assemble(record: RunRecord) -> RunResponse {
    let video_url = record
        .video
        .as_ref()
        .and_then(|v| v.file_name())
        .map(|name| format!("/videos/{}", name));
    RunResponse {
        run_id: record.run_id,
        status: record.status,
        model: record.model,
        steps: record.steps,
        result: record.result,
        error: record.error,
        video_url,
        duration_ms: record.duration_ms,
    }
}

/// Request rejection, rendered as a JSON error body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

async fn run_agent(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let task = req.prompt.trim();
    if task.is_empty() {
        return Err(ApiError::bad_request("prompt is required"));
    }
    let max_steps = req.max_steps.unwrap_or(state.config.run.default_max_steps);
    if max_steps == 0 {
        return Err(ApiError::bad_request("max_steps must be at least 1"));
    }
    let max_steps = max_steps.min(state.config.run.max_steps_ceiling);

    // model resolution happens before any browser provisioning so a bad
    // identifier or missing credential never costs a session
    let model_id = req.model.as_deref().unwrap_or(state.resolver.default_id());
    let backend = state.resolver.resolve(model_id).map_err(|e| match e {
        Error::UnknownModel(_) | Error::MissingCredential { .. } => {
            ApiError::bad_request(e.to_string())
        }
        other => ApiError::internal(other.to_string()),
    })?;

    let spec = RunSpec {
        run_id: short_id(),
        task: prompt::wrap_task(task),
        max_steps,
        max_duration: Duration::from_secs(state.config.run.max_duration_secs),
        engine: state.config.browser.engine,
    };

    let record = state.controller.execute(spec, backend).await;
    Ok(Json(assemble(record)))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}
