//! HTTP/JSON surface. Routing and handler shape follow the teacher's
//! `mofa-gateway::server` (axum `Router` + `State` extractor + a small
//! `AppState`), generalized to the operation set of §6 instead of the
//! OpenAI-proxy routes it was built for.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use moc_errors::CoordinatorError;
use moc_inference::types::InferenceRequest;
use moc_learning::types::JobStatus;
use moc_goals::types::GoalStatus;

use crate::operations::{
    AcquireLeaseRequest, Coordinator, CreateGoalRequest, LoadModelRequest, ReleaseLeaseRequest,
    SubmitLearningJobRequest, UnloadModelRequest,
};

/// Optional shared-secret bearer token (§6 "Authentication"). `None` means
/// auth is disabled — callers are expected to refuse that configuration in
/// production/staging at startup, not here.
#[derive(Clone)]
pub struct HttpSurfaceConfig {
    pub auth_token: Option<Arc<String>>,
}

#[derive(Clone)]
struct AppState {
    coordinator: Coordinator,
    auth_token: Option<Arc<String>>,
}

pub fn build_router(coordinator: Coordinator, config: HttpSurfaceConfig) -> Router {
    let state = AppState {
        coordinator,
        auth_token: config.auth_token,
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/v1/infer", post(infer_handler))
        .route("/v1/models", get(list_models_handler).post(load_model_handler))
        .route("/v1/models/{name}", axum::routing::delete(unload_model_handler))
        .route("/v1/gpu/lease", post(acquire_lease_handler))
        .route("/v1/gpu/lease/release", post(release_lease_handler))
        .route(
            "/v1/learning/jobs",
            get(list_learning_jobs_handler).post(submit_learning_job_handler),
        )
        .route("/v1/learning/jobs/{job_id}", get(get_learning_job_handler))
        .route("/v1/learning/jobs/{job_id}/cancel", post(cancel_learning_job_handler))
        .route("/v1/goals", get(list_goals_handler).post(create_goal_handler))
        .route("/v1/goals/{goal_id}/cancel", post(cancel_goal_handler))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(router: Router, port: u16) -> std::io::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "HTTP/JSON surface starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await
}

/// Bearer-token check ahead of every handler except `/health`, matching the
/// teacher's `ApiKeyFilter` (here a single shared secret rather than a key
/// set, per §6).
async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }
    let Some(expected) = &state.auth_token else {
        return next.run(request).await;
    };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if token == expected.as_str() => next.run(request).await,
        _ => (StatusCode::UNAUTHORIZED, Json(json!({ "error": "missing or invalid bearer token" }))).into_response(),
    }
}

fn error_response(err: CoordinatorError) -> Response {
    let status = match &err {
        CoordinatorError::ModelNotFound { .. } => StatusCode::NOT_FOUND,
        CoordinatorError::LearningJobError { .. } => StatusCode::NOT_FOUND,
        CoordinatorError::GoalError { .. } => StatusCode::NOT_FOUND,
        CoordinatorError::BulkheadRejection { .. } => StatusCode::TOO_MANY_REQUESTS,
        CoordinatorError::GpuUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::VramExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::ModelLoadError { .. } => StatusCode::BAD_GATEWAY,
        CoordinatorError::ModelUnloadError { .. } => StatusCode::BAD_GATEWAY,
        CoordinatorError::InferenceError { .. } => StatusCode::BAD_GATEWAY,
        CoordinatorError::ConfigurationError { .. } => StatusCode::BAD_REQUEST,
    };
    let mut response = (
        status,
        Json(json!({ "error": err.to_string(), "code": err.error_code() })),
    )
        .into_response();
    if let CoordinatorError::CircuitOpen { retry_after_sec, .. } = &err {
        if let Ok(value) = retry_after_sec.to_string().parse() {
            response.headers_mut().insert("Retry-After", value);
        }
    }
    response
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let health = state.coordinator.health().await;
    let status = if health.status == "ok" { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(health)).into_response()
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.status().await)
}

async fn infer_handler(State(state): State<AppState>, Json(req): Json<InferenceRequest>) -> Response {
    match tokio::time::timeout(Duration::from_secs(65), state.coordinator.infer(req)).await {
        Ok(Ok(result)) => Json(result).into_response(),
        Ok(Err(e)) => error_response(e),
        Err(_) => error_response(CoordinatorError::InferenceError {
            model: "<unknown>".to_string(),
            reason: "timeout".to_string(),
        }),
    }
}

async fn load_model_handler(State(state): State<AppState>, Json(req): Json<LoadModelRequest>) -> impl IntoResponse {
    Json(state.coordinator.load_model(req).await)
}

async fn unload_model_handler(State(state): State<AppState>, Path(name): Path<String>, Query(q): Query<ForceQuery>) -> impl IntoResponse {
    Json(
        state
            .coordinator
            .unload_model(UnloadModelRequest { name, force: q.force.unwrap_or(false) })
            .await,
    )
}

#[derive(Debug, Deserialize)]
struct ForceQuery {
    force: Option<bool>,
}

async fn list_models_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.list_models().await)
}

async fn acquire_lease_handler(State(state): State<AppState>, Json(req): Json<AcquireLeaseRequest>) -> impl IntoResponse {
    Json(state.coordinator.acquire_gpu_lease(req).await)
}

async fn release_lease_handler(State(state): State<AppState>, Json(req): Json<ReleaseLeaseRequest>) -> impl IntoResponse {
    Json(state.coordinator.release_gpu_lease(req))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    status: Option<String>,
}

async fn submit_learning_job_handler(
    State(state): State<AppState>,
    Json(req): Json<SubmitLearningJobRequest>,
) -> Response {
    match state.coordinator.submit_learning_job(req).await {
        Ok(job_id) => Json(json!({ "job_id": job_id })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_learning_job_handler(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.coordinator.get_learning_job(&job_id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_learning_jobs_handler(State(state): State<AppState>, Query(q): Query<StatusQuery>) -> impl IntoResponse {
    let status = q.status.as_deref().and_then(parse_job_status);
    Json(state.coordinator.list_learning_jobs(status).await)
}

async fn cancel_learning_job_handler(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.coordinator.cancel_learning_job(&job_id).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn create_goal_handler(State(state): State<AppState>, Json(req): Json<CreateGoalRequest>) -> impl IntoResponse {
    Json(json!({ "goal_id": state.coordinator.create_goal(req).await }))
}

async fn list_goals_handler(State(state): State<AppState>, Query(q): Query<StatusQuery>) -> impl IntoResponse {
    let status = q.status.as_deref().and_then(parse_goal_status);
    Json(state.coordinator.list_goals(status).await)
}

async fn cancel_goal_handler(State(state): State<AppState>, Path(goal_id): Path<String>) -> Response {
    match state.coordinator.cancel_goal(&goal_id).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => error_response(e),
    }
}

fn parse_job_status(s: &str) -> Option<JobStatus> {
    match s {
        "pending" => Some(JobStatus::Pending),
        "running" => Some(JobStatus::Running),
        "completed" => Some(JobStatus::Completed),
        "failed" => Some(JobStatus::Failed),
        "cancelled" => Some(JobStatus::Cancelled),
        _ => None,
    }
}

fn parse_goal_status(s: &str) -> Option<GoalStatus> {
    match s {
        "pending" => Some(GoalStatus::Pending),
        "running" => Some(GoalStatus::Running),
        "completed" => Some(GoalStatus::Completed),
        "failed" => Some(GoalStatus::Failed),
        "cancelled" => Some(GoalStatus::Cancelled),
        _ => None,
    }
}
