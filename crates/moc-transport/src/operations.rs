//! The operation set of §6 "External Interfaces", factored out of any one
//! wire format. `Coordinator` is the single facade all three surfaces
//! (HTTP, message-socket, binary-RPC — see `http`, `socket`, `rpc`) call
//! into, mirroring how the teacher's `mofa-gateway::AppState` bundles the
//! router/registry/pipeline behind one shared handle injected into every
//! handler.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use moc_errors::CoordinatorError;
use moc_gpu::{GpuManager, LeaseOutcome};
use moc_inference::types::{InferenceRequest, InferenceResult};
use moc_inference::InferenceExecutor;
use moc_learning::types::{JobFilter, JobStatus, JobType, LearningJob};
use moc_learning::LearningCoordinator;
use moc_lifecycle::model::LoadParams;
use moc_lifecycle::LifecycleManager;
use moc_goals::types::{Goal, GoalPriority, GoalStatus};
use moc_goals::GoalProcessor;
use moc_telemetry::Telemetry;

#[derive(Clone)]
pub struct Coordinator {
    pub lifecycle: Arc<LifecycleManager>,
    pub gpu: Arc<GpuManager>,
    pub inference: Arc<InferenceExecutor>,
    pub learning: Arc<LearningCoordinator>,
    pub goals: Arc<GoalProcessor>,
    pub telemetry: Arc<Telemetry>,
}

// -- wire DTOs, §6 -----------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoadModelRequest {
    pub name: String,
    pub source: String,
    #[serde(default = "one")]
    pub shards: u32,
    pub params: Option<LoadParams>,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UnloadModelRequest {
    pub name: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub source: String,
    pub vram_mb: u64,
    pub shards: u32,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
    pub access_count: u64,
    pub state: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct AcquireLeaseRequest {
    pub client: String,
    pub model: String,
    pub vram_estimate_mb: u64,
    pub ttl_sec: u64,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Serialize)]
pub struct AcquireLeaseResponse {
    pub granted: bool,
    pub lease_id: Option<String>,
    pub vram_reserved_mb: Option<u64>,
    pub reason: Option<String>,
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseLeaseRequest {
    pub lease_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitLearningJobRequest {
    pub job_type: String,
    pub model_name: String,
    pub dataset_ref: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct CreateGoalRequest {
    pub title: String,
    pub description: String,
    pub priority: GoalPriority,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct CircuitBreakersStatus {
    pub load: moc_lifecycle::circuit_breaker::BreakerStatus,
    pub unload: moc_lifecycle::circuit_breaker::BreakerStatus,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_seconds: f64,
    pub models_loaded: usize,
    pub gpu_usage_pct: f64,
    pub vram_allocated_mb: u64,
    pub vram_total_mb: u64,
    pub gpu_degraded: bool,
    pub circuit_breakers: CircuitBreakersStatus,
    pub learning_jobs: Vec<LearningJob>,
    pub goals: Vec<Goal>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl Coordinator {
    fn parse_job_type(s: &str) -> Result<JobType, CoordinatorError> {
        match s {
            "fine_tune" => Ok(JobType::FineTune),
            "rlhf" => Ok(JobType::Rlhf),
            "lora" => Ok(JobType::Lora),
            "distillation" => Ok(JobType::Distillation),
            other => Err(CoordinatorError::ConfigurationError {
                key: "job_type".to_string(),
                reason: format!("unrecognized job type '{other}'"),
            }),
        }
    }

    pub async fn infer(&self, request: InferenceRequest) -> Result<InferenceResult, CoordinatorError> {
        self.inference.infer(request).await
    }

    pub async fn load_model(&self, req: LoadModelRequest) -> OkResponse {
        match self.lifecycle.load(&req.name, &req.source, req.shards, req.params).await {
            Ok(_) => OkResponse { ok: true, error: None },
            Err(e) => OkResponse {
                ok: false,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn unload_model(&self, req: UnloadModelRequest) -> OkResponse {
        match self.lifecycle.unload(&req.name, req.force).await {
            Ok(()) => OkResponse { ok: true, error: None },
            Err(e) => OkResponse {
                ok: false,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn list_models(&self) -> Vec<ModelSummary> {
        self.lifecycle
            .list()
            .await
            .into_iter()
            .map(|m| ModelSummary {
                name: m.descriptor.name,
                source: m.descriptor.source,
                vram_mb: m.vram_mb,
                shards: m.descriptor.shards,
                loaded_at: m.loaded_at,
                access_count: m.access_count,
                state: state_label(m.state),
            })
            .collect()
    }

    pub async fn acquire_gpu_lease(&self, req: AcquireLeaseRequest) -> AcquireLeaseResponse {
        match self
            .gpu
            .acquire_lease(&req.client, &req.model, req.vram_estimate_mb, req.ttl_sec, req.priority)
            .await
        {
            LeaseOutcome::Granted { lease_id, vram_reserved_mb } => AcquireLeaseResponse {
                granted: true,
                lease_id: Some(lease_id),
                vram_reserved_mb: Some(vram_reserved_mb),
                reason: None,
                retry_after_ms: None,
            },
            LeaseOutcome::Denied { reason, retry_after_ms } => AcquireLeaseResponse {
                granted: false,
                lease_id: None,
                vram_reserved_mb: None,
                reason: Some(reason),
                retry_after_ms: Some(retry_after_ms),
            },
        }
    }

    pub fn release_gpu_lease(&self, req: ReleaseLeaseRequest) -> OkResponse {
        self.gpu.release_lease(&req.lease_id);
        OkResponse { ok: true, error: None }
    }

    pub async fn submit_learning_job(&self, req: SubmitLearningJobRequest) -> Result<String, CoordinatorError> {
        let job_type = Self::parse_job_type(&req.job_type)?;
        Ok(self
            .learning
            .submit(job_type, req.model_name, req.dataset_ref, req.params)
            .await)
    }

    pub async fn get_learning_job(&self, job_id: &str) -> Result<LearningJob, CoordinatorError> {
        self.learning.status(job_id).await.ok_or_else(|| moc_learning::not_found(job_id))
    }

    pub async fn list_learning_jobs(&self, status: Option<JobStatus>) -> Vec<LearningJob> {
        self.learning.list(status.map(|status| JobFilter { status: Some(status) })).await
    }

    pub async fn cancel_learning_job(&self, job_id: &str) -> Result<(), CoordinatorError> {
        if self.learning.cancel(job_id).await {
            Ok(())
        } else {
            Err(moc_learning::not_found(job_id))
        }
    }

    pub async fn create_goal(&self, req: CreateGoalRequest) -> String {
        self.goals.create(req.title, req.description, req.priority, req.metadata).await
    }

    pub async fn list_goals(&self, status: Option<GoalStatus>) -> Vec<Goal> {
        self.goals.list(status).await
    }

    pub async fn cancel_goal(&self, goal_id: &str) -> Result<(), CoordinatorError> {
        if self.goals.cancel(goal_id).await {
            Ok(())
        } else {
            Err(moc_goals::not_found(goal_id))
        }
    }

    pub async fn status(&self) -> StatusResponse {
        let usage = self.gpu.usage().await;
        let (load, unload) = self.lifecycle.breaker_status().await;
        StatusResponse {
            uptime_seconds: self.telemetry.uptime_seconds(),
            models_loaded: self.lifecycle.list().await.len(),
            gpu_usage_pct: usage.usage_pct,
            vram_allocated_mb: usage.allocated_mb,
            vram_total_mb: usage.total_mb,
            gpu_degraded: self.gpu.is_degraded(),
            circuit_breakers: CircuitBreakersStatus { load, unload },
            learning_jobs: self.learning.list(None).await,
            goals: self.goals.list(None).await,
        }
    }

    /// `{status: "ok"}` + 200 iff every critical component is healthy;
    /// otherwise a body naming the failing sub-check (§6 "Health endpoint").
    pub async fn health(&self) -> HealthResponse {
        if self.gpu.is_degraded() {
            return HealthResponse {
                status: "degraded",
                detail: Some(serde_json::json!({ "failing_check": "gpu_manager", "reason": "device query failing" })),
            };
        }
        let (load_breaker, unload_breaker) = self.lifecycle.breaker_status().await;
        let is_open = |s: moc_lifecycle::circuit_breaker::State| s == moc_lifecycle::circuit_breaker::State::Open;
        if is_open(load_breaker.state) || is_open(unload_breaker.state) {
            return HealthResponse {
                status: "degraded",
                detail: Some(serde_json::json!({ "failing_check": "lifecycle_manager", "reason": "circuit open" })),
            };
        }
        HealthResponse { status: "ok", detail: None }
    }
}

/// Dispatches a named operation with JSON-encoded parameters against the
/// coordinator, for the framed (non-HTTP) surfaces in `socket`/`rpc`, which
/// carry `{op, params}` envelopes rather than distinct routes per operation.
pub async fn dispatch(coordinator: &Coordinator, op: &str, params: serde_json::Value) -> Result<serde_json::Value, CoordinatorError> {
    fn bad_params(op: &str, e: serde_json::Error) -> CoordinatorError {
        CoordinatorError::ConfigurationError {
            key: format!("params.{op}"),
            reason: e.to_string(),
        }
    }
    fn to_value<T: Serialize>(v: T) -> serde_json::Value {
        serde_json::to_value(v).unwrap_or(serde_json::Value::Null)
    }

    match op {
        "infer" => {
            let req: InferenceRequest = serde_json::from_value(params).map_err(|e| bad_params(op, e))?;
            coordinator.infer(req).await.map(to_value)
        }
        "load_model" => {
            let req: LoadModelRequest = serde_json::from_value(params).map_err(|e| bad_params(op, e))?;
            Ok(to_value(coordinator.load_model(req).await))
        }
        "unload_model" => {
            let req: UnloadModelRequest = serde_json::from_value(params).map_err(|e| bad_params(op, e))?;
            Ok(to_value(coordinator.unload_model(req).await))
        }
        "list_models" => Ok(to_value(coordinator.list_models().await)),
        "acquire_gpu_lease" => {
            let req: AcquireLeaseRequest = serde_json::from_value(params).map_err(|e| bad_params(op, e))?;
            Ok(to_value(coordinator.acquire_gpu_lease(req).await))
        }
        "release_gpu_lease" => {
            let req: ReleaseLeaseRequest = serde_json::from_value(params).map_err(|e| bad_params(op, e))?;
            Ok(to_value(coordinator.release_gpu_lease(req)))
        }
        "submit_learning_job" => {
            let req: SubmitLearningJobRequest = serde_json::from_value(params).map_err(|e| bad_params(op, e))?;
            coordinator.submit_learning_job(req).await.map(|job_id| serde_json::json!({ "job_id": job_id }))
        }
        "get_learning_job" => {
            let job_id = params.get("job_id").and_then(|v| v.as_str()).unwrap_or_default();
            coordinator.get_learning_job(job_id).await.map(to_value)
        }
        "list_learning_jobs" => Ok(to_value(coordinator.list_learning_jobs(None).await)),
        "cancel_learning_job" => {
            let job_id = params.get("job_id").and_then(|v| v.as_str()).unwrap_or_default();
            coordinator.cancel_learning_job(job_id).await.map(|_| serde_json::json!({ "ok": true }))
        }
        "create_goal" => {
            let req: CreateGoalRequest = serde_json::from_value(params).map_err(|e| bad_params(op, e))?;
            Ok(serde_json::json!({ "goal_id": coordinator.create_goal(req).await }))
        }
        "list_goals" => Ok(to_value(coordinator.list_goals(None).await)),
        "cancel_goal" => {
            let goal_id = params.get("goal_id").and_then(|v| v.as_str()).unwrap_or_default();
            coordinator.cancel_goal(goal_id).await.map(|_| serde_json::json!({ "ok": true }))
        }
        "status" => Ok(to_value(coordinator.status().await)),
        "health" => Ok(to_value(coordinator.health().await)),
        other => Err(CoordinatorError::ConfigurationError {
            key: "op".to_string(),
            reason: format!("unknown operation '{other}'"),
        }),
    }
}

fn state_label(state: moc_lifecycle::model::ModelState) -> &'static str {
    use moc_lifecycle::model::ModelState::*;
    match state {
        Unloaded => "unloaded",
        Loading => "loading",
        Loaded => "loaded",
        Unloading => "unloading",
        Failed => "failed",
    }
}
