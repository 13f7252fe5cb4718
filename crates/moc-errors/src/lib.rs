//! Typed error taxonomy for the Model Operations Coordinator.
//!
//! Every public operation across `moc-gpu`, `moc-lifecycle`,
//! `moc-inference`, `moc-learning`, `moc-goals` and `moc-transport`
//! returns `Result<T, CoordinatorError>`. No unclassified error is
//! allowed to cross a transport boundary: `error_code` gives each
//! variant a stable wire-level code, and transport adapters map
//! variants to protocol status codes (see `moc-transport`).

use serde::Serialize;
use thiserror::Error;

/// The error family returned by every coordinator operation.
#[derive(Debug, Error, Clone, Serialize)]
#[non_exhaustive]
pub enum CoordinatorError {
    #[error("model not found: {name}")]
    ModelNotFound { name: String },

    #[error("failed to load model {name}: {reason}")]
    ModelLoadError { name: String, reason: String },

    #[error("failed to unload model {name}: {reason}")]
    ModelUnloadError { name: String, reason: String },

    #[error("GPU unavailable: required {required_mb} MB, available {available_mb} MB")]
    GpuUnavailable { required_mb: u64, available_mb: u64 },

    #[error("VRAM exhausted: {used_mb}/{total_mb} MB used, threshold {threshold_pct}%")]
    VramExhausted {
        total_mb: u64,
        used_mb: u64,
        threshold_pct: u8,
    },

    #[error("inference failed for {model}: {reason}")]
    InferenceError { model: String, reason: String },

    #[error("circuit open for operation {operation} ({failure_count} consecutive failures, retry after {retry_after_sec}s)")]
    CircuitOpen {
        operation: String,
        failure_count: u32,
        retry_after_sec: u64,
    },

    #[error("bulkhead rejected {operation}: {current}/{max} in flight")]
    BulkheadRejection {
        operation: String,
        current: usize,
        max: usize,
    },

    #[error("learning job {job_id} error: {reason}")]
    LearningJobError { job_id: String, reason: String },

    #[error("goal {goal_id} error: {reason}")]
    GoalError { goal_id: String, reason: String },

    #[error("configuration error for key {key}: {reason}")]
    ConfigurationError { key: String, reason: String },
}

impl CoordinatorError {
    /// Stable machine-readable code, matching the original implementation's
    /// `error_code` strings so downstream clients written against it keep
    /// working unchanged.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ModelNotFound { .. } => "MODEL_NOT_FOUND",
            Self::ModelLoadError { .. } => "MODEL_LOAD_ERROR",
            Self::ModelUnloadError { .. } => "MODEL_UNLOAD_ERROR",
            Self::GpuUnavailable { .. } => "GPU_UNAVAILABLE",
            Self::VramExhausted { .. } => "VRAM_EXHAUSTED",
            Self::InferenceError { .. } => "INFERENCE_ERROR",
            Self::CircuitOpen { .. } => "CIRCUIT_BREAKER_OPEN",
            Self::BulkheadRejection { .. } => "BULKHEAD_REJECTION",
            Self::LearningJobError { .. } => "LEARNING_JOB_ERROR",
            Self::GoalError { .. } => "GOAL_ERROR",
            Self::ConfigurationError { .. } => "CONFIGURATION_ERROR",
        }
    }
}

/// Convenience alias used throughout the coordinator crates.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        let e = CoordinatorError::GpuUnavailable {
            required_mb: 9000,
            available_mb: 4000,
        };
        assert_eq!(e.error_code(), "GPU_UNAVAILABLE");
        assert!(e.to_string().contains("9000"));
    }
}
