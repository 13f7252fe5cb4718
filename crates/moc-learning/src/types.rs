//! Learning-job data model — §3 "Learning job".

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FineTune,
    Rlhf,
    Lora,
    Distillation,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::FineTune => "fine_tune",
            JobType::Rlhf => "rlhf",
            JobType::Lora => "lora",
            JobType::Distillation => "distillation",
        }
    }

    /// Simulated base duration, grounded on the original's `duration_map`
    /// (120s/180s/60s/90s), scaled down by callers for test/demo speed.
    pub fn simulated_duration_secs(self) -> f64 {
        match self {
            JobType::FineTune => 120.0,
            JobType::Rlhf => 180.0,
            JobType::Lora => 60.0,
            JobType::Distillation => 90.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningJob {
    pub job_id: String,
    pub job_type: JobType,
    pub model_name: String,
    pub dataset_ref: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub status: JobStatus,
    pub progress: f32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<String>,
    pub result_ref: Option<String>,
}

impl LearningJob {
    pub fn new(job_id: String, job_type: JobType, model_name: String, dataset_ref: String, params: serde_json::Value) -> Self {
        Self {
            job_id,
            job_type,
            model_name,
            dataset_ref,
            params,
            status: JobStatus::Pending,
            progress: 0.0,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result_ref: None,
        }
    }
}

/// Optional filter applied by `list()`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
}
