//! Opaque learning-job execution, grounded on `learning.py`'s
//! `_simulate_learning_job`: a fixed step count with per-type scaled
//! duration, progress reported after every step, and a small random chance
//! of mid-run failure. Kept as the stand-in for a concrete training
//! pipeline, out of scope per §1.

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

use crate::types::JobType;

#[async_trait]
pub trait LearningBackend: Send + Sync {
    /// Run one simulated job to completion, invoking `on_progress` after
    /// each step and `should_cancel` before each step. Returns a
    /// `result_ref` on success or an error reason on failure.
    async fn run(
        &self,
        job_type: JobType,
        on_progress: &(dyn Fn(f32) + Send + Sync),
        should_cancel: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<String, String>;
}

const STEPS: u32 = 20;

/// Scales the original's wall-clock minutes down to milliseconds so tests
/// and demos complete quickly while preserving the step/progress shape.
pub struct MockLearningBackend {
    pub step_scale: f64,
}

impl Default for MockLearningBackend {
    fn default() -> Self {
        Self { step_scale: 0.001 }
    }
}

#[async_trait]
impl LearningBackend for MockLearningBackend {
    async fn run(
        &self,
        job_type: JobType,
        on_progress: &(dyn Fn(f32) + Send + Sync),
        should_cancel: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<String, String> {
        let step_duration = job_type.simulated_duration_secs() / STEPS as f64 * self.step_scale;
        for step in 0..STEPS {
            if should_cancel() {
                return Err("cancelled".to_string());
            }
            tokio::time::sleep(Duration::from_secs_f64(step_duration.max(0.0))).await;
            on_progress((step + 1) as f32 / STEPS as f32);
            if rand::thread_rng().gen_bool(0.01) {
                return Err("simulated training failure".to_string());
            }
        }
        Ok(format!("/models/{}_trained_{}.pt", job_type.as_str(), uuid::Uuid::new_v4()))
    }
}
