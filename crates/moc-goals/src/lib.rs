//! C6 — Goal Processor.
//!
//! A priority queue of long-running goals, each decomposed (by a pluggable
//! analyzer, default keyword-based) into an ordered list of sub-steps.
//! Grounded on the original `goal_manager.py`'s `PriorityQueue` + processor
//! thread, with the `queue.PriorityQueue`/`threading.Thread` pair replaced
//! by a `tokio::sync::Mutex<BinaryHeap<Reverse<_>>>` drained by a
//! `Semaphore`-bounded pool of spawned tasks — the same bounded-worker
//! shape `moc-learning` uses for its job queue.

pub mod analyzer;
pub mod types;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use analyzer::{GoalAnalyzer, KeywordAnalyzer, Step};
use types::{Goal, GoalPriority, GoalStatus};

use moc_errors::CoordinatorError;
use moc_learning::types::{JobStatus, JobType};
use moc_learning::LearningCoordinator;
use moc_telemetry::Telemetry;

struct GoalEntry {
    goal: Mutex<Goal>,
    cancel: Arc<AtomicBool>,
}

pub struct GoalProcessorConfig {
    pub max_active_goals: usize,
    /// Bounded overall wait for a submit-learning-job sub-step, per §4.6.
    pub learning_job_wait_timeout: Duration,
    /// Scales the original's `time.sleep(duration * 0.01)` simulated
    /// evaluate/process steps down further for fast tests.
    pub step_scale: f64,
    /// Probability a non-learning-job step fails, matching the original's
    /// 0.5%-per-step simulated failure. Tests set this to `0.0`.
    pub simulated_failure_pct: f64,
}

impl Default for GoalProcessorConfig {
    fn default() -> Self {
        Self {
            max_active_goals: 10,
            learning_job_wait_timeout: Duration::from_secs(300),
            step_scale: 0.01,
            simulated_failure_pct: 0.005,
        }
    }
}

pub struct GoalProcessor {
    goals: dashmap::DashMap<String, Arc<GoalEntry>>,
    queue: Mutex<BinaryHeap<Reverse<(GoalPriority, chrono::DateTime<chrono::Utc>, String)>>>,
    slots: Arc<Semaphore>,
    config: Arc<GoalProcessorConfig>,
    analyzer: Arc<dyn GoalAnalyzer>,
    learning: Arc<LearningCoordinator>,
    telemetry: Arc<Telemetry>,
}

impl GoalProcessor {
    pub fn new(config: GoalProcessorConfig, learning: Arc<LearningCoordinator>, telemetry: Arc<Telemetry>) -> Arc<Self> {
        Arc::new(Self {
            goals: dashmap::DashMap::new(),
            queue: Mutex::new(BinaryHeap::new()),
            slots: Arc::new(Semaphore::new(config.max_active_goals)),
            config: Arc::new(config),
            analyzer: Arc::new(KeywordAnalyzer),
            learning,
            telemetry,
        })
    }

    pub async fn create(
        self: &Arc<Self>,
        title: String,
        description: String,
        priority: GoalPriority,
        metadata: serde_json::Value,
    ) -> String {
        let goal_id = Uuid::new_v4().to_string();
        let goal = Goal::new(goal_id.clone(), title, description, priority, metadata);
        let key = goal.queue_key();
        self.goals.insert(
            goal_id.clone(),
            Arc::new(GoalEntry {
                goal: Mutex::new(goal),
                cancel: Arc::new(AtomicBool::new(false)),
            }),
        );
        self.queue.lock().await.push(Reverse((key.0, key.1, goal_id.clone())));
        self.refresh_counts().await;
        self.clone().try_start_next().await;
        goal_id
    }

    pub async fn get(&self, goal_id: &str) -> Option<Goal> {
        let entry = self.goals.get(goal_id)?.clone();
        let goal = entry.goal.lock().await;
        Some(goal.clone())
    }

    pub async fn list(&self, status: Option<GoalStatus>) -> Vec<Goal> {
        let mut out = Vec::new();
        for entry in self.goals.iter() {
            let goal = entry.value().goal.lock().await;
            if let Some(s) = status {
                if goal.status != s {
                    continue;
                }
            }
            out.push(goal.clone());
        }
        out.sort_by(|a, b| a.queue_key().cmp(&b.queue_key()));
        out
    }

    pub async fn update_progress(&self, goal_id: &str, progress: f32, status: Option<GoalStatus>) -> bool {
        let Some(entry) = self.goals.get(goal_id).map(|e| e.clone()) else {
            return false;
        };
        let mut goal = entry.goal.lock().await;
        goal.progress = progress.clamp(0.0, 1.0);
        if let Some(status) = status {
            goal.status = status;
            if status == GoalStatus::Completed {
                goal.completed_at = Some(chrono::Utc::now());
                goal.progress = 1.0;
                let secs = (goal.completed_at.unwrap() - goal.created_at).num_milliseconds() as f64 / 1000.0;
                self.telemetry.record_goal_completion(goal.priority.as_str(), secs);
            }
        }
        drop(goal);
        self.refresh_counts().await;
        true
    }

    /// Cancels the goal and any outstanding derived learning jobs (§4.6).
    pub async fn cancel(&self, goal_id: &str) -> bool {
        let Some(entry) = self.goals.get(goal_id).map(|e| e.clone()) else {
            return false;
        };
        let mut goal = entry.goal.lock().await;
        if goal.status.is_terminal() {
            return false;
        }
        entry.cancel.store(true, Ordering::SeqCst);
        goal.status = GoalStatus::Cancelled;
        goal.completed_at = Some(chrono::Utc::now());
        goal.error = Some("goal cancelled".to_string());
        let job_ids = goal.derived_learning_job_ids.clone();
        drop(goal);

        for job_id in job_ids {
            self.learning.cancel(&job_id).await;
        }
        self.refresh_counts().await;
        true
    }

    /// Only a goal already in a terminal state may be deleted — a
    /// running/pending goal must be cancelled first (original's explicit
    /// `delete_goal` rule).
    pub async fn delete(&self, goal_id: &str) -> bool {
        let Some(entry) = self.goals.get(goal_id).map(|e| e.clone()) else {
            return false;
        };
        let terminal = entry.goal.lock().await.status.is_terminal();
        if !terminal {
            return false;
        }
        self.goals.remove(goal_id);
        self.refresh_counts().await;
        true
    }

    async fn refresh_counts(&self) {
        use std::collections::HashMap;
        let mut counts: HashMap<(&'static str, &'static str), i64> = HashMap::new();
        for entry in self.goals.iter() {
            let goal = entry.value().goal.lock().await;
            let status = status_label(goal.status);
            let priority = goal.priority.as_str();
            *counts.entry((status, priority)).or_insert(0) += 1;
        }
        for ((status, priority), count) in counts {
            self.telemetry.set_goals(status, priority, count);
        }
    }

    async fn try_start_next(self: Arc<Self>) {
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => return,
        };

        let goal_id = loop {
            let next = self.queue.lock().await.pop();
            match next {
                None => {
                    drop(permit);
                    return;
                }
                Some(Reverse((_, _, id))) => {
                    if let Some(entry) = self.goals.get(&id) {
                        let goal = entry.goal.lock().await;
                        if goal.status == GoalStatus::Pending {
                            break id;
                        }
                    }
                }
            }
        };

        let entry = match self.goals.get(&goal_id) {
            Some(e) => e.clone(),
            None => {
                drop(permit);
                return;
            }
        };

        {
            let mut goal = entry.goal.lock().await;
            goal.status = GoalStatus::Running;
            goal.started_at = Some(chrono::Utc::now());
        }
        self.refresh_counts().await;

        let processor = self.clone();
        tokio::spawn(async move {
            processor.run_goal(goal_id, entry, permit).await;
        });
    }

    async fn run_goal(self: Arc<Self>, goal_id: String, entry: Arc<GoalEntry>, permit: tokio::sync::OwnedSemaphorePermit) {
        let (description, metadata, priority) = {
            let goal = entry.goal.lock().await;
            (goal.description.clone(), goal.metadata.clone(), goal.priority)
        };
        let steps = self.analyzer.analyze(&description, &metadata);
        let total = steps.len().max(1);
        let started = Instant::now();

        let mut outcome: Result<(), String> = Ok(());
        for (i, step) in steps.into_iter().enumerate() {
            if entry.cancel.load(Ordering::SeqCst) {
                outcome = Err("cancelled".to_string());
                break;
            }

            let step_result = self.run_step(&entry, step).await;
            if let Err(reason) = step_result {
                outcome = Err(reason);
                break;
            }

            if self.config.simulated_failure_pct > 0.0 && rand::random::<f64>() < self.config.simulated_failure_pct {
                outcome = Err(format!("simulated failure at step {i}"));
                break;
            }

            let progress = (i + 1) as f32 / total as f32;
            let mut goal = entry.goal.lock().await;
            goal.progress = progress;
        }

        let mut goal = entry.goal.lock().await;
        let outcome_label: &'static str = match &outcome {
            Ok(()) => {
                goal.status = GoalStatus::Completed;
                goal.progress = 1.0;
                "completed"
            }
            Err(reason) if reason == "cancelled" => {
                // cancel() already set status=Cancelled; keep as-is.
                "cancelled"
            }
            Err(reason) => {
                goal.status = GoalStatus::Failed;
                goal.error = Some(reason.clone());
                self.telemetry.record_error("goal_execution_failed", "goals");
                warn!(goal_id = %goal_id, reason, "goal failed");
                "failed"
            }
        };
        goal.completed_at.get_or_insert(chrono::Utc::now());
        let duration = started.elapsed().as_secs_f64();
        self.telemetry.record_goal_completion(priority.as_str(), duration);
        self.telemetry.record_goal_outcome(priority.as_str(), outcome_label);
        info!(goal_id = %goal_id, outcome = outcome_label, "goal finished");
        drop(goal);

        self.refresh_counts().await;
        drop(permit);
        self.try_start_next().await;
    }

    async fn run_step(&self, entry: &Arc<GoalEntry>, step: Step) -> Result<(), String> {
        match step {
            Step::SubmitLearningJob { job_type, model_name, dataset_ref, params } => {
                let job_type = parse_job_type(&job_type);
                let job_id = self.learning.submit(job_type, model_name, dataset_ref, params).await;
                {
                    let mut goal = entry.goal.lock().await;
                    goal.derived_learning_job_ids.push(job_id.clone());
                }
                self.wait_for_learning_job(&job_id, entry).await
            }
            Step::EvaluateModel => {
                tokio::time::sleep(Duration::from_secs_f64(2.0 * self.config.step_scale)).await;
                Ok(())
            }
            Step::ProcessData => {
                tokio::time::sleep(Duration::from_secs_f64(1.0 * self.config.step_scale)).await;
                Ok(())
            }
            Step::GenericWait => {
                tokio::time::sleep(Duration::from_secs_f64(3.0 * self.config.step_scale)).await;
                Ok(())
            }
        }
    }

    async fn wait_for_learning_job(&self, job_id: &str, entry: &Arc<GoalEntry>) -> Result<(), String> {
        let deadline = Instant::now() + self.config.learning_job_wait_timeout;
        loop {
            if entry.cancel.load(Ordering::SeqCst) {
                return Err("cancelled".to_string());
            }
            let Some(job) = self.learning.status(job_id).await else {
                return Ok(());
            };
            match job.status {
                JobStatus::Completed => return Ok(()),
                JobStatus::Failed => return Err(format!("learning job failed: {}", job.error.unwrap_or_default())),
                JobStatus::Cancelled => return Err("cancelled".to_string()),
                JobStatus::Pending | JobStatus::Running => {}
            }
            if Instant::now() >= deadline {
                return Err("learning job wait timed out".to_string());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn status_label(status: GoalStatus) -> &'static str {
    match status {
        GoalStatus::Pending => "pending",
        GoalStatus::Running => "running",
        GoalStatus::Completed => "completed",
        GoalStatus::Failed => "failed",
        GoalStatus::Cancelled => "cancelled",
    }
}

fn parse_job_type(s: &str) -> JobType {
    match s {
        "rlhf" => JobType::Rlhf,
        "lora" => JobType::Lora,
        "distillation" => JobType::Distillation,
        _ => JobType::FineTune,
    }
}

pub fn not_found(goal_id: &str) -> CoordinatorError {
    CoordinatorError::GoalError {
        goal_id: goal_id.to_string(),
        reason: "goal not found".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moc_learning::backend::MockLearningBackend;
    use moc_learning::store::InMemoryJobStore;
    use moc_learning::LearningCoordinatorConfig;

    async fn processor(config: GoalProcessorConfig) -> Arc<GoalProcessor> {
        let telemetry = Arc::new(Telemetry::new());
        let learning = LearningCoordinator::new(
            LearningCoordinatorConfig { max_parallel_jobs: 2 },
            Arc::new(InMemoryJobStore::default()),
            Arc::new(MockLearningBackend { step_scale: 0.0001 }),
            telemetry.clone(),
        )
        .await;
        GoalProcessor::new(config, learning, telemetry)
    }

    #[tokio::test]
    async fn generic_goal_completes() {
        let proc = processor(GoalProcessorConfig {
            step_scale: 0.001,
            simulated_failure_pct: 0.0,
            ..Default::default()
        })
        .await;
        let id = proc
            .create("g1".into(), "do a generic thing".into(), GoalPriority::Medium, serde_json::json!({}))
            .await;
        for _ in 0..200 {
            if proc.get(&id).await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(proc.get(&id).await.unwrap().status, GoalStatus::Completed);
    }

    #[tokio::test]
    async fn training_goal_drives_a_learning_job() {
        let proc = processor(GoalProcessorConfig {
            step_scale: 0.001,
            simulated_failure_pct: 0.0,
            ..Default::default()
        })
        .await;
        let id = proc
            .create(
                "train it".into(),
                "please train and evaluate the model".into(),
                GoalPriority::High,
                serde_json::json!({"model_name": "m", "dataset_path": "/d"}),
            )
            .await;
        for _ in 0..400 {
            if proc.get(&id).await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let goal = proc.get(&id).await.unwrap();
        assert_eq!(goal.status, GoalStatus::Completed);
        assert_eq!(goal.derived_learning_job_ids.len(), 1);
    }

    #[tokio::test]
    async fn cancel_cancels_outstanding_learning_job() {
        let proc = processor(GoalProcessorConfig {
            step_scale: 1000.0,
            simulated_failure_pct: 0.0,
            learning_job_wait_timeout: Duration::from_secs(30),
            ..Default::default()
        })
        .await;
        let id = proc
            .create(
                "train it".into(),
                "please train the model".into(),
                GoalPriority::High,
                serde_json::json!({}),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(proc.cancel(&id).await);
        let goal = proc.get(&id).await.unwrap();
        assert_eq!(goal.status, GoalStatus::Cancelled);
    }

    #[tokio::test]
    async fn delete_refuses_while_pending_or_running() {
        let proc = processor(GoalProcessorConfig {
            max_active_goals: 0,
            ..Default::default()
        })
        .await;
        let id = proc
            .create("g".into(), "generic".into(), GoalPriority::Low, serde_json::json!({}))
            .await;
        assert!(!proc.delete(&id).await);
        assert!(proc.cancel(&id).await);
        assert!(proc.delete(&id).await);
    }

    #[tokio::test]
    async fn priority_queue_orders_critical_before_low() {
        let proc = processor(GoalProcessorConfig {
            max_active_goals: 0,
            ..Default::default()
        })
        .await;
        proc.create("low".into(), "generic".into(), GoalPriority::Low, serde_json::json!({})).await;
        let critical_id = proc
            .create("critical".into(), "generic".into(), GoalPriority::Critical, serde_json::json!({}))
            .await;
        let next = {
            let q = proc.queue.lock().await;
            q.peek().cloned()
        };
        let Reverse((_, _, id)) = next.unwrap();
        assert_eq!(id, critical_id);
    }
}
