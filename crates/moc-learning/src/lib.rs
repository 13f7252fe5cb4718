//! C5 — Learning Coordinator.
//!
//! Submits, tracks and cancels background training jobs against a bounded
//! pool of `max_parallel_jobs` running slots, with all job records mirrored
//! to a durable store keyed by `job_id`. Grounded on the original
//! `learning.py`: a pending queue drained oldest-first as running slots
//! free up, per-job progress persisted at every simulated step, and
//! restart demotion of anything left `running` back to `pending` — "restart,
//! not resume" per §4.5 and §9's explicit open question.

pub mod backend;
pub mod store;
pub mod types;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use backend::LearningBackend;
use store::JobStore;
use types::{JobFilter, JobStatus, JobType, LearningJob};

use moc_errors::CoordinatorError;
use moc_telemetry::Telemetry;

struct JobEntry {
    job: Mutex<LearningJob>,
    cancel: Arc<AtomicBool>,
}

pub struct LearningCoordinatorConfig {
    pub max_parallel_jobs: usize,
}

impl Default for LearningCoordinatorConfig {
    fn default() -> Self {
        Self { max_parallel_jobs: 2 }
    }
}

pub struct LearningCoordinator {
    jobs: dashmap::DashMap<String, Arc<JobEntry>>,
    pending: Mutex<VecDeque<String>>,
    slots: Arc<Semaphore>,
    store: Arc<dyn JobStore>,
    backend: Arc<dyn LearningBackend>,
    telemetry: Arc<Telemetry>,
}

impl LearningCoordinator {
    /// Rehydrates job records from the durable store, demoting anything
    /// left `running` back to `pending` (§4.5 recovery policy), then
    /// re-enqueues pending jobs oldest-first and fills initial slots.
    pub async fn new(
        config: LearningCoordinatorConfig,
        store: Arc<dyn JobStore>,
        backend: Arc<dyn LearningBackend>,
        telemetry: Arc<Telemetry>,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            jobs: dashmap::DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
            slots: Arc::new(Semaphore::new(config.max_parallel_jobs)),
            store,
            backend,
            telemetry,
        });

        let mut recovered = coordinator.store.load_all().await;
        recovered.sort_by_key(|j| j.created_at);

        let mut to_enqueue = Vec::new();
        for mut job in recovered {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Pending;
                coordinator.store.put(&job).await;
            }
            let pending = job.status == JobStatus::Pending;
            let job_id = job.job_id.clone();
            coordinator.jobs.insert(
                job_id.clone(),
                Arc::new(JobEntry {
                    job: Mutex::new(job),
                    cancel: Arc::new(AtomicBool::new(false)),
                }),
            );
            if pending {
                to_enqueue.push(job_id);
            }
        }
        {
            let mut queue = coordinator.pending.lock().await;
            queue.extend(to_enqueue);
        }
        coordinator.refresh_counts().await;

        for _ in 0..config.max_parallel_jobs {
            coordinator.clone().try_start_next().await;
        }

        coordinator
    }

    pub async fn submit(
        self: &Arc<Self>,
        job_type: JobType,
        model_name: String,
        dataset_ref: String,
        params: serde_json::Value,
    ) -> String {
        let job_id = Uuid::new_v4().to_string();
        let job = LearningJob::new(job_id.clone(), job_type, model_name, dataset_ref, params);
        self.store.put(&job).await;
        self.jobs.insert(
            job_id.clone(),
            Arc::new(JobEntry {
                job: Mutex::new(job),
                cancel: Arc::new(AtomicBool::new(false)),
            }),
        );
        {
            let mut queue = self.pending.lock().await;
            queue.push_back(job_id.clone());
        }
        self.refresh_counts().await;
        self.clone().try_start_next().await;
        job_id
    }

    pub async fn status(&self, job_id: &str) -> Option<LearningJob> {
        let entry = self.jobs.get(job_id)?.clone();
        let job = entry.job.lock().await;
        Some(job.clone())
    }

    pub async fn list(&self, filter: Option<JobFilter>) -> Vec<LearningJob> {
        let mut out = Vec::new();
        for entry in self.jobs.iter() {
            let job = entry.value().job.lock().await;
            if let Some(f) = &filter {
                if let Some(status) = f.status {
                    if job.status != status {
                        continue;
                    }
                }
            }
            out.push(job.clone());
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Cancellation is observed at the job's next progress checkpoint for a
    /// running job, or prevents start entirely for a still-pending one.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let Some(entry) = self.jobs.get(job_id).map(|e| e.clone()) else {
            return false;
        };
        let mut job = entry.job.lock().await;
        if job.status.is_terminal() {
            return false;
        }
        entry.cancel.store(true, Ordering::SeqCst);
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(chrono::Utc::now());
        job.error = Some("job cancelled".to_string());
        self.store.put(&job).await;
        drop(job);
        self.refresh_counts().await;
        true
    }

    async fn refresh_counts(&self) {
        let mut pending = 0i64;
        let mut running = 0i64;
        let mut completed = 0i64;
        let mut failed = 0i64;
        let mut cancelled = 0i64;
        for entry in self.jobs.iter() {
            match entry.value().job.lock().await.status {
                JobStatus::Pending => pending += 1,
                JobStatus::Running => running += 1,
                JobStatus::Completed => completed += 1,
                JobStatus::Failed => failed += 1,
                JobStatus::Cancelled => cancelled += 1,
            }
        }
        self.telemetry.set_learning_jobs("pending", pending);
        self.telemetry.set_learning_jobs("running", running);
        self.telemetry.set_learning_jobs("completed", completed);
        self.telemetry.set_learning_jobs("failed", failed);
        self.telemetry.set_learning_jobs("cancelled", cancelled);
    }

    /// Pops the oldest pending job and starts it if a running slot is free.
    /// A no-op when the queue is empty or all slots are in use; called
    /// again by the finishing worker so the queue keeps draining.
    async fn try_start_next(self: Arc<Self>) {
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => return,
        };

        let job_id = loop {
            let next = self.pending.lock().await.pop_front();
            match next {
                None => {
                    drop(permit);
                    return;
                }
                Some(id) => {
                    // A pending job may have been cancelled while queued;
                    // skip it and look for the next one.
                    if let Some(entry) = self.jobs.get(&id) {
                        let job = entry.job.lock().await;
                        if job.status == JobStatus::Pending {
                            break id;
                        }
                    }
                }
            }
        };

        let entry = match self.jobs.get(&job_id) {
            Some(e) => e.clone(),
            None => {
                drop(permit);
                return;
            }
        };

        {
            let mut job = entry.job.lock().await;
            job.status = JobStatus::Running;
            job.started_at = Some(chrono::Utc::now());
            self.store.put(&job).await;
        }
        self.refresh_counts().await;

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.run_job(job_id, entry, permit).await;
        });
    }

    async fn run_job(self: Arc<Self>, job_id: String, entry: Arc<JobEntry>, permit: tokio::sync::OwnedSemaphorePermit) {
        let job_type = entry.job.lock().await.job_type;
        let started = std::time::Instant::now();

        let entry_for_progress = entry.clone();
        let store_for_progress = self.store.clone();
        let on_progress = move |progress: f32| {
            let entry = entry_for_progress.clone();
            let store = store_for_progress.clone();
            tokio::spawn(async move {
                let mut job = entry.job.lock().await;
                job.progress = progress;
                store.put(&job).await;
            });
        };
        let cancel_flag = entry.cancel.clone();
        let should_cancel = move || cancel_flag.load(Ordering::SeqCst);

        let result = self.backend.run(job_type, &on_progress, &should_cancel).await;

        let mut job = entry.job.lock().await;
        let outcome: &'static str = match result {
            Ok(result_ref) => {
                job.status = JobStatus::Completed;
                job.progress = 1.0;
                job.result_ref = Some(result_ref);
                "completed"
            }
            Err(reason) if reason == "cancelled" => {
                job.status = JobStatus::Cancelled;
                job.error = Some(reason);
                "cancelled"
            }
            Err(reason) => {
                job.status = JobStatus::Failed;
                job.error = Some(reason.clone());
                self.telemetry.record_error("learning_job_failed", "learning");
                warn!(job_id = %job_id, reason, "learning job failed");
                "failed"
            }
        };
        job.completed_at = Some(chrono::Utc::now());
        self.store.put(&job).await;
        self.telemetry
            .record_learning_job_duration(job_type.as_str(), started.elapsed().as_secs_f64());
        self.telemetry.record_learning_job_outcome(job_type.as_str(), outcome);
        info!(job_id = %job_id, outcome, "learning job finished");
        drop(job);

        self.refresh_counts().await;
        drop(permit);
        self.try_start_next().await;
    }
}

/// Wraps a bare `CoordinatorError` for callers that need the typed error
/// form (e.g. transport adapters) rather than the `Option`/`bool` surface
/// above.
pub fn not_found(job_id: &str) -> CoordinatorError {
    CoordinatorError::LearningJobError {
        job_id: job_id.to_string(),
        reason: "job not found".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::MockLearningBackend;
    use store::InMemoryJobStore;

    async fn coordinator(max_parallel: usize) -> Arc<LearningCoordinator> {
        LearningCoordinator::new(
            LearningCoordinatorConfig { max_parallel_jobs: max_parallel },
            Arc::new(InMemoryJobStore::default()),
            Arc::new(MockLearningBackend { step_scale: 0.0001 }),
            Arc::new(Telemetry::new()),
        )
        .await
    }

    #[tokio::test]
    async fn submitted_job_runs_to_completion() {
        let coord = coordinator(2).await;
        let id = coord.submit(JobType::Lora, "m".into(), "/d".into(), serde_json::json!({})).await;
        for _ in 0..100 {
            if coord.status(&id).await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let job = coord.status(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.result_ref.is_some());
    }

    #[tokio::test]
    async fn queue_drains_oldest_first_within_parallelism_cap() {
        let coord = coordinator(1).await;
        let a = coord.submit(JobType::Lora, "m".into(), "/d".into(), serde_json::json!({})).await;
        let b = coord.submit(JobType::Lora, "m".into(), "/d".into(), serde_json::json!({})).await;
        // With one slot, b must still be pending while a is running.
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        assert_eq!(coord.status(&a).await.unwrap().status, JobStatus::Running);
        assert_eq!(coord.status(&b).await.unwrap().status, JobStatus::Pending);
        for _ in 0..200 {
            if coord.status(&b).await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(coord.status(&b).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_of_pending_job_prevents_it_from_running() {
        let coord = coordinator(1).await;
        let a = coord.submit(JobType::Lora, "m".into(), "/d".into(), serde_json::json!({})).await;
        let b = coord.submit(JobType::Lora, "m".into(), "/d".into(), serde_json::json!({})).await;
        assert!(coord.cancel(&b).await);
        assert_eq!(coord.status(&b).await.unwrap().status, JobStatus::Cancelled);
        for _ in 0..200 {
            if coord.status(&a).await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(coord.status(&a).await.unwrap().status, JobStatus::Completed);
        // b was never started.
        assert!(coord.status(&b).await.unwrap().started_at.is_none());
    }

    #[tokio::test]
    async fn cancel_of_unknown_job_returns_false() {
        let coord = coordinator(1).await;
        assert!(!coord.cancel("nope").await);
    }

    #[tokio::test]
    async fn running_jobs_are_demoted_to_pending_on_restart() {
        let store = Arc::new(InMemoryJobStore::default());
        let mut stuck = LearningJob::new("j1".into(), JobType::FineTune, "m".into(), "/d".into(), serde_json::json!({}));
        stuck.status = JobStatus::Running;
        stuck.started_at = Some(chrono::Utc::now());
        store.put(&stuck).await;

        let coord = LearningCoordinator::new(
            LearningCoordinatorConfig { max_parallel_jobs: 1 },
            store,
            Arc::new(MockLearningBackend { step_scale: 0.0001 }),
            Arc::new(Telemetry::new()),
        )
        .await;

        for _ in 0..200 {
            if coord.status("j1").await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(coord.status("j1").await.unwrap().status, JobStatus::Completed);
    }
}
