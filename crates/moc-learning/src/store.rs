//! Durable job record storage.
//!
//! The original keys job records into a SQLite table. The config surface
//! this workspace carries over (`learning.job_store`, default
//! `./data/learning_jobs.json`) names a JSON file rather than a `.db` path,
//! so the durable store here is a whole-file JSON map rewritten on every
//! mutation — the same atomic-rewrite idiom `agent_state.rs` uses for
//! on-disk agent metadata, applied to a `job_id -> LearningJob` map instead
//! of a per-agent file. Fully in-memory stores remain available behind the
//! same trait for tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::types::LearningJob;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn put(&self, job: &LearningJob);
    async fn load_all(&self) -> Vec<LearningJob>;
}

/// Non-persistent store; records live only as long as the process does.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<String, LearningJob>,
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn put(&self, job: &LearningJob) {
        self.jobs.insert(job.job_id.clone(), job.clone());
    }

    async fn load_all(&self) -> Vec<LearningJob> {
        self.jobs.iter().map(|e| e.value().clone()).collect()
    }
}

/// Whole-file JSON persistence keyed by `job_id`. Writes are serialized by
/// an internal mutex so concurrent job-progress updates cannot interleave
/// a torn write.
pub struct JsonFileJobStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_map(&self) -> Vec<LearningJob> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl JobStore for JsonFileJobStore {
    async fn put(&self, job: &LearningJob) {
        let _guard = self.write_lock.lock().await;
        let mut jobs = self.read_map().await;
        if let Some(existing) = jobs.iter_mut().find(|j| j.job_id == job.job_id) {
            *existing = job.clone();
        } else {
            jobs.push(job.clone());
        }
        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(error = %e, "failed to create learning job store directory");
                return;
            }
        }
        match serde_json::to_vec_pretty(&jobs) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&self.path, bytes).await {
                    warn!(error = %e, path = %self.path.display(), "failed to persist learning job record");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize learning job records"),
        }
    }

    async fn load_all(&self) -> Vec<LearningJob> {
        self.read_map().await
    }
}

pub fn store_for_path(path: impl Into<PathBuf>) -> Arc<dyn JobStore> {
    Arc::new(JsonFileJobStore::new(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobStatus, JobType};

    #[tokio::test]
    async fn json_file_store_roundtrips_and_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        let store = JsonFileJobStore::new(&path);

        let mut job = LearningJob::new("j1".into(), JobType::Lora, "m".into(), "/d".into(), serde_json::json!({}));
        store.put(&job).await;
        job.status = JobStatus::Running;
        store.put(&job).await;

        let loaded = store.load_all().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, JobStatus::Running);
    }
}
