//! Side-store persistence for VRAM allocation records.
//!
//! The original keys allocations into Redis under `moc:allocation:{name}`
//! with a 24h TTL, purging on startup any record whose model is no longer
//! configured. We keep the same key shape and TTL but back it with an
//! in-process TTL map rather than fabricating a Redis dependency the
//! teacher workspace does not carry; a real deployment can swap in a
//! networked store behind the same `SideStore` trait. Per §4.2, failures to
//! read/write are logged and counted but never fail the in-memory
//! allocation path, which remains authoritative.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub const ALLOCATION_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedAllocation {
    pub model_name: String,
    pub vram_mb: u64,
    pub allocated_at: chrono::DateTime<chrono::Utc>,
    pub last_accessed: chrono::DateTime<chrono::Utc>,
    pub access_count: u64,
}

#[async_trait]
pub trait SideStore: Send + Sync {
    async fn put(&self, record: PersistedAllocation) -> std::io::Result<()>;
    async fn delete(&self, model_name: &str) -> std::io::Result<()>;
    /// All non-expired records, used to rehydrate the allocation map at
    /// startup.
    async fn load_all(&self) -> std::io::Result<Vec<PersistedAllocation>>;
}

pub fn allocation_key(model_name: &str) -> String {
    format!("moc:allocation:{model_name}")
}

/// In-memory stand-in for a networked TTL key-value store.
pub struct InMemorySideStore {
    entries: DashMap<String, (PersistedAllocation, Instant)>,
}

impl Default for InMemorySideStore {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl SideStore for InMemorySideStore {
    async fn put(&self, record: PersistedAllocation) -> std::io::Result<()> {
        let key = allocation_key(&record.model_name);
        self.entries
            .insert(key, (record, Instant::now() + ALLOCATION_TTL));
        Ok(())
    }

    async fn delete(&self, model_name: &str) -> std::io::Result<()> {
        self.entries.remove(&allocation_key(model_name));
        Ok(())
    }

    async fn load_all(&self) -> std::io::Result<Vec<PersistedAllocation>> {
        let now = Instant::now();
        let live: Vec<PersistedAllocation> = self
            .entries
            .iter()
            .filter(|e| e.value().1 > now)
            .map(|e| e.value().0.clone())
            .collect();
        self.entries.retain(|_, (_, expires)| *expires > now);
        Ok(live)
    }
}
