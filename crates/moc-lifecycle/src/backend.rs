//! Opaque load/unload operation. The core treats model loads as opaque per
//! §1; concrete ML framework integration is out of scope, grounded on the
//! `ModelBackend` async-trait of `model_pool.rs`.

use async_trait::async_trait;
use std::sync::Arc;

use crate::model::{ModelDescriptor, ModelHandle};

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Perform the opaque load. Returns the resulting handle.
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<ModelHandle, String>;
    async fn unload(&self, handle: &ModelHandle) -> Result<(), String>;
    /// Liveness check for `ServingMethod::RemoteRpc` /
    /// `RemotePubSubHealth` models, dialed against `descriptor.endpoint`.
    /// `LocalDirect`/`LocalServer` models are never probed through this
    /// path — an in-process handle is live by construction.
    async fn probe_health(&self, descriptor: &ModelDescriptor) -> Result<(), String>;
}

/// Mock backend used when no real ML framework is wired in (mirrors
/// `model_pool.rs`'s `MockModelBackend`).
pub struct MockModelBackend;

#[async_trait]
impl ModelBackend for MockModelBackend {
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<ModelHandle, String> {
        Ok(ModelHandle(Arc::from(format!("mock-handle:{}", descriptor.name))))
    }

    async fn unload(&self, _handle: &ModelHandle) -> Result<(), String> {
        Ok(())
    }

    async fn probe_health(&self, _descriptor: &ModelDescriptor) -> Result<(), String> {
        Ok(())
    }
}

/// `1.5 × file_size_mb`, floored at 1 GB per shard, falling back to 4000 MB
/// when the source's size cannot be determined — exactly the original's
/// `_estimate_vram_requirements`, kept as the fallback heuristic per §9:
/// an operator-configured `estimated_vram_mb` always takes precedence over
/// this estimate (see `LifecycleManager::resolve_vram_estimate`).
pub fn estimate_vram_mb_from_source(source: &str, shards: u32) -> u64 {
    const FALLBACK_MB: u64 = 4000;
    const MIN_PER_SHARD_MB: u64 = 1000;

    let file_size_mb = match std::fs::metadata(source) {
        Ok(meta) => meta.len() / (1024 * 1024),
        Err(_) => return FALLBACK_MB,
    };
    let base_requirement = (file_size_mb as f64 * 1.5) as u64;
    let shards = shards.max(1) as u64;
    (base_requirement / shards).max(MIN_PER_SHARD_MB)
}
