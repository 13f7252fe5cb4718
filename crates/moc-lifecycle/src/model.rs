//! Lifecycle data model — §3 "Model descriptor" / "Loaded-model record".

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Tagged variant over the serving capability set `{load, unload, infer,
/// probe_health}`, per the "Polymorphic serving methods" design note in §9 —
/// deliberately not an inheritance hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServingMethod {
    LocalDirect,
    LocalServer,
    RemoteRpc,
    RemotePubSubHealth,
}

impl Default for ServingMethod {
    fn default() -> Self {
        ServingMethod::LocalDirect
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quantization {
    Fp32,
    Fp16,
    Int8,
    Int4,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadParams {
    pub estimated_vram_mb: Option<u64>,
    pub quantization: Option<Quantization>,
    pub idle_timeout_sec: Option<u64>,
    pub priority: Option<Priority>,
    pub serving_method: Option<ServingMethod>,
    /// Address to dial for `RemoteRpc`/`RemotePubSubHealth` serving methods —
    /// required for those two, meaningless for `LocalDirect`/`LocalServer`.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub source: String,
    pub shards: u32,
    pub serving_method: ServingMethod,
    pub estimated_vram_mb: Option<u64>,
    pub quantization: Option<Quantization>,
    pub idle_timeout_sec: u64,
    pub priority: Priority,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ModelHandle(pub std::sync::Arc<str>);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedModel {
    pub descriptor: ModelDescriptor,
    pub state: ModelState,
    pub vram_mb: u64,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
    pub last_accessed: chrono::DateTime<chrono::Utc>,
    pub access_count: u64,
    #[serde(skip)]
    pub handle: Option<ModelHandle>,
}
