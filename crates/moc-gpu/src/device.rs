//! Device enumeration.
//!
//! Devices are queried through a vendor library in production and are
//! mockable, per §3. Grounded on the original's `_detect_gpus`, which tries
//! `GPUtil` and falls back to a single mock device when no vendor library is
//! available — the fallback values (24000/1000/23000 MB, 5%, 45°C) are kept
//! verbatim so example configs and docs built against the original still
//! make sense.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub index: u32,
    pub name: String,
    pub total_vram_mb: u64,
    pub used_vram_mb: u64,
    pub free_vram_mb: u64,
    pub utilization_pct: f64,
    pub temperature_c: f64,
}

/// Abstraction over the vendor query mechanism. Implementations are free to
/// shell out to `nvidia-smi`, bind a vendor library, or (in tests) return
/// canned data.
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    async fn query(&self) -> std::io::Result<Vec<Device>>;
}

/// Fallback provider used when no real GPU vendor library is wired in.
/// Mirrors the original's mock GPU exactly.
pub struct MockDeviceProvider {
    devices: Vec<Device>,
}

impl Default for MockDeviceProvider {
    fn default() -> Self {
        Self {
            devices: vec![Device {
                index: 0,
                name: "Mock GPU".to_string(),
                total_vram_mb: 24000,
                used_vram_mb: 1000,
                free_vram_mb: 23000,
                utilization_pct: 5.0,
                temperature_c: 45.0,
            }],
        }
    }
}

#[async_trait]
impl DeviceProvider for MockDeviceProvider {
    async fn query(&self) -> std::io::Result<Vec<Device>> {
        Ok(self.devices.clone())
    }
}
