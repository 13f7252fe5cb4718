//! C2 — GPU/VRAM Manager.
//!
//! Tracks physical devices, allocates and frees VRAM per model with LRU
//! eviction, arbitrates short-lived leases, and mirrors allocations to a
//! side-store. Grounded on the original `gpu_manager.py` for the exact
//! allocation/eviction/lease arithmetic, and on `model_pool.rs`'s
//! move-to-front `Vec<CacheEntry>` for the LRU bookkeeping idiom (here
//! applied to the allocation map rather than the handle cache, which lives
//! in `moc-lifecycle`).

pub mod device;
pub mod side_store;

use chrono::Utc;
use dashmap::DashMap;
use error_stack::Report;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use device::{Device, DeviceProvider, MockDeviceProvider};
use moc_bus::{Event, EventBus};
use moc_errors::CoordinatorError;
use moc_telemetry::Telemetry;
use side_store::{PersistedAllocation, SideStore};

/// Wraps a side-store I/O failure with the component-boundary context
/// `error_stack::Report<CoordinatorError>` requires before it's logged —
/// these never fail the in-memory allocation path (§4.2), so the report is
/// surfaced for diagnosis, not propagated.
fn side_store_report(action: &'static str, model: &str, source: std::io::Error) -> Report<CoordinatorError> {
    Report::new(source)
        .attach(format!("model {model}"))
        .change_context(CoordinatorError::ConfigurationError {
            key: "side_store".to_string(),
            reason: format!("{action} failed"),
        })
}

#[derive(Debug, Clone)]
pub struct Allocation {
    pub model_name: String,
    pub vram_mb: u64,
    pub allocated_at: chrono::DateTime<chrono::Utc>,
    pub last_accessed: chrono::DateTime<chrono::Utc>,
    pub access_count: u64,
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: String,
    pub client: String,
    pub model_name: String,
    pub vram_mb: u64,
    pub priority: i32,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct Usage {
    pub total_mb: u64,
    pub allocated_mb: u64,
    pub available_mb: u64,
    pub soft_limit_mb: u64,
    pub usage_pct: f64,
}

#[derive(Debug)]
pub enum LeaseOutcome {
    Granted { lease_id: String, vram_reserved_mb: u64 },
    Denied { reason: String, retry_after_ms: u64 },
}

/// Consulted before evicting a candidate model; implemented by
/// `moc-lifecycle` and wired in after both managers are constructed (the
/// two crates would otherwise need to depend on each other, which the
/// ownership rules of §3 rule out — see "Cyclic and shared references" in
/// §9).
pub trait EvictionGuard: Send + Sync {
    /// `false` means the model must not be auto-evicted right now: either
    /// it is `critical` priority or the Inference Executor holds live
    /// references to it.
    fn is_evictable(&self, model_name: &str) -> bool;
}

pub struct GpuManagerConfig {
    pub soft_limit_mb: u64,
    pub eviction_threshold_pct: u8,
    pub poll_interval_sec: u64,
}

impl Default for GpuManagerConfig {
    fn default() -> Self {
        Self {
            soft_limit_mb: 22000,
            eviction_threshold_pct: 90,
            poll_interval_sec: 5,
        }
    }
}

pub struct GpuManager {
    config: GpuManagerConfig,
    provider: Arc<dyn DeviceProvider>,
    side_store: Arc<dyn SideStore>,
    telemetry: Arc<Telemetry>,
    bus: Option<Arc<EventBus>>,
    eviction_guard: RwLock<Option<Arc<dyn EvictionGuard>>>,

    allocations: DashMap<String, Allocation>,
    leases: DashMap<String, Lease>,
    devices: RwLock<Vec<Device>>,
    consecutive_failures: AtomicU32,
    degraded: std::sync::atomic::AtomicBool,
    /// Devices for which a warning was published on the previous poll, so
    /// the event fires once per crossing rather than once per tick while
    /// usage stays above the threshold.
    warned_devices: DashMap<u32, ()>,
}

const DEGRADED_AFTER_FAILURES: u32 = 5;

impl GpuManager {
    pub fn new(config: GpuManagerConfig, telemetry: Arc<Telemetry>) -> Self {
        Self {
            config,
            provider: Arc::new(MockDeviceProvider::default()),
            side_store: Arc::new(side_store::InMemorySideStore::default()),
            telemetry,
            bus: None,
            eviction_guard: RwLock::new(None),
            allocations: DashMap::new(),
            leases: DashMap::new(),
            devices: RwLock::new(Vec::new()),
            consecutive_failures: AtomicU32::new(0),
            degraded: std::sync::atomic::AtomicBool::new(false),
            warned_devices: DashMap::new(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn DeviceProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_side_store(mut self, side_store: Arc<dyn SideStore>) -> Self {
        self.side_store = side_store;
        self
    }

    /// Wires the event bus `memory.pressure.warning` is published on (§6).
    /// Optional: a `GpuManager` with no bus attached simply never emits the
    /// event, matching how `eviction_guard` is also wired in after
    /// construction once the dependent crate's manager exists.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub async fn set_eviction_guard(&self, guard: Arc<dyn EvictionGuard>) {
        *self.eviction_guard.write().await = Some(guard);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Rehydrate the allocation map from the side-store and perform an
    /// initial device query. `known_models` restricts which persisted
    /// records are kept; any record for a model no longer configured is
    /// purged, per §3.
    pub async fn start(&self, known_models: &[String]) {
        match self.side_store.load_all().await {
            Ok(records) => {
                for record in records {
                    if known_models.iter().any(|m| m == &record.model_name) {
                        self.allocations.insert(
                            record.model_name.clone(),
                            Allocation {
                                model_name: record.model_name,
                                vram_mb: record.vram_mb,
                                allocated_at: record.allocated_at,
                                last_accessed: record.last_accessed,
                                access_count: record.access_count,
                            },
                        );
                    } else if let Err(e) = self.side_store.delete(&record.model_name).await {
                        let report = side_store_report("purge stale record", &record.model_name, e);
                        warn!(model = %record.model_name, error = ?report, "side-store purge failed");
                    }
                }
            }
            Err(e) => {
                let report = side_store_report("load_all", "<all>", e);
                warn!(error = ?report, "failed to rehydrate VRAM allocations from side-store");
            }
        }
        self.poll_once().await;
    }

    fn total_mb(&self, devices: &[Device]) -> u64 {
        devices.iter().map(|d| d.total_vram_mb).sum()
    }

    fn capacity_mb(&self, devices: &[Device]) -> u64 {
        self.total_mb(devices).min(self.config.soft_limit_mb)
    }

    fn allocated_mb(&self) -> u64 {
        self.allocations.iter().map(|e| e.value().vram_mb).sum()
    }

    fn leased_mb(&self) -> u64 {
        let now = Utc::now();
        self.leases
            .iter()
            .filter(|e| e.value().expires_at > now)
            .map(|e| e.value().vram_mb)
            .sum()
    }

    pub async fn usage(&self) -> Usage {
        let devices = self.devices.read().await.clone();
        let total = self.total_mb(&devices);
        let cap = self.capacity_mb(&devices);
        let allocated = self.allocated_mb();
        let available = cap.saturating_sub(allocated);
        let usage_pct = if cap == 0 { 0.0 } else { (allocated as f64 / cap as f64) * 100.0 };
        Usage {
            total_mb: total,
            allocated_mb: allocated,
            available_mb: available,
            soft_limit_mb: self.config.soft_limit_mb,
            usage_pct,
        }
    }

    pub async fn info(&self) -> Vec<Device> {
        self.devices.read().await.clone()
    }

    /// Idempotent for an already-allocated model: refreshes `last_accessed`
    /// and bumps `access_count` instead of re-allocating.
    pub async fn allocate(&self, model_name: &str, required_mb: u64) -> Result<(), CoordinatorError> {
        if let Some(mut existing) = self.allocations.get_mut(model_name) {
            existing.last_accessed = Utc::now();
            existing.access_count += 1;
            self.mirror_to_side_store(&existing).await;
            return Ok(());
        }

        let devices = self.devices.read().await.clone();
        let cap = self.capacity_mb(&devices);
        let mut available = cap.saturating_sub(self.allocated_mb());

        if available < required_mb {
            let needed = required_mb - available;
            let freed = self.evict_for_space(needed).await;
            available += freed;
        }

        if available < required_mb {
            return Err(CoordinatorError::GpuUnavailable {
                required_mb,
                available_mb: available,
            });
        }

        let now = Utc::now();
        let allocation = Allocation {
            model_name: model_name.to_string(),
            vram_mb: required_mb,
            allocated_at: now,
            last_accessed: now,
            access_count: 1,
        };
        self.allocations.insert(model_name.to_string(), allocation.clone());
        self.mirror_to_side_store(&allocation).await;
        self.telemetry.set_model_vram_usage_mb(model_name, required_mb);
        Ok(())
    }

    pub async fn free(&self, model_name: &str) -> u64 {
        if let Some((_, allocation)) = self.allocations.remove(model_name) {
            if let Err(e) = self.side_store.delete(model_name).await {
                let report = side_store_report("delete", model_name, e);
                warn!(model = model_name, error = ?report, "side-store delete failed");
            }
            self.telemetry.clear_model_vram_usage(model_name);
            allocation.vram_mb
        } else {
            0
        }
    }

    pub async fn touch(&self, model_name: &str) {
        if let Some(mut allocation) = self.allocations.get_mut(model_name) {
            allocation.last_accessed = Utc::now();
            allocation.access_count += 1;
            self.mirror_to_side_store(&allocation).await;
        }
    }

    async fn mirror_to_side_store(&self, allocation: &Allocation) {
        let record = PersistedAllocation {
            model_name: allocation.model_name.clone(),
            vram_mb: allocation.vram_mb,
            allocated_at: allocation.allocated_at,
            last_accessed: allocation.last_accessed,
            access_count: allocation.access_count,
        };
        if let Err(e) = self.side_store.put(record).await {
            let report = side_store_report("put", &allocation.model_name, e);
            warn!(model = %allocation.model_name, error = ?report, "side-store write failed");
        }
    }

    /// Evict LRU-then-LFU candidates until at least `needed_mb` has been
    /// freed or no evictable candidate remains. Returns the MB actually
    /// freed.
    async fn evict_for_space(&self, needed_mb: u64) -> u64 {
        let guard = self.eviction_guard.read().await;
        let mut freed = 0u64;

        loop {
            if freed >= needed_mb {
                break;
            }
            let candidate = {
                let mut best: Option<(String, chrono::DateTime<chrono::Utc>, u64)> = None;
                for entry in self.allocations.iter() {
                    let name = entry.key().clone();
                    let evictable = guard.as_ref().map(|g| g.is_evictable(&name)).unwrap_or(true);
                    if !evictable {
                        continue;
                    }
                    let a = entry.value();
                    let key = (a.last_accessed, a.access_count);
                    match &best {
                        None => best = Some((name, a.last_accessed, a.access_count)),
                        Some((_, la, ac)) if key < (*la, *ac) => {
                            best = Some((name, a.last_accessed, a.access_count))
                        }
                        _ => {}
                    }
                }
                best.map(|(name, _, _)| name)
            };

            match candidate {
                Some(name) => {
                    let freed_mb = self.free(&name).await;
                    info!(model = %name, freed_mb, "evicted model to reclaim VRAM");
                    freed += freed_mb;
                }
                None => break,
            }
        }
        freed
    }

    /// Evicts down to `eviction_threshold_pct × 0.8 × total` when current
    /// usage exceeds the threshold, matching the background-poll path of
    /// §4.2 (distinct from the allocation-time path above, which evicts
    /// only as much as is required for the incoming request).
    pub async fn run_eviction_check(&self) {
        let usage = self.usage().await;
        if usage.total_mb == 0 || usage.usage_pct <= self.config.eviction_threshold_pct as f64 {
            return;
        }
        let target_mb = (self.config.eviction_threshold_pct as f64 / 100.0 * 0.8 * usage.total_mb as f64) as u64;
        if usage.allocated_mb <= target_mb {
            return;
        }
        let to_free = usage.allocated_mb - target_mb;
        let freed = self.evict_for_space(to_free).await;
        if freed < to_free {
            warn!(
                freed_mb = freed,
                needed_mb = to_free,
                "eviction pass could not reach target; no further evictable candidates"
            );
        }
    }

    pub async fn acquire_lease(
        &self,
        client: &str,
        model_name: &str,
        vram_estimate_mb: u64,
        ttl_sec: u64,
        priority: i32,
    ) -> LeaseOutcome {
        let now = Utc::now();
        self.leases.retain(|_, l| l.expires_at > now);

        let devices = self.devices.read().await.clone();
        let cap = self.capacity_mb(&devices);
        let committed = self.allocated_mb() + self.leased_mb();
        let available = cap.saturating_sub(committed);

        if available < vram_estimate_mb {
            return LeaseOutcome::Denied {
                reason: "Insufficient VRAM".to_string(),
                retry_after_ms: 250,
            };
        }

        let lease_id = Uuid::new_v4().to_string();
        self.leases.insert(
            lease_id.clone(),
            Lease {
                lease_id: lease_id.clone(),
                client: client.to_string(),
                model_name: model_name.to_string(),
                vram_mb: vram_estimate_mb,
                priority,
                expires_at: now + chrono::Duration::seconds(ttl_sec as i64),
            },
        );
        LeaseOutcome::Granted {
            lease_id,
            vram_reserved_mb: vram_estimate_mb,
        }
    }

    pub fn release_lease(&self, lease_id: &str) {
        self.leases.remove(lease_id);
    }

    /// Query devices, falling back to last-known values on failure and
    /// tracking consecutive failures toward the "degraded" classification
    /// of §4.2.
    pub async fn poll_once(&self) {
        match self.provider.query().await {
            Ok(devices) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.degraded.store(false, Ordering::Relaxed);
                for d in &devices {
                    self.telemetry
                        .set_device_metrics(d.index, d.utilization_pct, d.used_vram_mb, d.total_vram_mb);
                    self.check_memory_pressure(d);
                }
                *self.devices.write().await = devices;
            }
            Err(e) => {
                self.telemetry.record_error("device_query_failed", "gpu_manager");
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(error = %e, failures, "device query failed, retaining last-known values");
                if failures >= DEGRADED_AFTER_FAILURES {
                    self.degraded.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    /// Publishes `memory.pressure.warning` (§6) the moment a device's VRAM
    /// usage crosses `eviction_threshold_pct`, and clears the latch once it
    /// drops back below so the next crossing re-fires rather than staying
    /// silent forever after the first warning.
    fn check_memory_pressure(&self, device: &Device) {
        if device.total_vram_mb == 0 {
            return;
        }
        let usage_pct = device.used_vram_mb as f64 / device.total_vram_mb as f64 * 100.0;
        let crossed = usage_pct >= self.config.eviction_threshold_pct as f64;
        let already_warned = self.warned_devices.contains_key(&device.index);

        if crossed && !already_warned {
            self.warned_devices.insert(device.index, ());
            if let Some(bus) = &self.bus {
                bus.publish(Event::MemoryPressureWarning {
                    device_id: device.index,
                    usage_pct,
                    at: Utc::now(),
                });
            }
            warn!(device = device.index, usage_pct, "device VRAM usage crossed warning threshold");
        } else if !crossed && already_warned {
            self.warned_devices.remove(&device.index);
        }
    }

    /// One tick of the background poll described in §4.2 / §4.7: refresh
    /// device metrics then run the eviction check.
    pub async fn tick(&self) {
        self.poll_once().await;
        self.run_eviction_check().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn telemetry() -> Arc<Telemetry> {
        Arc::new(Telemetry::new())
    }

    async fn manager_with_devices(total_mb: u64, soft_limit_mb: u64) -> GpuManager {
        struct Fixed(u64);
        #[async_trait::async_trait]
        impl DeviceProvider for Fixed {
            async fn query(&self) -> std::io::Result<Vec<Device>> {
                Ok(vec![Device {
                    index: 0,
                    name: "t".into(),
                    total_vram_mb: self.0,
                    used_vram_mb: 0,
                    free_vram_mb: self.0,
                    utilization_pct: 0.0,
                    temperature_c: 0.0,
                }])
            }
        }
        let mgr = GpuManager::new(
            GpuManagerConfig {
                soft_limit_mb,
                eviction_threshold_pct: 90,
                poll_interval_sec: 5,
            },
            telemetry(),
        )
        .with_provider(Arc::new(Fixed(total_mb)));
        mgr.start(&[]).await;
        mgr
    }

    #[tokio::test]
    async fn allocation_exactly_at_available_succeeds_one_over_fails() {
        let mgr = manager_with_devices(24000, 22000).await;
        assert!(mgr.allocate("a", 22000).await.is_ok());
        mgr.free("a").await;
        assert!(mgr.allocate("a", 22000).await.is_ok());
        let err = mgr.allocate("b", 1).await.unwrap_err();
        match err {
            CoordinatorError::GpuUnavailable { required_mb, available_mb } => {
                assert_eq!(required_mb, 1);
                assert_eq!(available_mb, 0);
            }
            _ => panic!("wrong error"),
        }
    }

    #[tokio::test]
    async fn allocate_is_idempotent_for_already_loaded_model() {
        let mgr = manager_with_devices(24000, 22000).await;
        mgr.allocate("m", 9000).await.unwrap();
        mgr.allocate("m", 9000).await.unwrap();
        assert_eq!(mgr.usage().await.allocated_mb, 9000);
        assert_eq!(mgr.allocations.get("m").unwrap().access_count, 2);
    }

    #[tokio::test]
    async fn lru_eviction_picks_oldest_access() {
        let mgr = manager_with_devices(24000, 22000).await;
        mgr.allocate("a", 8000).await.unwrap();
        mgr.touch("a").await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        mgr.allocate("b", 8000).await.unwrap();
        // current used = 16000, available = 6000; c needs 8000 -> evict a (older)
        mgr.allocate("c", 8000).await.unwrap();
        assert!(mgr.allocations.get("a").is_none());
        assert!(mgr.allocations.get("b").is_some());
        assert!(mgr.allocations.get("c").is_some());
    }

    #[tokio::test]
    async fn critical_priority_model_is_never_evicted() {
        struct NeverEvict;
        impl EvictionGuard for NeverEvict {
            fn is_evictable(&self, model_name: &str) -> bool {
                model_name != "critical-model"
            }
        }
        let mgr = manager_with_devices(24000, 16000).await;
        mgr.set_eviction_guard(Arc::new(NeverEvict)).await;
        mgr.allocate("critical-model", 16000).await.unwrap();
        let err = mgr.allocate("other", 1).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::GpuUnavailable { .. }));
        assert!(mgr.allocations.get("critical-model").is_some());
    }

    #[tokio::test]
    async fn lease_arbitration_denies_then_grants_after_release() {
        let mgr = manager_with_devices(24000, 22000).await;
        let a = mgr.acquire_lease("A", "big", 20000, 30, 5).await;
        let lease_id = match a {
            LeaseOutcome::Granted { lease_id, vram_reserved_mb } => {
                assert_eq!(vram_reserved_mb, 20000);
                lease_id
            }
            _ => panic!("expected grant"),
        };
        let b = mgr.acquire_lease("B", "big2", 4000, 30, 5).await;
        match b {
            LeaseOutcome::Denied { reason, retry_after_ms } => {
                assert_eq!(reason, "Insufficient VRAM");
                assert_eq!(retry_after_ms, 250);
            }
            _ => panic!("expected denial"),
        }
        mgr.release_lease(&lease_id);
        let c = mgr.acquire_lease("B", "big2", 4000, 30, 5).await;
        assert!(matches!(c, LeaseOutcome::Granted { .. }));
    }

    #[tokio::test]
    async fn free_of_absent_model_returns_zero() {
        let mgr = manager_with_devices(24000, 22000).await;
        assert_eq!(mgr.free("nope").await, 0);
    }

    #[tokio::test]
    async fn memory_pressure_warning_publishes_once_per_crossing() {
        struct Hot(Arc<AtomicU64>);
        #[async_trait::async_trait]
        impl DeviceProvider for Hot {
            async fn query(&self) -> std::io::Result<Vec<Device>> {
                let used = self.0.load(Ordering::Relaxed);
                Ok(vec![Device {
                    index: 0,
                    name: "t".into(),
                    total_vram_mb: 10_000,
                    used_vram_mb: used,
                    free_vram_mb: 10_000 - used,
                    utilization_pct: 0.0,
                    temperature_c: 0.0,
                }])
            }
        }

        let used = Arc::new(AtomicU64::new(5_000));
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe("memory.pressure.warning");
        let mgr = GpuManager::new(
            GpuManagerConfig {
                soft_limit_mb: 10_000,
                eviction_threshold_pct: 90,
                poll_interval_sec: 5,
            },
            telemetry(),
        )
        .with_provider(Arc::new(Hot(used.clone())))
        .with_bus(bus);
        mgr.start(&[]).await;

        // Below threshold: no warning yet.
        assert!(rx.try_recv().is_err());

        // Cross the threshold: exactly one warning is published.
        used.store(9_500, Ordering::Relaxed);
        mgr.poll_once().await;
        let evt = rx.try_recv().unwrap();
        match evt {
            Event::MemoryPressureWarning { device_id, usage_pct, .. } => {
                assert_eq!(device_id, 0);
                assert!(usage_pct >= 90.0);
            }
            _ => panic!("wrong event published"),
        }

        // Staying above the threshold does not re-fire.
        mgr.poll_once().await;
        assert!(rx.try_recv().is_err());

        // Dropping back below and crossing again re-fires.
        used.store(1_000, Ordering::Relaxed);
        mgr.poll_once().await;
        used.store(9_500, Ordering::Relaxed);
        mgr.poll_once().await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn allocate_succeeds_even_when_side_store_write_fails() {
        struct AlwaysFails;
        #[async_trait::async_trait]
        impl SideStore for AlwaysFails {
            async fn put(&self, _record: PersistedAllocation) -> std::io::Result<()> {
                Err(std::io::Error::other("store unreachable"))
            }
            async fn delete(&self, _model_name: &str) -> std::io::Result<()> {
                Err(std::io::Error::other("store unreachable"))
            }
            async fn load_all(&self) -> std::io::Result<Vec<PersistedAllocation>> {
                Err(std::io::Error::other("store unreachable"))
            }
        }

        let mgr = GpuManager::new(
            GpuManagerConfig {
                soft_limit_mb: 22000,
                eviction_threshold_pct: 90,
                poll_interval_sec: 5,
            },
            telemetry(),
        )
        .with_side_store(Arc::new(AlwaysFails));
        mgr.start(&[]).await;

        assert!(mgr.allocate("m", 9000).await.is_ok());
        assert_eq!(mgr.free("m").await, 9000);
    }
}
