//! C3 — Lifecycle Manager.
//!
//! Owns the per-model state machine (`unloaded → loading → loaded →
//! unloading → unloaded`, with failure transitions from `loading`/
//! `unloading`), guarded by independent load/unload circuit breakers.
//! Grounded on the original `lifecycle.py` for the exact operation
//! semantics, with the per-model `threading.Lock` + `time.sleep(0.1)`
//! wait-for-in-flight-load loop replaced by a per-model `tokio::sync::Mutex`
//! (followers block on the lock itself and observe the first caller's
//! result once it releases, which is the "proper async-notify" upgrade
//! this spec calls for in place of polling).

pub mod backend;
pub mod circuit_breaker;
pub mod model;

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use backend::{estimate_vram_mb_from_source, ModelBackend};
use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use model::{LoadParams, LoadedModel, ModelDescriptor, ModelState, Priority, ServingMethod};

use moc_bus::{Event, EventBus};
use moc_errors::CoordinatorError;
use moc_gpu::{EvictionGuard, GpuManager};
use moc_telemetry::Telemetry;

struct ModelCell {
    state: ModelState,
    record: Option<LoadedModel>,
}

pub struct PreloadSpec {
    pub name: String,
    pub source: String,
    pub shards: u32,
}

pub struct LifecycleManagerConfig {
    pub load_circuit_breaker: CircuitBreakerConfig,
    pub unload_circuit_breaker: CircuitBreakerConfig,
}

impl Default for LifecycleManagerConfig {
    fn default() -> Self {
        Self {
            load_circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 4,
                reset_timeout: Duration::from_secs(20),
            },
            unload_circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 4,
                reset_timeout: Duration::from_secs(20),
            },
        }
    }
}

pub struct LifecycleManager {
    models: DashMap<String, Arc<Mutex<ModelCell>>>,
    priorities: DashMap<String, Priority>,
    refs: DashMap<String, AtomicI64>,
    load_breaker: CircuitBreaker,
    unload_breaker: CircuitBreaker,
    gpu: Arc<GpuManager>,
    bus: Arc<EventBus>,
    telemetry: Arc<Telemetry>,
    backend: Arc<dyn ModelBackend>,
}

impl LifecycleManager {
    pub fn new(
        config: LifecycleManagerConfig,
        gpu: Arc<GpuManager>,
        bus: Arc<EventBus>,
        telemetry: Arc<Telemetry>,
        backend: Arc<dyn ModelBackend>,
    ) -> Self {
        Self {
            models: DashMap::new(),
            priorities: DashMap::new(),
            refs: DashMap::new(),
            load_breaker: CircuitBreaker::new("load", config.load_circuit_breaker),
            unload_breaker: CircuitBreaker::new("unload", config.unload_circuit_breaker),
            gpu,
            bus,
            telemetry,
            backend,
        }
    }

    fn cell_for(&self, name: &str) -> Arc<Mutex<ModelCell>> {
        self.models
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ModelCell {
                    state: ModelState::Unloaded,
                    record: None,
                }))
            })
            .clone()
    }

    async fn sync_breaker_telemetry(&self, operation: &str, breaker: &CircuitBreaker) {
        let status = breaker.status().await;
        self.telemetry
            .set_circuit_breaker_state(operation, status.state.as_gauge());
    }

    /// Records a breaker trip for the "circuit-breaker trips by operation"
    /// counter. Only call this with the `bool` returned by
    /// `CircuitBreaker::record_failure`, so a trip is counted once per
    /// transition into `Open`, not once per rejected call while it stays
    /// open.
    fn record_breaker_trip(&self, operation: &str, tripped: bool) {
        if tripped {
            self.telemetry.record_circuit_breaker_failure(operation);
        }
    }

    pub async fn breaker_status(&self) -> (circuit_breaker::BreakerStatus, circuit_breaker::BreakerStatus) {
        (self.load_breaker.status().await, self.unload_breaker.status().await)
    }

    pub fn ref_count(&self, name: &str) -> i64 {
        self.refs.get(name).map(|r| r.load(Ordering::SeqCst)).unwrap_or(0)
    }

    pub fn inc_ref(&self, name: &str) {
        self.refs
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_ref(&self, name: &str) {
        if let Some(r) = self.refs.get(name) {
            r.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// At startup, the configured preload list is loaded sequentially;
    /// failures are logged, counted, and do not abort startup (§4.3).
    pub async fn preload(&self, specs: &[PreloadSpec]) {
        for spec in specs {
            if let Err(e) = self
                .load(&spec.name, &spec.source, spec.shards, None)
                .await
            {
                warn!(model = %spec.name, error = %e, "preload failed, continuing with remaining models");
                self.telemetry.record_error("preload_failed", "lifecycle");
            }
        }
    }

    fn resolve_vram_estimate(params: &Option<LoadParams>, source: &str, shards: u32) -> u64 {
        if let Some(p) = params {
            if let Some(mb) = p.estimated_vram_mb {
                return mb;
            }
        }
        estimate_vram_mb_from_source(source, shards)
    }

    pub async fn load(
        &self,
        name: &str,
        source: &str,
        shards: u32,
        params: Option<LoadParams>,
    ) -> Result<LoadedModel, CoordinatorError> {
        let cell = self.cell_for(name);
        let mut guard = cell.lock().await;

        if guard.state == ModelState::Loaded {
            if let Some(record) = &mut guard.record {
                record.last_accessed = chrono::Utc::now();
                record.access_count += 1;
                self.gpu.touch(name).await;
                return Ok(record.clone());
            }
        }

        if !self.load_breaker.allow().await {
            self.sync_breaker_telemetry("load", &self.load_breaker).await;
            let status = self.load_breaker.status().await;
            return Err(CoordinatorError::CircuitOpen {
                operation: "load".to_string(),
                failure_count: status.failure_count,
                retry_after_sec: self.load_breaker.reset_timeout().as_secs(),
            });
        }
        self.sync_breaker_telemetry("load", &self.load_breaker).await;

        let started = std::time::Instant::now();
        guard.state = ModelState::Loading;

        if tokio::fs::metadata(source).await.is_err() {
            guard.state = ModelState::Failed;
            let tripped = self.load_breaker.record_failure().await;
            self.record_breaker_trip("load", tripped);
            self.sync_breaker_telemetry("load", &self.load_breaker).await;
            self.telemetry.record_model_load(name, false, started.elapsed().as_secs_f64());
            return Err(CoordinatorError::ModelLoadError {
                name: name.to_string(),
                reason: "source does not exist".to_string(),
            });
        }

        let vram_mb = Self::resolve_vram_estimate(&params, source, shards);

        if let Err(e) = self.gpu.allocate(name, vram_mb).await {
            guard.state = ModelState::Failed;
            let tripped = self.load_breaker.record_failure().await;
            self.record_breaker_trip("load", tripped);
            self.sync_breaker_telemetry("load", &self.load_breaker).await;
            self.telemetry.record_model_load(name, false, started.elapsed().as_secs_f64());
            return Err(e);
        }

        let descriptor = ModelDescriptor {
            name: name.to_string(),
            source: source.to_string(),
            shards,
            serving_method: params.as_ref().and_then(|p| p.serving_method).unwrap_or_default(),
            estimated_vram_mb: params.as_ref().and_then(|p| p.estimated_vram_mb),
            quantization: params.as_ref().and_then(|p| p.quantization),
            idle_timeout_sec: params.as_ref().and_then(|p| p.idle_timeout_sec).unwrap_or(600),
            priority: params.as_ref().and_then(|p| p.priority).unwrap_or_default(),
            endpoint: params.as_ref().and_then(|p| p.endpoint.clone()),
        };

        match self.backend.load(&descriptor).await {
            Ok(handle) => {
                let now = chrono::Utc::now();
                let record = LoadedModel {
                    descriptor: descriptor.clone(),
                    state: ModelState::Loaded,
                    vram_mb,
                    loaded_at: now,
                    last_accessed: now,
                    access_count: 1,
                    handle: Some(handle),
                };
                guard.state = ModelState::Loaded;
                guard.record = Some(record.clone());
                self.priorities.insert(name.to_string(), descriptor.priority);
                self.refs.entry(name.to_string()).or_insert_with(|| AtomicI64::new(0));

                self.load_breaker.record_success().await;
                self.sync_breaker_telemetry("load", &self.load_breaker).await;
                self.telemetry.record_model_load(name, true, started.elapsed().as_secs_f64());
                self.telemetry.set_models_loaded(self.count_loaded().await as i64);
                self.bus.publish(Event::ModelLoaded {
                    model_name: name.to_string(),
                    vram_mb,
                    at: now,
                });
                info!(model = name, vram_mb, "model loaded");
                Ok(record)
            }
            Err(reason) => {
                self.gpu.free(name).await;
                guard.state = ModelState::Failed;
                let tripped = self.load_breaker.record_failure().await;
                self.record_breaker_trip("load", tripped);
                self.sync_breaker_telemetry("load", &self.load_breaker).await;
                self.telemetry.record_model_load(name, false, started.elapsed().as_secs_f64());
                Err(CoordinatorError::ModelLoadError {
                    name: name.to_string(),
                    reason,
                })
            }
        }
    }

    pub async fn ensure_loaded(
        &self,
        name: &str,
        source: &str,
        shards: u32,
    ) -> Result<LoadedModel, CoordinatorError> {
        self.load(name, source, shards, None).await
    }

    pub async fn unload(&self, name: &str, force: bool) -> Result<(), CoordinatorError> {
        let cell = self.cell_for(name);
        let mut guard = cell.lock().await;

        if guard.state != ModelState::Loaded || guard.record.is_none() {
            return Err(CoordinatorError::ModelNotFound { name: name.to_string() });
        }

        if !force && self.ref_count(name) > 0 {
            return Err(CoordinatorError::ModelUnloadError {
                name: name.to_string(),
                reason: "model has in-flight inference references".to_string(),
            });
        }

        if !self.unload_breaker.allow().await {
            self.sync_breaker_telemetry("unload", &self.unload_breaker).await;
            let status = self.unload_breaker.status().await;
            return Err(CoordinatorError::CircuitOpen {
                operation: "unload".to_string(),
                failure_count: status.failure_count,
                retry_after_sec: self.unload_breaker.reset_timeout().as_secs(),
            });
        }
        self.sync_breaker_telemetry("unload", &self.unload_breaker).await;

        guard.state = ModelState::Unloading;
        let handle = guard.record.as_ref().and_then(|r| r.handle.clone());

        let result = if let Some(handle) = handle {
            self.backend.unload(&handle).await
        } else {
            Ok(())
        };

        match result {
            Ok(()) => {
                self.gpu.free(name).await;
                guard.state = ModelState::Unloaded;
                guard.record = None;
                self.priorities.remove(name);
                self.refs.remove(name);
                self.unload_breaker.record_success().await;
                self.sync_breaker_telemetry("unload", &self.unload_breaker).await;
                self.telemetry.record_model_unload(name, true);
                self.telemetry.set_models_loaded(self.count_loaded().await as i64);
                info!(model = name, "model unloaded");
                Ok(())
            }
            Err(reason) => {
                guard.state = ModelState::Failed;
                let tripped = self.unload_breaker.record_failure().await;
                self.record_breaker_trip("unload", tripped);
                self.sync_breaker_telemetry("unload", &self.unload_breaker).await;
                self.telemetry.record_model_unload(name, false);
                Err(CoordinatorError::ModelUnloadError {
                    name: name.to_string(),
                    reason,
                })
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<LoadedModel> {
        let cell = self.models.get(name)?.clone();
        let guard = cell.lock().await;
        guard.record.clone()
    }

    pub async fn status(&self, name: &str) -> Option<ModelState> {
        let cell = self.models.get(name)?.clone();
        let guard = cell.lock().await;
        Some(guard.state)
    }

    async fn count_loaded(&self) -> usize {
        let mut n = 0;
        for entry in self.models.iter() {
            let guard = entry.value().lock().await;
            if guard.state == ModelState::Loaded {
                n += 1;
            }
        }
        n
    }

    pub async fn list(&self) -> Vec<LoadedModel> {
        let mut out = Vec::new();
        for entry in self.models.iter() {
            let guard = entry.value().lock().await;
            if let Some(record) = &guard.record {
                out.push(record.clone());
            }
        }
        out
    }

    /// Models whose `now - last_accessed > idle_timeout_sec` and whose
    /// priority is not `critical`; used by the idle-eviction background
    /// loop (§4.7).
    pub async fn idle_models(&self) -> Vec<String> {
        let now = chrono::Utc::now();
        let mut out = Vec::new();
        for entry in self.models.iter() {
            let guard = entry.value().lock().await;
            if let Some(record) = &guard.record {
                if record.descriptor.priority == Priority::Critical {
                    continue;
                }
                let idle_for = (now - record.last_accessed).num_seconds().max(0) as u64;
                if idle_for > record.descriptor.idle_timeout_sec {
                    out.push(record.descriptor.name.clone());
                }
            }
        }
        out
    }

    /// Liveness sweep for `RemoteRpc`/`RemotePubSubHealth` models (§4.7 item
    /// 3). `LocalDirect`/`LocalServer` models are skipped — an in-process
    /// handle needs no network probe. Returns `(model_name, healthy)` pairs
    /// so the caller can decide what, if anything, to do about a failure;
    /// a failed probe does not by itself unload or fail the model.
    pub async fn probe_remote_health(&self) -> Vec<(String, bool)> {
        let mut targets = Vec::new();
        for entry in self.models.iter() {
            let guard = entry.value().lock().await;
            if guard.state != ModelState::Loaded {
                continue;
            }
            if let Some(record) = &guard.record {
                if matches!(record.descriptor.serving_method, ServingMethod::RemoteRpc | ServingMethod::RemotePubSubHealth) {
                    targets.push(record.descriptor.clone());
                }
            }
        }

        let mut results = Vec::with_capacity(targets.len());
        for descriptor in targets {
            match self.backend.probe_health(&descriptor).await {
                Ok(()) => results.push((descriptor.name, true)),
                Err(reason) => {
                    warn!(model = %descriptor.name, error = %reason, "remote health probe failed");
                    self.telemetry.record_error("health_probe_failed", "lifecycle");
                    results.push((descriptor.name, false));
                }
            }
        }
        results
    }
}

impl EvictionGuard for LifecycleManager {
    fn is_evictable(&self, name: &str) -> bool {
        let priority = self.priorities.get(name).map(|p| *p).unwrap_or(Priority::Medium);
        if priority == Priority::Critical {
            return false;
        }
        self.ref_count(name) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::MockModelBackend;
    use moc_gpu::GpuManagerConfig;
    use std::io::Write;

    async fn manager() -> (LifecycleManager, tempfile::NamedTempFile) {
        let telemetry = Arc::new(Telemetry::new());
        let bus = Arc::new(EventBus::new());
        let gpu = Arc::new(
            GpuManager::new(GpuManagerConfig::default(), telemetry.clone()).with_bus(bus.clone()),
        );
        gpu.start(&[]).await;
        let mgr = LifecycleManager::new(
            LifecycleManagerConfig::default(),
            gpu,
            bus,
            telemetry,
            Arc::new(MockModelBackend),
        );
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; 6_000 * 1024 * 1024 / 1000]).unwrap(); // tiny stand-in; real size asserted via params below
        (mgr, file)
    }

    #[tokio::test]
    async fn load_is_idempotent_and_preserves_single_handle() {
        let (mgr, file) = manager().await;
        let path = file.path().to_str().unwrap();
        let params = LoadParams {
            estimated_vram_mb: Some(9000),
            ..Default::default()
        };
        let first = mgr.load("m", path, 1, Some(params.clone())).await.unwrap();
        let second = mgr.load("m", path, 1, Some(params)).await.unwrap();
        assert_eq!(first.handle.as_ref().unwrap().0, second.handle.as_ref().unwrap().0);
        assert_eq!(second.access_count, 2);
        assert_eq!(mgr.list().await.len(), 1);
    }

    #[tokio::test]
    async fn unload_refuses_when_references_outstanding() {
        let (mgr, file) = manager().await;
        let path = file.path().to_str().unwrap();
        mgr.load("m", path, 1, Some(LoadParams { estimated_vram_mb: Some(1000), ..Default::default() }))
            .await
            .unwrap();
        mgr.inc_ref("m");
        let err = mgr.unload("m", false).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::ModelUnloadError { .. }));
        mgr.dec_ref("m");
        assert!(mgr.unload("m", false).await.is_ok());
    }

    #[tokio::test]
    async fn unload_of_unknown_model_is_not_found() {
        let (mgr, _file) = manager().await;
        let err = mgr.unload("nope", false).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::ModelNotFound { .. }));
    }

    #[tokio::test]
    async fn load_missing_source_fails_without_panicking() {
        let (mgr, _file) = manager().await;
        let err = mgr.load("m", "/does/not/exist", 1, None).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::ModelLoadError { .. }));
    }

    #[tokio::test]
    async fn breaker_trip_counter_increments_once_per_trip_not_per_rejection() {
        let telemetry = Arc::new(Telemetry::new());
        let bus = Arc::new(EventBus::new());
        let gpu = Arc::new(
            GpuManager::new(GpuManagerConfig::default(), telemetry.clone()).with_bus(bus.clone()),
        );
        gpu.start(&[]).await;
        let mgr = LifecycleManager::new(
            LifecycleManagerConfig {
                load_circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 1,
                    reset_timeout: Duration::from_secs(60),
                },
                unload_circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 1,
                    reset_timeout: Duration::from_secs(60),
                },
            },
            gpu,
            bus,
            telemetry.clone(),
            Arc::new(MockModelBackend),
        );

        for _ in 0..3 {
            let _ = mgr.load("m", "/does/not/exist", 1, None).await;
        }

        let body = telemetry.render_prometheus();
        assert!(body.contains("modelops_circuit_breaker_failures_total{operation=\"load\"} 1"));
    }

    #[tokio::test]
    async fn probe_remote_health_skips_local_and_reports_remote_models() {
        struct SelectiveBackend;
        #[async_trait::async_trait]
        impl ModelBackend for SelectiveBackend {
            async fn load(&self, descriptor: &ModelDescriptor) -> Result<model::ModelHandle, String> {
                Ok(model::ModelHandle(Arc::from(format!("handle:{}", descriptor.name))))
            }
            async fn unload(&self, _handle: &model::ModelHandle) -> Result<(), String> {
                Ok(())
            }
            async fn probe_health(&self, descriptor: &ModelDescriptor) -> Result<(), String> {
                if descriptor.name == "unhealthy" {
                    Err("connection refused".to_string())
                } else {
                    Ok(())
                }
            }
        }

        let telemetry = Arc::new(Telemetry::new());
        let bus = Arc::new(EventBus::new());
        let gpu = Arc::new(
            GpuManager::new(GpuManagerConfig::default(), telemetry.clone()).with_bus(bus.clone()),
        );
        gpu.start(&[]).await;
        let mgr = LifecycleManager::new(
            LifecycleManagerConfig::default(),
            gpu,
            bus,
            telemetry,
            Arc::new(SelectiveBackend),
        );

        let mut local_file = tempfile::NamedTempFile::new().unwrap();
        local_file.write_all(b"weights").unwrap();
        mgr.load(
            "local",
            local_file.path().to_str().unwrap(),
            1,
            Some(LoadParams {
                estimated_vram_mb: Some(100),
                serving_method: Some(ServingMethod::LocalDirect),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

        let mut remote_file = tempfile::NamedTempFile::new().unwrap();
        remote_file.write_all(b"weights").unwrap();
        mgr.load(
            "healthy",
            remote_file.path().to_str().unwrap(),
            1,
            Some(LoadParams {
                estimated_vram_mb: Some(100),
                serving_method: Some(ServingMethod::RemoteRpc),
                endpoint: Some("http://node-a:9000".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

        let mut unhealthy_file = tempfile::NamedTempFile::new().unwrap();
        unhealthy_file.write_all(b"weights").unwrap();
        mgr.load(
            "unhealthy",
            unhealthy_file.path().to_str().unwrap(),
            1,
            Some(LoadParams {
                estimated_vram_mb: Some(100),
                serving_method: Some(ServingMethod::RemotePubSubHealth),
                endpoint: Some("http://node-b:9000".to_string()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

        let mut results = mgr.probe_remote_health().await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            results,
            vec![("healthy".to_string(), true), ("unhealthy".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn critical_model_is_not_reported_idle() {
        let (mgr, file) = manager().await;
        let path = file.path().to_str().unwrap();
        mgr.load(
            "m",
            path,
            1,
            Some(LoadParams {
                estimated_vram_mb: Some(1000),
                priority: Some(Priority::Critical),
                idle_timeout_sec: Some(0),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(mgr.idle_models().await.is_empty());
    }
}
