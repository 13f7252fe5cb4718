//! C1 — Telemetry.
//!
//! Counters, gauges and histograms for every other component. Telemetry is
//! update-only: nothing in this crate makes a business decision, it only
//! records what other components report (§4.1). Grounded on the atomic
//! `Counter`/`Gauge` primitives of the monitoring dashboard's metrics
//! collector and the Prometheus export bridge that renders them, with the
//! circuit-breaker/bulkhead label families taken from the original
//! `telemetry.py`.

pub mod metrics;

use dashmap::DashMap;
use metrics::{Counter, Gauge, Histogram};
use std::time::Instant;

/// Central metrics registry for the coordinator process.
///
/// Cheap to clone (an `Arc` internally would also work; we hand out
/// `&Telemetry` behind an `Arc<Telemetry>` from `moc-server` instead, which
/// matches how `AppState` is threaded through the teacher's gateway).
pub struct Telemetry {
    start: Instant,

    cpu_usage_percent: Gauge,
    memory_usage_bytes: Gauge,
    memory_total_bytes: Gauge,

    device_gpu_percent: DashMap<u32, Gauge>,
    device_vram_used_bytes: DashMap<u32, Gauge>,
    device_vram_total_bytes: DashMap<u32, Gauge>,

    models_loaded_total: Gauge,
    model_load_counter: DashMap<(String, &'static str), Counter>,
    model_unload_counter: DashMap<(String, &'static str), Counter>,
    model_load_duration: DashMap<String, Histogram>,
    model_vram_usage_mb: DashMap<String, Gauge>,

    inference_requests_total: DashMap<(String, &'static str), Counter>,
    inference_duration: DashMap<String, Histogram>,
    inference_tokens_generated: DashMap<String, Counter>,
    inference_active_requests: DashMap<String, Gauge>,

    learning_jobs_total: DashMap<String, Gauge>,
    learning_job_duration: DashMap<String, Histogram>,
    learning_job_completions: DashMap<(String, &'static str), Counter>,

    goals_total: DashMap<(String, String), Gauge>,
    goal_completion_time: DashMap<String, Histogram>,
    goal_completions: DashMap<(String, &'static str), Counter>,

    circuit_breaker_state: DashMap<String, Gauge>,
    circuit_breaker_failures: DashMap<String, Counter>,

    bulkhead_rejections: DashMap<String, Counter>,
    bulkhead_active_requests: DashMap<String, Gauge>,
    bulkhead_queue_size: DashMap<String, Gauge>,

    errors_total: DashMap<(&'static str, &'static str), Counter>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            cpu_usage_percent: Gauge::default(),
            memory_usage_bytes: Gauge::default(),
            memory_total_bytes: Gauge::default(),
            device_gpu_percent: DashMap::new(),
            device_vram_used_bytes: DashMap::new(),
            device_vram_total_bytes: DashMap::new(),
            models_loaded_total: Gauge::default(),
            model_load_counter: DashMap::new(),
            model_unload_counter: DashMap::new(),
            model_load_duration: DashMap::new(),
            model_vram_usage_mb: DashMap::new(),
            inference_requests_total: DashMap::new(),
            inference_duration: DashMap::new(),
            inference_tokens_generated: DashMap::new(),
            inference_active_requests: DashMap::new(),
            learning_jobs_total: DashMap::new(),
            learning_job_duration: DashMap::new(),
            learning_job_completions: DashMap::new(),
            goals_total: DashMap::new(),
            goal_completion_time: DashMap::new(),
            goal_completions: DashMap::new(),
            circuit_breaker_state: DashMap::new(),
            circuit_breaker_failures: DashMap::new(),
            bulkhead_rejections: DashMap::new(),
            bulkhead_active_requests: DashMap::new(),
            bulkhead_queue_size: DashMap::new(),
            errors_total: DashMap::new(),
        }
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    // -- system ---------------------------------------------------------

    pub fn refresh_system(&self, cpu_pct: f64, mem_used_bytes: u64, mem_total_bytes: u64) {
        self.cpu_usage_percent.set(cpu_pct as i64);
        self.memory_usage_bytes.set(mem_used_bytes as i64);
        self.memory_total_bytes.set(mem_total_bytes as i64);
    }

    // -- devices ----------------------------------------------------------

    pub fn set_device_metrics(&self, device_id: u32, gpu_pct: f64, vram_used_mb: u64, vram_total_mb: u64) {
        self.device_gpu_percent
            .entry(device_id)
            .or_default()
            .set(gpu_pct as i64);
        self.device_vram_used_bytes
            .entry(device_id)
            .or_default()
            .set((vram_used_mb * 1_000_000) as i64);
        self.device_vram_total_bytes
            .entry(device_id)
            .or_default()
            .set((vram_total_mb * 1_000_000) as i64);
    }

    // -- model lifecycle --------------------------------------------------

    pub fn record_model_load(&self, name: &str, success: bool, duration_secs: f64) {
        let status = if success { "success" } else { "failure" };
        self.model_load_counter
            .entry((name.to_string(), status))
            .or_default()
            .inc();
        self.model_load_duration
            .entry(name.to_string())
            .or_insert_with(Histogram::default)
            .observe(duration_secs);
    }

    pub fn record_model_unload(&self, name: &str, success: bool) {
        let status = if success { "success" } else { "failure" };
        self.model_unload_counter
            .entry((name.to_string(), status))
            .or_default()
            .inc();
    }

    pub fn set_models_loaded(&self, count: i64) {
        self.models_loaded_total.set(count);
    }

    pub fn set_model_vram_usage_mb(&self, name: &str, mb: u64) {
        self.model_vram_usage_mb
            .entry(name.to_string())
            .or_default()
            .set(mb as i64);
    }

    pub fn clear_model_vram_usage(&self, name: &str) {
        self.model_vram_usage_mb.remove(name);
    }

    // -- inference ----------------------------------------------------------

    pub fn record_inference(&self, name: &str, success: bool, duration_secs: f64, tokens: u64) {
        let status = if success { "success" } else { "failure" };
        self.inference_requests_total
            .entry((name.to_string(), status))
            .or_default()
            .inc();
        self.inference_duration
            .entry(name.to_string())
            .or_insert_with(Histogram::default)
            .observe(duration_secs);
        if tokens > 0 {
            self.inference_tokens_generated
                .entry(name.to_string())
                .or_default()
                .inc_by(tokens);
        }
    }

    pub fn set_active_inference_requests(&self, name: &str, count: i64) {
        if count <= 0 {
            self.inference_active_requests.remove(name);
        } else {
            self.inference_active_requests
                .entry(name.to_string())
                .or_default()
                .set(count);
        }
    }

    // -- learning / goals -----------------------------------------------------

    pub fn set_learning_jobs(&self, status: &str, count: i64) {
        self.learning_jobs_total
            .entry(status.to_string())
            .or_default()
            .set(count);
    }

    pub fn record_learning_job_duration(&self, job_type: &str, duration_secs: f64) {
        self.learning_job_duration
            .entry(job_type.to_string())
            .or_insert_with(Histogram::default)
            .observe(duration_secs);
    }

    pub fn set_goals(&self, status: &str, priority: &str, count: i64) {
        self.goals_total
            .entry((status.to_string(), priority.to_string()))
            .or_default()
            .set(count);
    }

    pub fn record_goal_completion(&self, priority: &str, duration_secs: f64) {
        self.goal_completion_time
            .entry(priority.to_string())
            .or_insert_with(Histogram::default)
            .observe(duration_secs);
    }

    /// `outcome`: "completed" | "failed" | "cancelled".
    pub fn record_learning_job_outcome(&self, job_type: &str, outcome: &'static str) {
        self.learning_job_completions
            .entry((job_type.to_string(), outcome))
            .or_default()
            .inc();
    }

    /// `outcome`: "completed" | "failed" | "cancelled".
    pub fn record_goal_outcome(&self, priority: &str, outcome: &'static str) {
        self.goal_completions
            .entry((priority.to_string(), outcome))
            .or_default()
            .inc();
    }

    // -- resilience -----------------------------------------------------------

    /// `state`: 0 = closed, 1 = open, 2 = half-open.
    pub fn set_circuit_breaker_state(&self, operation: &str, state: u8) {
        self.circuit_breaker_state
            .entry(operation.to_string())
            .or_default()
            .set(state as i64);
    }

    pub fn record_circuit_breaker_failure(&self, operation: &str) {
        self.circuit_breaker_failures
            .entry(operation.to_string())
            .or_default()
            .inc();
    }

    pub fn record_bulkhead_rejection(&self, operation: &str) {
        self.bulkhead_rejections
            .entry(operation.to_string())
            .or_default()
            .inc();
    }

    pub fn update_bulkhead_metrics(&self, operation: &str, current_load: i64, queue_size: i64) {
        self.bulkhead_active_requests
            .entry(operation.to_string())
            .or_default()
            .set(current_load);
        self.bulkhead_queue_size
            .entry(operation.to_string())
            .or_default()
            .set(queue_size);
    }

    pub fn record_error(&self, kind: &'static str, component: &'static str) {
        self.errors_total.entry((kind, component)).or_default().inc();
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        use std::fmt::Write as _;

        let _ = writeln!(out, "# TYPE modelops_uptime_seconds gauge");
        let _ = writeln!(out, "modelops_uptime_seconds {}", self.uptime_seconds());
        let _ = writeln!(out, "modelops_cpu_usage_percent {}", self.cpu_usage_percent.get());
        let _ = writeln!(out, "modelops_memory_usage_bytes {}", self.memory_usage_bytes.get());
        let _ = writeln!(out, "modelops_memory_total_bytes {}", self.memory_total_bytes.get());
        let _ = writeln!(out, "modelops_models_loaded_total {}", self.models_loaded_total.get());

        for entry in self.device_gpu_percent.iter() {
            let _ = writeln!(
                out,
                "modelops_gpu_usage_percent{{device=\"{}\"}} {}",
                entry.key(),
                entry.value().get()
            );
        }
        for entry in self.model_load_counter.iter() {
            let (name, status) = entry.key();
            let _ = writeln!(
                out,
                "modelops_model_loads_total{{model_name=\"{name}\",status=\"{status}\"}} {}",
                entry.value().get()
            );
        }
        for entry in self.inference_requests_total.iter() {
            let (name, status) = entry.key();
            let _ = writeln!(
                out,
                "modelops_inference_requests_total{{model_name=\"{name}\",status=\"{status}\"}} {}",
                entry.value().get()
            );
        }
        for entry in self.circuit_breaker_state.iter() {
            let _ = writeln!(
                out,
                "modelops_circuit_breaker_state{{operation=\"{}\"}} {}",
                entry.key(),
                entry.value().get()
            );
        }
        for entry in self.circuit_breaker_failures.iter() {
            let _ = writeln!(
                out,
                "modelops_circuit_breaker_failures_total{{operation=\"{}\"}} {}",
                entry.key(),
                entry.value().get()
            );
        }
        for entry in self.bulkhead_rejections.iter() {
            let _ = writeln!(
                out,
                "modelops_bulkhead_rejections_total{{operation=\"{}\"}} {}",
                entry.key(),
                entry.value().get()
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_model_load_increments_counter_and_histogram() {
        let t = Telemetry::new();
        t.record_model_load("m", true, 0.25);
        t.record_model_load("m", false, 0.1);
        assert_eq!(
            t.model_load_counter.get(&("m".to_string(), "success")).unwrap().get(),
            1
        );
        assert_eq!(
            t.model_load_counter.get(&("m".to_string(), "failure")).unwrap().get(),
            1
        );
        let (count, sum, _) = t.model_load_duration.get("m").unwrap().snapshot();
        assert_eq!(count, 2);
        assert!((sum - 0.35).abs() < 1e-9);
    }

    #[test]
    fn active_inference_requests_removed_at_zero() {
        let t = Telemetry::new();
        t.set_active_inference_requests("m", 2);
        assert_eq!(t.inference_active_requests.get("m").unwrap().get(), 2);
        t.set_active_inference_requests("m", 0);
        assert!(t.inference_active_requests.get("m").is_none());
    }

    #[test]
    fn prometheus_render_contains_expected_lines() {
        let t = Telemetry::new();
        t.record_bulkhead_rejection("inference");
        let body = t.render_prometheus();
        assert!(body.contains("modelops_bulkhead_rejections_total{operation=\"inference\"} 1"));
    }
}
