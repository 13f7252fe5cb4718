//! Layered configuration for the Model Operations Coordinator.
//!
//! Three layers, lowest priority first, per §6: embedded defaults (the
//! `Default` impls below), one or more named files in a config directory,
//! then environment variables under the `MOC_` prefix. File values support
//! `${VAR:default}` interpolation — extending the teacher's
//! `substitute_env_vars` (which only handles `${VAR}`/`$VAR` with no
//! fallback) with a default-value clause, via a regex pass applied to the
//! raw file text before it is handed to the `config` crate.

use config::{Config as RawConfig, Environment, File};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

use moc_errors::CoordinatorError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse/merge configuration: {0}")]
    Build(#[from] config::ConfigError),
}

impl From<ConfigLoadError> for CoordinatorError {
    fn from(e: ConfigLoadError) -> Self {
        CoordinatorError::ConfigurationError {
            key: "<load>".to_string(),
            reason: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_zmq_port")]
    pub zmq_port: u16,
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,
    #[serde(default = "default_rest_port")]
    pub rest_port: u16,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Optional shared-secret bearer token for the HTTP surface (§6).
    #[serde(default)]
    pub http_auth_token: Option<String>,
}

fn default_zmq_port() -> u16 {
    7211
}
fn default_grpc_port() -> u16 {
    7212
}
fn default_rest_port() -> u16 {
    8008
}
fn default_max_workers() -> usize {
    16
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            zmq_port: default_zmq_port(),
            grpc_port: default_grpc_port(),
            rest_port: default_rest_port(),
            max_workers: default_max_workers(),
            http_auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_gpu_poll_interval_sec")]
    pub gpu_poll_interval_sec: u64,
    #[serde(default = "default_vram_soft_limit_mb")]
    pub vram_soft_limit_mb: u64,
    #[serde(default = "default_eviction_threshold_pct")]
    pub eviction_threshold_pct: u8,
}

fn default_gpu_poll_interval_sec() -> u64 {
    5
}
fn default_vram_soft_limit_mb() -> u64 {
    22000
}
fn default_eviction_threshold_pct() -> u8 {
    90
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            gpu_poll_interval_sec: default_gpu_poll_interval_sec(),
            vram_soft_limit_mb: default_vram_soft_limit_mb(),
            eviction_threshold_pct: default_eviction_threshold_pct(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelPreloadConfig {
    pub name: String,
    pub path: String,
    #[serde(default = "default_shards")]
    pub shards: u32,
}

fn default_shards() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub preload: Vec<ModelPreloadConfig>,
    #[serde(default = "default_dtype")]
    pub default_dtype: String,
    #[serde(default = "default_true")]
    pub quantization: bool,
}

fn default_dtype() -> String {
    "float16".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            preload: Vec::new(),
            default_dtype: default_dtype(),
            quantization: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_max_parallel_jobs")]
    pub max_parallel_jobs: usize,
    #[serde(default = "default_job_store")]
    pub job_store: String,
}

fn default_max_parallel_jobs() -> usize {
    2
}
fn default_job_store() -> String {
    "./data/learning_jobs.json".to_string()
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: default_max_parallel_jobs(),
            job_store: default_job_store(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalsConfig {
    #[serde(default = "default_max_active_goals")]
    pub max_active_goals: usize,
}

fn default_max_active_goals() -> usize {
    10
}

impl Default for GoalsConfig {
    fn default() -> Self {
        Self {
            max_active_goals: default_max_active_goals(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_sec")]
    pub reset_timeout_sec: u64,
}

fn default_failure_threshold() -> u32 {
    4
}
fn default_reset_timeout_sec() -> u64 {
    20
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_sec: default_reset_timeout_sec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

fn default_max_concurrent() -> usize {
    64
}
fn default_max_queue_size() -> usize {
    256
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub bulkhead: BulkheadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub goals: GoalsConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

/// `${VAR:default}` / `${VAR}` / `$VAR` interpolation against the process
/// environment. Unlike the teacher's `substitute_env_vars`, a missing
/// variable with no default is left as an empty string rather than the
/// literal placeholder, matching typical `envsubst` behavior.
pub fn substitute_env_vars(input: &str) -> String {
    let braced = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").unwrap();
    let stage1 = braced.replace_all(input, |caps: &regex::Captures| {
        let var = &caps[1];
        match std::env::var(var) {
            Ok(v) => v,
            Err(_) => caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
        }
    });

    let bare = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    bare.replace_all(&stage1, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

/// Load configuration from an ordered list of file paths (missing files are
/// skipped) followed by the `MOC_` environment layer, e.g.
/// `MOC_RESOURCES__VRAM_SOFT_LIMIT_MB=4000`.
pub fn load(paths: &[&Path]) -> Result<Config, ConfigLoadError> {
    let mut builder = RawConfig::builder();

    for path in paths {
        if !path.exists() {
            continue;
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let interpolated = substitute_env_vars(&raw);
        builder = builder.add_source(File::from_str(&interpolated, detect_format(path)));
    }

    builder = builder.add_source(
        Environment::with_prefix("MOC")
            .separator("__")
            .try_parsing(true),
    );

    let raw = builder.build()?;
    Ok(raw.try_deserialize()?)
}

fn detect_format(path: &Path) -> config::FileFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => config::FileFormat::Yaml,
        Some("json") => config::FileFormat::Json,
        Some("ini") => config::FileFormat::Ini,
        Some("ron") => config::FileFormat::Ron,
        Some("json5") => config::FileFormat::Json5,
        _ => config::FileFormat::Toml,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_schema() {
        let cfg = Config::default();
        assert_eq!(cfg.server.rest_port, 8008);
        assert_eq!(cfg.resources.vram_soft_limit_mb, 22000);
        assert_eq!(cfg.resilience.circuit_breaker.failure_threshold, 4);
        assert_eq!(cfg.resilience.bulkhead.max_concurrent, 64);
    }

    #[test]
    fn interpolation_uses_default_when_unset() {
        std::env::remove_var("MOC_TEST_UNSET_VAR_XYZ");
        let out = substitute_env_vars("${MOC_TEST_UNSET_VAR_XYZ:fallback}");
        assert_eq!(out, "fallback");
    }

    #[test]
    fn interpolation_prefers_env_value() {
        std::env::set_var("MOC_TEST_SET_VAR_XYZ", "from-env");
        let out = substitute_env_vars("${MOC_TEST_SET_VAR_XYZ:fallback}");
        assert_eq!(out, "from-env");
        std::env::remove_var("MOC_TEST_SET_VAR_XYZ");
    }

    #[test]
    fn env_layer_overrides_file_layer() {
        std::env::set_var("MOC_RESOURCES__VRAM_SOFT_LIMIT_MB", "4000");
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.resources.vram_soft_limit_mb, 4000);
        std::env::remove_var("MOC_RESOURCES__VRAM_SOFT_LIMIT_MB");
    }
}
