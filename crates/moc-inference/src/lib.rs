//! C4 — Inference Executor.
//!
//! Bounded-concurrency dispatch of inference over loaded models. Grounded
//! on `inference.py` for the per-request flow (bulkhead admit → reference
//! count → lookup → touch → invoke → record → release) and on the
//! scheduler's semaphore-based admission for the bulkhead itself.

pub mod backend;
pub mod bulkhead;
pub mod types;

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use backend::InferenceBackend;
use bulkhead::Bulkhead;
use types::{InferenceRequest, InferenceResult};

use moc_errors::CoordinatorError;
use moc_gpu::GpuManager;
use moc_lifecycle::LifecycleManager;
use moc_telemetry::Telemetry;

const OPERATION: &str = "inference";

pub struct InferenceExecutorConfig {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub per_call_timeout: Duration,
}

impl Default for InferenceExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            max_queue_size: 256,
            per_call_timeout: Duration::from_secs(60),
        }
    }
}

pub struct InferenceExecutor {
    bulkhead: Bulkhead,
    per_call_timeout: Duration,
    active: DashMap<String, AtomicI64>,
    lifecycle: Arc<LifecycleManager>,
    gpu: Arc<GpuManager>,
    telemetry: Arc<Telemetry>,
    backend: Arc<dyn InferenceBackend>,
}

impl InferenceExecutor {
    pub fn new(
        config: InferenceExecutorConfig,
        lifecycle: Arc<LifecycleManager>,
        gpu: Arc<GpuManager>,
        telemetry: Arc<Telemetry>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Self {
        Self {
            bulkhead: Bulkhead::new(config.max_concurrent, config.max_queue_size),
            per_call_timeout: config.per_call_timeout,
            active: DashMap::new(),
            lifecycle,
            gpu,
            telemetry,
            backend,
        }
    }

    fn bump_active(&self, name: &str, delta: i64) -> i64 {
        let counter = self.active.entry(name.to_string()).or_insert_with(|| AtomicI64::new(0));
        let value = counter.fetch_add(delta, Ordering::SeqCst) + delta;
        self.telemetry.set_active_inference_requests(name, value);
        value
    }

    pub async fn infer(&self, request: InferenceRequest) -> Result<InferenceResult, CoordinatorError> {
        let started = Instant::now();

        let _permit = match self.bulkhead.acquire().await {
            Ok(permit) => permit,
            Err(rejected) => {
                self.telemetry.record_bulkhead_rejection(OPERATION);
                self.telemetry.update_bulkhead_metrics(
                    OPERATION,
                    rejected.current_load as i64,
                    self.bulkhead.queue_size() as i64,
                );
                return Err(CoordinatorError::BulkheadRejection {
                    operation: OPERATION.to_string(),
                    current: rejected.current_load,
                    max: rejected.max_concurrent,
                });
            }
        };
        self.telemetry.update_bulkhead_metrics(
            OPERATION,
            self.bulkhead.current_load() as i64,
            self.bulkhead.queue_size() as i64,
        );

        self.bump_active(&request.model_name, 1);
        self.lifecycle.inc_ref(&request.model_name);

        let result = self.do_infer(&request, started).await;

        self.lifecycle.dec_ref(&request.model_name);
        self.bump_active(&request.model_name, -1);

        result
    }

    async fn do_infer(
        &self,
        request: &InferenceRequest,
        started: Instant,
    ) -> Result<InferenceResult, CoordinatorError> {
        let model = match self.lifecycle.get(&request.model_name).await {
            Some(m) => m,
            None => {
                self.telemetry
                    .record_inference(&request.model_name, false, started.elapsed().as_secs_f64(), 0);
                return Err(CoordinatorError::ModelNotFound {
                    name: request.model_name.clone(),
                });
            }
        };

        self.gpu.touch(&request.model_name).await;

        let handle = match &model.handle {
            Some(h) => h.clone(),
            None => {
                return Err(CoordinatorError::InferenceError {
                    model: request.model_name.clone(),
                    reason: "model has no live handle".to_string(),
                })
            }
        };

        let call = self
            .backend
            .infer(&handle, &request.prompt, request.max_tokens, request.temperature);

        let outcome = tokio::time::timeout(self.per_call_timeout, call).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(Ok((text, tokens_generated))) => {
                self.telemetry.record_inference(
                    &request.model_name,
                    true,
                    started.elapsed().as_secs_f64(),
                    tokens_generated as u64,
                );
                Ok(InferenceResult {
                    text,
                    tokens_generated,
                    elapsed_ms,
                    status: "success",
                    error: None,
                })
            }
            Ok(Err(reason)) => {
                self.telemetry
                    .record_inference(&request.model_name, false, started.elapsed().as_secs_f64(), 0);
                Err(CoordinatorError::InferenceError {
                    model: request.model_name.clone(),
                    reason,
                })
            }
            Err(_elapsed) => {
                warn!(model = %request.model_name, "inference call timed out, cancelling");
                self.telemetry
                    .record_inference(&request.model_name, false, started.elapsed().as_secs_f64(), 0);
                Err(CoordinatorError::InferenceError {
                    model: request.model_name.clone(),
                    reason: "timeout".to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::MockInferenceBackend;
    use moc_bus::EventBus;
    use moc_gpu::GpuManagerConfig;
    use moc_lifecycle::backend::MockModelBackend;
    use moc_lifecycle::model::LoadParams;
    use moc_lifecycle::LifecycleManagerConfig;
    use std::io::Write;

    async fn setup() -> (InferenceExecutor, tempfile::NamedTempFile) {
        let telemetry = Arc::new(Telemetry::new());
        let gpu = Arc::new(GpuManager::new(GpuManagerConfig::default(), telemetry.clone()));
        gpu.start(&[]).await;
        let bus = Arc::new(EventBus::new());
        let lifecycle = Arc::new(LifecycleManager::new(
            LifecycleManagerConfig::default(),
            gpu.clone(),
            bus,
            telemetry.clone(),
            Arc::new(MockModelBackend),
        ));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"weights").unwrap();
        lifecycle
            .load(
                "m",
                file.path().to_str().unwrap(),
                1,
                Some(LoadParams {
                    estimated_vram_mb: Some(1000),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        let executor = InferenceExecutor::new(
            InferenceExecutorConfig {
                max_concurrent: 2,
                max_queue_size: 2,
                per_call_timeout: Duration::from_secs(5),
            },
            lifecycle,
            gpu,
            telemetry,
            Arc::new(MockInferenceBackend),
        );
        (executor, file)
    }

    #[tokio::test]
    async fn infer_on_loaded_model_succeeds() {
        let (executor, _file) = setup().await;
        let result = executor
            .infer(InferenceRequest {
                model_name: "m".to_string(),
                prompt: "hello".to_string(),
                max_tokens: 16,
                temperature: 0.7,
                conversation_id: None,
            })
            .await
            .unwrap();
        assert_eq!(result.status, "success");
        assert!(result.tokens_generated <= 16);
        assert!(result.elapsed_ms >= 0.0);
    }

    #[tokio::test]
    async fn infer_on_missing_model_is_not_found() {
        let (executor, _file) = setup().await;
        let err = executor
            .infer(InferenceRequest {
                model_name: "missing".to_string(),
                prompt: "hi".to_string(),
                max_tokens: 16,
                temperature: 0.7,
                conversation_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ModelNotFound { .. }));
    }

    #[tokio::test]
    async fn fifth_concurrent_request_is_rejected_synchronously() {
        let (executor, _file) = setup().await;
        let executor = Arc::new(executor);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let e = executor.clone();
            handles.push(tokio::spawn(async move {
                e.infer(InferenceRequest {
                    model_name: "m".to_string(),
                    prompt: "x".repeat(10000),
                    max_tokens: 16,
                    temperature: 0.7,
                    conversation_id: None,
                })
                .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        let fifth = executor
            .infer(InferenceRequest {
                model_name: "m".to_string(),
                prompt: "y".to_string(),
                max_tokens: 16,
                temperature: 0.7,
                conversation_id: None,
            })
            .await;
        assert!(matches!(fifth, Err(CoordinatorError::BulkheadRejection { .. })));
        for h in handles {
            let _ = h.await;
        }
    }
}
