//! C8 — Transport Surfaces.
//!
//! Three thin adapters over the same operation set (§6): `http` (axum
//! REST+JSON, grounded on `mofa-gateway::server`), `socket` (newline-framed
//! request/reply) and `rpc` (length-prefixed binary framing). All three
//! delegate to `operations::Coordinator`, which is the only place business
//! logic or error-to-status-code mapping lives once per surface.

pub mod http;
pub mod operations;
pub mod rpc;
pub mod socket;

pub use operations::Coordinator;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http::{build_router, HttpSurfaceConfig};
    use moc_bus::EventBus;
    use moc_gpu::{GpuManager, GpuManagerConfig};
    use moc_inference::backend::MockInferenceBackend;
    use moc_inference::InferenceExecutorConfig;
    use moc_learning::backend::MockLearningBackend;
    use moc_learning::store::InMemoryJobStore;
    use moc_learning::LearningCoordinatorConfig;
    use moc_lifecycle::backend::MockModelBackend;
    use moc_lifecycle::LifecycleManagerConfig;
    use moc_goals::GoalProcessorConfig;
    use moc_telemetry::Telemetry;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn coordinator() -> Coordinator {
        let telemetry = Arc::new(Telemetry::new());
        let bus = Arc::new(EventBus::new());
        let gpu = Arc::new(
            GpuManager::new(GpuManagerConfig::default(), telemetry.clone()).with_bus(bus.clone()),
        );
        gpu.start(&[]).await;
        let lifecycle = Arc::new(moc_lifecycle::LifecycleManager::new(
            LifecycleManagerConfig::default(),
            gpu.clone(),
            bus,
            telemetry.clone(),
            Arc::new(MockModelBackend),
        ));
        let inference = Arc::new(moc_inference::InferenceExecutor::new(
            InferenceExecutorConfig::default(),
            lifecycle.clone(),
            gpu.clone(),
            telemetry.clone(),
            Arc::new(MockInferenceBackend),
        ));
        let learning = moc_learning::LearningCoordinator::new(
            LearningCoordinatorConfig { max_parallel_jobs: 2 },
            Arc::new(InMemoryJobStore::default()),
            Arc::new(MockLearningBackend { step_scale: 0.0001 }),
            telemetry.clone(),
        )
        .await;
        let goals = moc_goals::GoalProcessor::new(
            GoalProcessorConfig {
                step_scale: 0.001,
                simulated_failure_pct: 0.0,
                ..Default::default()
            },
            learning.clone(),
            telemetry.clone(),
        );
        Coordinator {
            lifecycle,
            gpu,
            inference,
            learning,
            goals,
            telemetry,
        }
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok_when_nothing_degraded() {
        let router = build_router(coordinator().await, HttpSurfaceConfig { auth_token: None });
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unauthenticated_request_is_rejected_when_token_configured() {
        let router = build_router(
            coordinator().await,
            HttpSurfaceConfig {
                auth_token: Some(Arc::new("secret".to_string())),
            },
        );
        let response = router
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn dispatch_unknown_operation_is_configuration_error() {
        let coordinator = coordinator().await;
        let err = operations::dispatch(&coordinator, "not_a_real_op", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, moc_errors::CoordinatorError::ConfigurationError { .. }));
    }

    #[tokio::test]
    async fn dispatch_list_models_round_trips_through_json() {
        let coordinator = coordinator().await;
        let result = operations::dispatch(&coordinator, "list_models", serde_json::json!({})).await.unwrap();
        assert!(result.as_array().unwrap().is_empty());
    }
}
