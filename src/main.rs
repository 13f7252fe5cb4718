//! Entry point: wires the nine components into one process, runs the
//! background maintenance loops (§C7) and the three transport surfaces
//! (§6) side by side, and tears everything down within a bounded window on
//! shutdown. Construction order follows the dependency graph in §1 —
//! telemetry and the event bus first, then GPU, then lifecycle (which
//! needs GPU as its eviction target and registers itself back as GPU's
//! eviction guard), then inference, learning and goals on top.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio::sync::watch;
use tracing::{error, info, warn};

use moc_bus::EventBus;
use moc_config::Config;
use moc_gpu::device::MockDeviceProvider;
use moc_gpu::side_store::InMemorySideStore;
use moc_gpu::{GpuManager, GpuManagerConfig};
use moc_inference::backend::MockInferenceBackend;
use moc_inference::{InferenceExecutor, InferenceExecutorConfig};
use moc_learning::backend::MockLearningBackend;
use moc_learning::store::store_for_path;
use moc_learning::{LearningCoordinator, LearningCoordinatorConfig};
use moc_lifecycle::backend::MockModelBackend;
use moc_lifecycle::circuit_breaker::CircuitBreakerConfig as BreakerConfig;
use moc_lifecycle::{LifecycleManager, LifecycleManagerConfig, PreloadSpec};
use moc_goals::{GoalProcessor, GoalProcessorConfig};
use moc_telemetry::Telemetry;
use moc_transport::http::{build_router, serve as serve_http, HttpSurfaceConfig};
use moc_transport::operations::Coordinator;
use moc_transport::{rpc, socket};

/// How long teardown waits for background loops and transport listeners to
/// stop on their own before abandoning them (§C9).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let env_name = std::env::var("MOC_ENV").unwrap_or_else(|_| "development".to_string());
    let config = load_config(&env_name)?;
    enforce_auth_policy(&env_name, &config)?;

    info!(environment = %env_name, "starting model operations coordinator");

    let telemetry = Arc::new(Telemetry::new());
    let bus = Arc::new(EventBus::new());

    let gpu = Arc::new(
        GpuManager::new(
            GpuManagerConfig {
                soft_limit_mb: config.resources.vram_soft_limit_mb,
                eviction_threshold_pct: config.resources.eviction_threshold_pct,
                poll_interval_sec: config.resources.gpu_poll_interval_sec,
            },
            telemetry.clone(),
        )
        .with_provider(Arc::new(MockDeviceProvider))
        .with_side_store(Arc::new(InMemorySideStore::default()))
        .with_bus(bus.clone()),
    );

    let preload_specs: Vec<PreloadSpec> = config
        .models
        .preload
        .iter()
        .map(|m| PreloadSpec {
            name: m.name.clone(),
            source: m.path.clone(),
            shards: m.shards,
        })
        .collect();
    let known_models: Vec<String> = preload_specs.iter().map(|s| s.name.clone()).collect();
    gpu.start(&known_models).await;

    let breaker_config = BreakerConfig {
        failure_threshold: config.resilience.circuit_breaker.failure_threshold,
        reset_timeout: Duration::from_secs(config.resilience.circuit_breaker.reset_timeout_sec),
    };
    let lifecycle = Arc::new(LifecycleManager::new(
        LifecycleManagerConfig {
            load_circuit_breaker: breaker_config.clone(),
            unload_circuit_breaker: breaker_config,
        },
        gpu.clone(),
        bus.clone(),
        telemetry.clone(),
        Arc::new(MockModelBackend),
    ));
    gpu.set_eviction_guard(lifecycle.clone()).await;
    lifecycle.preload(&preload_specs).await;

    let inference = Arc::new(InferenceExecutor::new(
        InferenceExecutorConfig {
            max_concurrent: config.resilience.bulkhead.max_concurrent,
            max_queue_size: config.resilience.bulkhead.max_queue_size,
            ..Default::default()
        },
        lifecycle.clone(),
        gpu.clone(),
        telemetry.clone(),
        Arc::new(MockInferenceBackend),
    ));

    let job_store = store_for_path(Path::new(&config.learning.job_store));
    let learning = LearningCoordinator::new(
        LearningCoordinatorConfig {
            max_parallel_jobs: config.learning.max_parallel_jobs,
        },
        job_store,
        Arc::new(MockLearningBackend::default()),
        telemetry.clone(),
    )
    .await;

    let goals = GoalProcessor::new(
        GoalProcessorConfig {
            max_active_goals: config.goals.max_active_goals,
            ..Default::default()
        },
        learning.clone(),
        telemetry.clone(),
    );

    let coordinator = Coordinator {
        lifecycle: lifecycle.clone(),
        gpu: gpu.clone(),
        inference,
        learning,
        goals,
        telemetry: telemetry.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut background = spawn_background_loops(&config, gpu.clone(), lifecycle.clone(), telemetry.clone(), shutdown_rx);

    let http_auth_token = config.server.http_auth_token.clone().map(Arc::new);
    let router = build_router(coordinator.clone(), HttpSurfaceConfig { auth_token: http_auth_token });
    let http_handle = tokio::spawn(serve_http(router, config.server.rest_port));
    let socket_handle = tokio::spawn(socket::serve(coordinator.clone(), config.server.zmq_port));
    let rpc_handle = tokio::spawn(rpc::serve(coordinator, config.server.grpc_port));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, tearing down");

    let _ = shutdown_tx.send(true);
    for handle in background.drain(..) {
        let abort_handle = handle.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("background loop did not stop within the shutdown grace period, aborting");
            abort_handle.abort();
        }
    }

    http_handle.abort();
    socket_handle.abort();
    rpc_handle.abort();

    info!("shutdown complete");
    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// Config directory convention from §6: `default.*` always loaded, then an
/// environment-named file (`development.*` / `staging.*` / `production.*`),
/// then `local.*` for an uncommitted operator override, each layer only
/// applied if present. The directory itself is overridable via
/// `MOC_CONFIG_DIR` for container deployments that mount it elsewhere.
fn load_config(env_name: &str) -> anyhow::Result<Config> {
    let dir = std::env::var("MOC_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
    let dir = PathBuf::from(dir);
    let candidates = [
        dir.join("default.toml"),
        dir.join(format!("{env_name}.toml")),
        dir.join("local.toml"),
    ];
    let paths: Vec<&Path> = candidates.iter().map(PathBuf::as_path).collect();
    moc_config::load(&paths).map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))
}

/// §6: "in production/staging environments, startup fails closed if no
/// secret is configured." `MOC_ENV` is this workspace's signal for which
/// environment a process is running in — it has no other reader, so a
/// missing/unrecognized value is treated as development (the permissive
/// default) rather than refusing to start.
fn enforce_auth_policy(env_name: &str, config: &Config) -> anyhow::Result<()> {
    let is_hardened_environment = matches!(env_name, "production" | "staging");
    if is_hardened_environment && config.server.http_auth_token.is_none() {
        anyhow::bail!(
            "refusing to start in {env_name} environment without server.http_auth_token configured"
        );
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Spawns the four maintenance loops from §C7, each selecting between its
/// own ticker and the shared shutdown signal so every loop exits promptly
/// once `shutdown_tx` fires, rather than waiting out its next interval.
fn spawn_background_loops(
    config: &Config,
    gpu: Arc<GpuManager>,
    lifecycle: Arc<LifecycleManager>,
    telemetry: Arc<Telemetry>,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        spawn_gpu_poll_loop(gpu, config.resources.gpu_poll_interval_sec, shutdown_rx.clone()),
        spawn_idle_eviction_loop(lifecycle.clone(), shutdown_rx.clone()),
        spawn_health_probe_loop(lifecycle, shutdown_rx.clone()),
        spawn_telemetry_refresh_loop(telemetry, shutdown_rx),
    ]
}

fn spawn_gpu_poll_loop(gpu: Arc<GpuManager>, interval_sec: u64, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_sec.max(1)));
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("gpu poll loop stopping");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    gpu.tick().await;
                }
            }
        }
    })
}

/// Unloads models the lifecycle manager reports idle (§C3's
/// `idle_timeout_sec`, excluding `Priority::Critical` and anything with
/// outstanding references). Unload failures are logged, not fatal — the
/// next tick tries again.
fn spawn_idle_eviction_loop(lifecycle: Arc<LifecycleManager>, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("idle eviction loop stopping");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    for name in lifecycle.idle_models().await {
                        if let Err(e) = lifecycle.unload(&name, false).await {
                            warn!(model = %name, error = %e, "idle unload failed, will retry next tick");
                        } else {
                            info!(model = %name, "unloaded idle model");
                        }
                    }
                }
            }
        }
    })
}

/// Liveness sweep for remotely-served models (§C1 `ServingMethod::RemoteRpc`
/// / `RemotePubSubHealth`); `LocalDirect`/`LocalServer` models are skipped
/// inside `LifecycleManager::probe_remote_health` itself. A failed probe is
/// logged, not acted on — deciding whether to fail the model over to the
/// breaker is the operator's call via the affected backend, not this loop's.
fn spawn_health_probe_loop(lifecycle: Arc<LifecycleManager>, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("health probe loop stopping");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let results = lifecycle.probe_remote_health().await;
                    let unhealthy = results.iter().filter(|(_, healthy)| !healthy).count();
                    if unhealthy > 0 {
                        warn!(unhealthy, total = results.len(), "remote health probe found unhealthy models");
                    } else {
                        tracing::trace!(probed = results.len(), "health probe tick: all remote-serving models healthy");
                    }
                }
            }
        }
    })
}

fn spawn_telemetry_refresh_loop(telemetry: Arc<Telemetry>, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut system = System::new_all();
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("telemetry refresh loop stopping");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let telemetry = telemetry.clone();
                    let refreshed = tokio::task::spawn_blocking(move || {
                        system.refresh_cpu_usage();
                        system.refresh_memory();
                        let cpu_pct = system.global_cpu_usage() as f64;
                        let mem_used = system.used_memory();
                        let mem_total = system.total_memory();
                        (system, cpu_pct, mem_used, mem_total)
                    })
                    .await;
                    match refreshed {
                        Ok((sys, cpu_pct, mem_used, mem_total)) => {
                            system = sys;
                            telemetry.refresh_system(cpu_pct, mem_used, mem_total);
                        }
                        Err(e) => error!(error = %e, "telemetry refresh task panicked"),
                    }
                }
            }
        }
    })
}
