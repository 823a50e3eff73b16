use std::sync::Arc;

use taskmesh::api::{ApiState, api_routes};
use taskmesh::config::MeshConfig;
use taskmesh::dispatch::Dispatcher;
use taskmesh::generate::{GenerateConfig, create_generator};
use taskmesh::queue::{MemoryBroker, TASK_QUEUE, WorkQueue};
use taskmesh::runtime::{WorkerDeps, spawn_workers};
use taskmesh::store::{LibSqlStore, TaskStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = MeshConfig::from_env()?;
    let generate_config = GenerateConfig::from_env()?;

    eprintln!("taskmesh v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path);
    eprintln!(
        "   Model: {} ({:?})",
        generate_config.model, generate_config.backend
    );
    eprintln!("   Workers: {}", config.worker_count);
    eprintln!("   API: http://0.0.0.0:{}\n", config.http_port);

    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&config.db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
                std::process::exit(1);
            }),
    );

    // ── Broker + generator ──────────────────────────────────────────────
    let broker = MemoryBroker::new();
    let queue: Arc<dyn WorkQueue> = Arc::new(broker);
    queue.declare(TASK_QUEUE).await?;

    let generator = create_generator(&generate_config)?;

    // ── Worker runtimes ─────────────────────────────────────────────────
    let worker_deps = WorkerDeps {
        store: Arc::clone(&store),
        queue: Arc::clone(&queue),
        generator: Arc::clone(&generator),
        heartbeat_interval: config.heartbeat_interval,
        reconnect_backoff: config.reconnect_backoff,
        completion_policy: config.completion_policy,
    };
    let workers = spawn_workers(config.worker_count, worker_deps).await?;
    tracing::info!(count = workers.len(), "Worker runtimes started");

    // ── Dispatcher + API ────────────────────────────────────────────────
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        config.liveness_window,
        config.stuck_assigned_threshold,
    ));

    // Anything left over from a previous run gets one dispatch pass at boot.
    match dispatcher.dispatch_pending().await {
        Ok(report) => {
            if report.assigned + report.recovered > 0 {
                tracing::info!(
                    assigned = report.assigned,
                    recovered = report.recovered,
                    "Startup dispatch pass"
                );
            }
        }
        Err(e) => tracing::warn!(error = %e, "Startup dispatch pass failed"),
    }

    let state = ApiState {
        store,
        queue,
        generator,
        dispatcher,
        completion_policy: config.completion_policy,
        liveness_window: config.liveness_window,
    };
    let app = api_routes(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    tracing::info!(port = config.http_port, "Management API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    for worker in workers {
        worker.shutdown().await;
    }

    Ok(())
}
