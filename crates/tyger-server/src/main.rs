//! tyger-server — standalone control-plane process.
//!
//! Reads config from env vars (see `tyger_server::config::Config`):
//!   TYGER_DATABASE_URL       — Postgres connection string (required)
//!   TYGER_BIND_ADDR           — listen address (default 0.0.0.0:8080)
//!   TYGER_DATA_PLANE_MODE     — "local" (default) or "cloud"
//!   TYGER_COMPUTE_BACKEND     — "docker" (default) or "kubernetes"
//!
//! Grounded on the teacher's `sem_os_server::main` shape: env-var config,
//! `PgPoolOptions::connect`, `run_migrations`, build port implementations,
//! spawn background work, `build_router`, `axum::serve`.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use tyger_backend::LogSourceProvider;
use tyger_core::engine::Controller;
use tyger_core::ports::{ComputeBackend, Repository};
use tyger_dataplane::SigningKeys;
use tyger_logs::{EngineLogArchiver, LocalArchiveSink};
use tyger_postgres::{run_migrations, ChangeListener, PgRepository};
use tyger_server::config::{Config, ComputeBackendMode};
use tyger_server::state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,tyger_server=debug".into()),
        )
        .init();

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");
    tracing::info!("connected to database");

    run_migrations(&pool).await.expect("failed to run migrations");
    tracing::info!("migrations applied");

    let repo: Arc<dyn Repository> = Arc::new(PgRepository::new(pool.clone()));

    // Each concrete backend implements both `ComputeBackend` and
    // `LogSourceProvider`; build it once and hand out two trait-object
    // handles onto the same instance rather than standing up two clients.
    let (backend, log_source): (Arc<dyn ComputeBackend>, Arc<dyn LogSourceProvider>) = match config.compute_backend {
        ComputeBackendMode::Kubernetes => {
            let client = kube::Client::try_default().await.expect("failed to build kube client");
            let kubernetes = Arc::new(tyger_backend::KubernetesBackend::new(
                client,
                config.kubernetes_namespace.clone(),
                config.known_node_pools.clone(),
                config.gpu_node_pools.clone(),
            ));
            (kubernetes.clone(), kubernetes)
        }
        ComputeBackendMode::Docker => {
            let docker = bollard::Docker::connect_with_local_defaults().expect("failed to connect to docker daemon");
            let dockerd = Arc::new(tyger_backend::DockerBackend::new(docker, config.docker_network.clone()));
            (dockerd.clone(), dockerd)
        }
    };

    let signing_keys = SigningKeys::from_seed_bytes(&config.signing_key_primary_seed, config.signing_key_secondary_seed.as_ref());

    let state = AppState::new(&config, repo.clone(), backend.clone(), log_source.clone(), signing_keys);

    // Reconciliation loop: one controller per process; only one instance
    // across the deployment actually reconciles at a time, via the
    // repository-backed lease (spec.md §4.D).
    let instance_id = uuid::Uuid::new_v4().to_string();
    let archiver = Arc::new(EngineLogArchiver::new(
        {
            let log_source = log_source.clone();
            move |run: &tyger_core::types::Run| {
                let log_source = log_source.clone();
                let run = run.clone();
                async move {
                    let source = log_source.log_source(&run).await?;
                    Ok(Box::new(DelegatingLogSource(source)) as Box<dyn tyger_logs::LiveLogSource>)
                }
            }
        },
        LocalArchiveSink::new(config.logs_dir()),
    ));

    let cancel = CancellationToken::new();

    // Bridges Postgres `LISTEN/NOTIFY` (spec.md §4.A `listenForNewRuns`/
    // `listenForRunUpdates`) into the reconcile loop's wake signal so a new
    // or updated run is picked up immediately instead of waiting out the
    // polling interval.
    let wake = Arc::new(tokio::sync::Notify::new());
    match ChangeListener::connect(&config.database_url, cancel.clone()).await {
        Ok(listener) => {
            let mut changes = listener.subscribe();
            let wake = wake.clone();
            tokio::spawn(async move {
                // The listener itself owns reconnect/shutdown; this task
                // just needs to outlive it and keep draining events. A
                // `Lagged` receiver error just means some notifications were
                // coalesced, not that the channel is dead.
                let _listener = listener;
                loop {
                    match changes.recv().await {
                        Ok(_) => wake.notify_one(),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => wake.notify_one(),
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            });
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to establish LISTEN/NOTIFY change listener, falling back to polling only");
        }
    }

    let controller =
        Arc::new(Controller::new(repo, backend, instance_id).with_log_archiver(archiver).with_wake_notify(wake));

    let controller_cancel = cancel.clone();
    let controller_task = tokio::spawn(async move {
        controller.run(controller_cancel).await;
    });

    let app = tyger_server::build_router(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind to {}: {e}", config.bind_addr));
    tracing::info!("tyger-server listening on {}", config.bind_addr);

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    cancel.cancel();
    let _ = controller_task.await;
    serve_result.expect("server error");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    tracing::info!("shutdown signal received");
}

/// `EngineLogArchiver` is generic over a `Box<dyn LiveLogSource>`-returning
/// factory; `LogSourceProvider::log_source` returns an `Arc` instead (it's
/// also used to serve live `GET /runs/{id}/logs` requests, where a shared
/// handle is what's needed). This adapter bridges the two without requiring
/// `tyger-logs` to know about `Arc`.
struct DelegatingLogSource(Arc<dyn tyger_logs::LiveLogSource>);

#[async_trait::async_trait]
impl tyger_logs::LiveLogSource for DelegatingLogSource {
    async fn open(&self, since: Option<chrono::DateTime<chrono::Utc>>) -> Result<tyger_logs::ByteStream, tyger_logs::LogError> {
        self.0.open(since).await
    }
}
