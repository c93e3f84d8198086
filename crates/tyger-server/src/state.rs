//! Shared application state injected into every handler via `Extension`,
//! mirroring the teacher's `Extension(service)` / `Extension(jwt_config)`
//! shape in `sem_os_server::router` — one `Arc`-wrapped port per concern,
//! built once in `main` and cloned cheaply per request.

use std::sync::Arc;

use tyger_backend::LogSourceProvider;
use tyger_core::ports::{ComputeBackend, Repository};
use tyger_dataplane::{LocalStore, SigningKeys};
use tyger_logs::LocalArchiveSink;

use crate::config::{Config, DataPlaneMode};

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub backend: Arc<dyn ComputeBackend>,
    pub log_source: Arc<dyn LogSourceProvider>,
    pub archive_sink: Arc<LocalArchiveSink>,
    pub data_plane_mode: DataPlaneMode,
    pub signing_keys: SigningKeys,
    /// Only populated in `DataPlaneMode::Local`: the control plane needs it
    /// to create a buffer's backing container at `POST /buffers` time, the
    /// same store `tyger-dataplane::server` serves blocks out of.
    pub local_store: Option<Arc<LocalStore>>,
    pub local_storage_dir: String,
    pub installer_pod_uid: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        config: &Config,
        repo: Arc<dyn Repository>,
        backend: Arc<dyn ComputeBackend>,
        log_source: Arc<dyn LogSourceProvider>,
        signing_keys: SigningKeys,
    ) -> Self {
        let local_store = match config.data_plane_mode {
            DataPlaneMode::Local => Some(Arc::new(LocalStore::new(config.data_dir()))),
            DataPlaneMode::Cloud => None,
        };

        Self {
            repo,
            backend,
            log_source,
            archive_sink: Arc::new(LocalArchiveSink::new(config.logs_dir())),
            data_plane_mode: config.data_plane_mode,
            signing_keys,
            local_store,
            local_storage_dir: config.local_storage_dir.clone(),
            installer_pod_uid: config.installer_pod_uid.clone(),
            started_at: chrono::Utc::now(),
        }
    }
}
