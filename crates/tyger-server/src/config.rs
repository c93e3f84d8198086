//! Startup configuration read from the environment, in the teacher's
//! "`std::env::var` into a flat struct, fail fast on a missing required
//! value" style (`sem_os_server::main`).

use std::time::Duration;

pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub data_plane_mode: DataPlaneMode,
    pub local_storage_dir: String,
    pub heartbeat_ms: u64,
    pub installer_pod_uid: Option<String>,
    pub compute_backend: ComputeBackendMode,
    pub kubernetes_namespace: String,
    pub known_node_pools: Vec<String>,
    pub gpu_node_pools: Vec<String>,
    pub docker_network: String,
    pub signing_key_primary_seed: [u8; 32],
    pub signing_key_secondary_seed: Option<[u8; 32]>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataPlaneMode {
    Local,
    Cloud,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputeBackendMode {
    Kubernetes,
    Docker,
}

impl Config {
    pub fn from_env() -> Self {
        let database_url = std::env::var("TYGER_DATABASE_URL").expect("TYGER_DATABASE_URL must be set");
        let bind_addr = std::env::var("TYGER_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
        let data_plane_mode = match std::env::var("TYGER_DATA_PLANE_MODE").as_deref() {
            Ok("cloud") => DataPlaneMode::Cloud,
            _ => DataPlaneMode::Local,
        };
        let local_storage_dir = std::env::var("TYGER_LOCAL_STORAGE_DIR").unwrap_or_else(|_| "/opt/tyger".into());
        let heartbeat_ms: u64 = std::env::var("TYGER_HEARTBEAT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5_000);
        let installer_pod_uid = std::env::var("TYGER_INSTALLER_POD_UID").ok();
        let compute_backend = match std::env::var("TYGER_COMPUTE_BACKEND").as_deref() {
            Ok("kubernetes") => ComputeBackendMode::Kubernetes,
            _ => ComputeBackendMode::Docker,
        };
        let kubernetes_namespace = std::env::var("TYGER_KUBERNETES_NAMESPACE").unwrap_or_else(|_| "tyger".into());
        let known_node_pools = split_csv_env("TYGER_NODE_POOLS");
        let gpu_node_pools = split_csv_env("TYGER_GPU_NODE_POOLS");
        let docker_network = std::env::var("TYGER_DOCKER_NETWORK").unwrap_or_else(|_| "tyger".into());

        let signing_key_primary_seed = signing_seed_from_env("TYGER_SIGNING_KEY_PRIMARY");
        let signing_key_secondary_seed = std::env::var("TYGER_SIGNING_KEY_SECONDARY")
            .ok()
            .map(|hex| decode_seed(&hex).expect("TYGER_SIGNING_KEY_SECONDARY must be 64 hex chars (32 bytes)"));

        Self {
            database_url,
            bind_addr,
            data_plane_mode,
            local_storage_dir,
            heartbeat_ms,
            installer_pod_uid,
            compute_backend,
            kubernetes_namespace,
            known_node_pools,
            gpu_node_pools,
            docker_network,
            signing_key_primary_seed,
            signing_key_secondary_seed,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn logs_dir(&self) -> String {
        format!("{}/logs", self.local_storage_dir)
    }

    pub fn data_dir(&self) -> String {
        format!("{}/data", self.local_storage_dir)
    }
}

fn split_csv_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Signing keys are random by default so a local dev/test run works without
/// any configuration; operators that need stable keys across restarts (so
/// previously issued URLs keep validating) set the env var explicitly.
fn signing_seed_from_env(name: &str) -> [u8; 32] {
    match std::env::var(name) {
        Ok(hex) => decode_seed(&hex).unwrap_or_else(|| panic!("{name} must be 64 hex chars (32 bytes)")),
        Err(_) => rand::random(),
    }
}

fn decode_seed(hex: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex).ok()?;
    bytes.try_into().ok()
}
