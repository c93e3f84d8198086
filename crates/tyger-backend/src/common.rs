//! Behavior shared by every `ComputeBackend` implementation: the
//! `TYGER_*_PIPE` substitution convention and the worker-address
//! environment variables injected before a job container starts.

use std::collections::HashMap;

use tyger_core::types::Run;

/// Env var name for a bound buffer's named-pipe path, e.g. `input` ->
/// `INPUT_PIPE`.
pub fn pipe_env_var(buffer_param_name: &str) -> String {
    format!("{}_PIPE", buffer_param_name.to_ascii_uppercase())
}

/// `$(UPPERCASE_NAME_PIPE)` substitution token used in codespec
/// command/args/env.
pub fn pipe_substitution_token(buffer_param_name: &str) -> String {
    format!("$({})", pipe_env_var(buffer_param_name))
}

/// Populates `TYGER_WORKER_NODES` (JSON array of worker replica hostnames)
/// and, per declared endpoint, an env var named
/// `TYGER_<UPPER>_WORKER_ENDPOINT_ADDRESSES` (JSON array of `host:port`).
pub fn worker_address_env(
    run: &Run,
    worker_pod_hostnames: &[String],
    endpoints: &HashMap<String, u16>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if run.worker.is_none() {
        return env;
    }

    let nodes_json = serde_json::to_string(worker_pod_hostnames).unwrap_or_else(|_| "[]".to_string());
    env.insert("TYGER_WORKER_NODES".to_string(), nodes_json);

    for (name, port) in endpoints {
        let addresses: Vec<String> = worker_pod_hostnames.iter().map(|h| format!("{h}:{port}")).collect();
        let json = serde_json::to_string(&addresses).unwrap_or_else(|_| "[]".to_string());
        let key = format!("TYGER_{}_WORKER_ENDPOINT_ADDRESSES", name.to_ascii_uppercase());
        env.insert(key, json);
    }

    env
}

/// Well-known node-pool selector pair: the taint/label that routes run pods
/// onto a specific pool, and the GPU-pool marker used by the
/// `InvalidTarget` rejection.
pub const NODE_POOL_TAINT_KEY: &str = "tyger";
pub const NODE_POOL_TAINT_VALUE: &str = "run";
pub const GPU_POOL_LABEL: &str = "sku";
pub const GPU_POOL_LABEL_VALUE: &str = "gpu";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_env_var_uppercases_and_suffixes() {
        assert_eq!(pipe_env_var("input"), "INPUT_PIPE");
        assert_eq!(pipe_substitution_token("input"), "$(INPUT_PIPE)");
    }

    #[test]
    fn worker_address_env_empty_without_worker_codespec() {
        let run = sample_run(None);
        assert!(worker_address_env(&run, &["w-0".into()], &HashMap::new()).is_empty());
    }

    #[test]
    fn worker_address_env_populates_nodes_and_endpoints() {
        let run = sample_run(Some(tyger_core::types::RunWorker {
            codespec_ref: tyger_core::types::CodespecRef { name: "w".into(), version: 1 },
            node_pool: None,
            replicas: 2,
        }));
        let mut endpoints = HashMap::new();
        endpoints.insert("grpc".to_string(), 9000u16);

        let env = worker_address_env(&run, &["w-0".into(), "w-1".into()], &endpoints);
        assert_eq!(env["TYGER_WORKER_NODES"], r#"["w-0","w-1"]"#);
        assert_eq!(env["TYGER_GRPC_WORKER_ENDPOINT_ADDRESSES"], r#"["w-0:9000","w-1:9000"]"#);
    }

    fn sample_run(worker: Option<tyger_core::types::RunWorker>) -> Run {
        use chrono::Utc;
        use tyger_core::types::{CodespecRef, RunJob, RunKind, RunStatus};
        Run {
            id: 1,
            kind: RunKind::User,
            job: RunJob {
                codespec_ref: CodespecRef { name: "j".into(), version: 1 },
                node_pool: None,
                replicas: 1,
                buffers: HashMap::new(),
                tags: HashMap::new(),
                buffer_ttl_seconds: None,
            },
            worker,
            cluster: None,
            timeout_seconds: tyger_core::types::DEFAULT_RUN_TIMEOUT_SECONDS,
            tags: HashMap::new(),
            etag: String::new(),
            status: RunStatus::Pending,
            status_reason: None,
            running_count: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            resources_created: false,
            final_: false,
            logs_archived_at: None,
        }
    }
}
