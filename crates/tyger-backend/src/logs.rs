//! `getLogs(runId, options) → Pipeline?` from spec.md §4.C, split out from
//! `ComputeBackend` itself: the trait lives here (not in `tyger_core::ports`)
//! so that only `tyger-backend` and its consumers need to know about
//! `tyger-logs`'s `LiveLogSource`, keeping `tyger-core` free of any log
//! transport dependency the way it's already free of any HTTP dependency.
//!
//! Grounded on the `log_stream` → `ReaderStream` conversion in
//! `skel84-orka`'s `crates/ops/src/lib.rs` for the Kubernetes side, and
//! `bollard::container::logs`'s demultiplexed `LogOutput` stream for Docker.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, LogParams};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::io::ReaderStream;

use tyger_core::error::{Result, TygerError};
use tyger_core::types::Run;
use tyger_logs::{ByteStream, DockerTimestampedLogReformatter, LiveLogSource};

use crate::docker::DockerBackend;
use crate::kubernetes::KubernetesBackend;

/// Returns a live log source for a run's job container(s), consumed by
/// `GET /runs/{id}/logs` (while non-final) and by `EngineLogArchiver` on
/// terminal transition. Kept separate from `ComputeBackend` itself per this
/// module's doc comment.
#[async_trait]
pub trait LogSourceProvider: Send + Sync {
    async fn log_source(&self, run: &Run) -> Result<Arc<dyn LiveLogSource>>;
}

const RUN_LABEL: &str = "tyger.io/run";

struct KubernetesLogSource {
    client: kube::Client,
    namespace: String,
    pod_name: String,
}

#[async_trait]
impl LiveLogSource for KubernetesLogSource {
    async fn open(&self, since: Option<DateTime<Utc>>) -> std::result::Result<ByteStream, tyger_logs::LogError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut lp = LogParams { follow: true, timestamps: true, ..Default::default() };
        if let Some(since) = since {
            lp.since_seconds = Some(Utc::now().signed_duration_since(since).num_seconds().max(0));
        }

        let reader = api
            .log_stream(&self.pod_name, &lp)
            .await
            .map_err(|e| tyger_logs::LogError::Backend(e.to_string()))?;
        let byte_stream = ReaderStream::new(reader.compat())
            .map(|r| r.map_err(|e| tyger_logs::LogError::Backend(e.to_string())));
        Ok(Box::pin(byte_stream))
    }
}

#[async_trait]
impl LogSourceProvider for KubernetesBackend {
    async fn log_source(&self, run: &Run) -> Result<Arc<dyn LiveLogSource>> {
        let pods: Api<Pod> = Api::namespaced(self.client().clone(), self.namespace());
        let lp = ListParams::default().labels(&format!("{RUN_LABEL}={}", run.id));
        let list = pods.list(&lp).await.map_err(|e| TygerError::Transient(e.to_string()))?;
        let pod = list
            .items
            .into_iter()
            .next()
            .ok_or_else(|| TygerError::NotFound(format!("no pod found for run {}", run.id)))?;
        let pod_name = pod.metadata.name.ok_or_else(|| TygerError::Fatal(anyhow::anyhow!("pod with no name")))?;

        Ok(Arc::new(KubernetesLogSource {
            client: self.client().clone(),
            namespace: self.namespace().to_string(),
            pod_name,
        }))
    }
}

struct DockerLogSource {
    docker: bollard::Docker,
    container_id: String,
}

#[async_trait]
impl LiveLogSource for DockerLogSource {
    async fn open(&self, since: Option<DateTime<Utc>>) -> std::result::Result<ByteStream, tyger_logs::LogError> {
        use bollard::container::LogsOptions;

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: true,
            since: since.map(|s| s.timestamp()).unwrap_or(0),
            ..Default::default()
        };

        // Docker injects a fresh timestamp at every 16KiB chunk boundary of
        // the underlying stream regardless of line breaks; the reformatter
        // strips those before lines are ever split out.
        let mut reformatter = DockerTimestampedLogReformatter::new();
        let stream = self
            .docker
            .logs(&self.container_id, Some(options))
            .map(move |item| match item {
                Ok(output) => Ok(Bytes::from(reformatter.process(&output.into_bytes()))),
                Err(e) => Err(tyger_logs::LogError::Backend(e.to_string())),
            });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl LogSourceProvider for DockerBackend {
    async fn log_source(&self, run: &Run) -> Result<Arc<dyn LiveLogSource>> {
        let containers = self.containers_for_run(run).await?;
        let container = containers
            .into_iter()
            .next()
            .ok_or_else(|| TygerError::NotFound(format!("no container found for run {}", run.id)))?;
        let container_id = container.id.ok_or_else(|| TygerError::Fatal(anyhow::anyhow!("container with no id")))?;

        Ok(Arc::new(DockerLogSource { docker: self.docker().clone(), container_id }))
    }
}
