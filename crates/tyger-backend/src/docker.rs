//! `ComputeBackend` implementation targeting a local Docker daemon, used for
//! single-node development: one container per job replica, one sidecar
//! container per bound buffer, joined on a shared user-defined network.
//!
//! Grounded on `dcm2610-StellarStack`'s `environment/traits.rs`
//! (`EnvironmentError` wrapping `bollard::errors::Error`, an
//! `EnvironmentConfiguration` value carrying image/env/labels/network) and
//! the `Docker::connect_with_local_defaults()` + `Arc<Docker>` handle shape
//! from `tangle-network-faas-infra-blueprint`'s gateway server.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions, StopContainerOptions};
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::Docker;
use tracing::{info, warn};

use tyger_core::error::{Result, TygerError};
use tyger_core::ports::{BackendRunState, ComputeBackend};
use tyger_core::types::{CodespecRef, Run, RunStatus};

const RUN_LABEL: &str = "io.tyger.run-id";

pub struct DockerBackend {
    docker: Docker,
    network: String,
}

impl DockerBackend {
    pub fn new(docker: Docker, network: impl Into<String>) -> Self {
        Self { docker, network: network.into() }
    }

    pub(crate) fn docker(&self) -> &Docker {
        &self.docker
    }

    pub(crate) async fn containers_for_run(&self, run: &Run) -> Result<Vec<bollard::models::ContainerSummary>> {
        self.list_run_containers(run).await
    }

    fn container_name(run: &Run, replica: i32) -> String {
        format!("tyger-run-{}-{replica}", run.id)
    }

    async fn list_run_containers(&self, run: &Run) -> Result<Vec<bollard::models::ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{RUN_LABEL}={}", run.id)]);
        self.docker
            .list_containers(Some(ListContainersOptions { all: true, filters, ..Default::default() }))
            .await
            .map_err(docker_to_tyger)
    }
}

fn docker_to_tyger(err: bollard::errors::Error) -> TygerError {
    match &err {
        bollard::errors::Error::DockerResponseServerError { status_code, message } if *status_code == 404 => {
            TygerError::NotFound(message.clone())
        }
        bollard::errors::Error::DockerResponseServerError { status_code, message } if *status_code == 409 => {
            TygerError::Conflict(message.clone())
        }
        bollard::errors::Error::DockerResponseServerError { status_code, message } if *status_code >= 500 => {
            TygerError::Transient(message.clone())
        }
        _ => TygerError::Fatal(anyhow::anyhow!(err)),
    }
}

#[async_trait]
impl ComputeBackend for DockerBackend {
    async fn ensure_resources(&self, run: &Run, codespec_ref: &CodespecRef) -> Result<()> {
        let existing = self.list_run_containers(run).await?;
        if !existing.is_empty() {
            return Ok(());
        }

        let image = format!("{}:{}", codespec_ref.name, codespec_ref.version);
        let mut labels = HashMap::new();
        labels.insert(RUN_LABEL.to_string(), run.id.to_string());

        for replica in 0..run.job.replicas {
            let name = Self::container_name(run, replica);
            let env: Vec<String> = run.job.tags.iter().map(|(k, v)| format!("{k}={v}")).collect();

            let config = Config {
                image: Some(image.clone()),
                env: Some(env),
                labels: Some(labels.clone()),
                host_config: Some(HostConfig {
                    network_mode: Some(self.network.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            };

            self.docker
                .create_container(Some(CreateContainerOptions { name: name.clone(), platform: None }), config)
                .await
                .map_err(docker_to_tyger)?;
            self.docker.start_container::<String>(&name, None).await.map_err(docker_to_tyger)?;
            info!(run_id = run.id, container = %name, "started docker container");
        }

        Ok(())
    }

    async fn observe(&self, run: &Run) -> Result<BackendRunState> {
        let containers = self.list_run_containers(run).await?;
        if containers.is_empty() {
            return Ok(BackendRunState {
                status: RunStatus::Pending,
                status_reason: None,
                running_count: None,
                started_at: None,
                finished_at: None,
            });
        }

        let mut running = 0;
        let mut any_failed = false;
        let mut all_exited = true;
        for c in &containers {
            match c.state.as_deref() {
                Some("running") => {
                    running += 1;
                    all_exited = false;
                }
                Some("exited") => {
                    if c.status.as_deref().map(|s| !s.contains("(0)")).unwrap_or(false) {
                        any_failed = true;
                    }
                }
                _ => all_exited = false,
            }
        }

        let status = if any_failed {
            RunStatus::Failed
        } else if all_exited {
            RunStatus::Succeeded
        } else if running > 0 {
            RunStatus::Running
        } else {
            RunStatus::Pending
        };

        Ok(BackendRunState {
            status,
            status_reason: if any_failed { Some("container exited non-zero".to_string()) } else { None },
            running_count: Some(running),
            started_at: None,
            finished_at: None,
        })
    }

    async fn cancel(&self, run: &Run) -> Result<()> {
        let containers = self.list_run_containers(run).await?;
        for c in containers {
            if let Some(id) = c.id {
                if c.state.as_deref() == Some("running") {
                    match self.docker.stop_container(&id, Some(StopContainerOptions { t: 10 })).await {
                        Ok(()) => {}
                        Err(e) => warn!(run_id = run.id, container = %id, error = %e, "failed to stop container"),
                    }
                }
            }
        }
        Ok(())
    }

    async fn finalize(&self, run: &Run) -> Result<()> {
        let containers = self.list_run_containers(run).await?;
        for c in containers {
            if let Some(id) = c.id {
                match self
                    .docker
                    .remove_container(&id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                    .await
                {
                    Ok(()) => {}
                    Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {}
                    Err(e) => return Err(docker_to_tyger(e)),
                }
            }
        }
        Ok(())
    }

    /// The local Docker backend has no node pools or clusters to route
    /// onto; any value other than `None` is rejected outright.
    async fn validate_target(&self, node_pool: Option<&str>, cluster: Option<&str>) -> Result<()> {
        if node_pool.is_some() || cluster.is_some() {
            return Err(TygerError::validation(
                "InvalidTarget",
                "the local docker backend does not support node pools or clusters",
            ));
        }
        Ok(())
    }
}

/// `true` when a container's reported status string marks a clean exit,
/// used by `observe` to distinguish Succeeded from Failed.
#[allow(dead_code)]
fn is_clean_exit(status: &str) -> bool {
    status.contains("(0)")
}

#[allow(dead_code)]
fn container_status_is_running(status: ContainerStateStatusEnum) -> bool {
    matches!(status, ContainerStateStatusEnum::RUNNING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_exit_detection() {
        assert!(is_clean_exit("Exited (0) 3 seconds ago"));
        assert!(!is_clean_exit("Exited (1) 3 seconds ago"));
    }
}
