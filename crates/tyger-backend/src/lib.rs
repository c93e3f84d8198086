//! Compute backend adapters behind the `ComputeBackend` port: Kubernetes for
//! production clusters, Docker for single-node development.

pub mod common;
pub mod docker;
pub mod kubernetes;
pub mod logs;

pub use docker::DockerBackend;
pub use kubernetes::KubernetesBackend;
pub use logs::LogSourceProvider;
