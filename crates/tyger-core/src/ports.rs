//! Port traits — the seams the engine is coded against. Concrete adapters
//! live in `tyger-postgres` (Repository) and `tyger-backend` (ComputeBackend).
//! Mirrors the shape of `sem_os_core::ports`: one async_trait per
//! responsibility, injected as `Arc<dyn Trait>`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Buffer, Codespec, CodespecContent, CodespecRef, ContinuationToken, Lease, Run, RunStatus,
};

/// A page of results plus an opaque token for the next page, `None` when
/// exhausted.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CodespecListQuery {
    pub prefix: Option<String>,
    pub limit: i64,
    /// Plain last-seen `name`, not the base32 `ContinuationToken` used by
    /// buffer/run listing: codespecs page over `name` alone (one row per
    /// distinct name, latest version), so there is no `(created_at, id)`
    /// pair to encode.
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BufferListQuery {
    pub tags: HashMap<String, String>,
    pub include_soft_deleted: bool,
    pub limit: i64,
    pub continuation: Option<ContinuationToken>,
}

#[derive(Debug, Clone, Default)]
pub struct RunListQuery {
    pub since: Option<DateTime<Utc>>,
    pub statuses: Vec<RunStatus>,
    pub tags: HashMap<String, String>,
    pub limit: i64,
    pub continuation: Option<ContinuationToken>,
}

/// Everything the run lifecycle engine needs persisted. One implementation
/// (`tyger-postgres::PgRepository`) backs this in production; tests use an
/// in-memory fake built against the same trait.
#[async_trait]
pub trait Repository: Send + Sync {
    // Codespecs
    async fn put_codespec(&self, name: &str, content: CodespecContent) -> Result<Codespec>;
    async fn get_codespec(&self, name: &str, version: Option<i64>) -> Result<Codespec>;
    async fn list_codespecs(&self, query: CodespecListQuery) -> Result<Page<Codespec>>;

    // Buffers
    async fn create_buffer(&self, tags: HashMap<String, String>) -> Result<Buffer>;
    async fn get_buffer(&self, id: &str) -> Result<Buffer>;
    async fn update_buffer_tags(
        &self,
        id: &str,
        tags: HashMap<String, String>,
        expected_etag: Option<&str>,
    ) -> Result<Buffer>;
    async fn soft_delete_buffer(&self, id: &str, expected_etag: Option<&str>) -> Result<Buffer>;
    async fn restore_buffer(&self, id: &str) -> Result<Buffer>;
    async fn list_buffers(&self, query: BufferListQuery) -> Result<Page<Buffer>>;
    async fn set_buffer_ttl(&self, id: &str, ttl_seconds: i64) -> Result<Buffer>;

    // Runs
    async fn create_run_with_idempotency(
        &self,
        run: Run,
        idempotency_key: Option<&str>,
    ) -> Result<Run>;
    async fn get_run(&self, id: i64) -> Result<Run>;
    async fn list_runs(&self, query: RunListQuery) -> Result<Page<Run>>;

    /// `GET /runs/counts` fast path: grouped counts instead of paging the
    /// full result set just to count it client-side.
    async fn count_runs_by_status(
        &self,
        since: Option<DateTime<Utc>>,
        tags: HashMap<String, String>,
    ) -> Result<HashMap<String, i64>>;

    async fn request_cancellation(&self, id: i64) -> Result<Run>;

    /// Whole-set replacement of a run's tags, guarded by the run's current
    /// etag the same way `update_buffer_tags` guards buffer tags (spec.md
    /// §4.A, §6 `PUT /runs/{id}/tags`).
    async fn update_run_tags(
        &self,
        id: i64,
        tags: HashMap<String, String>,
        expected_etag: Option<&str>,
    ) -> Result<Run>;

    /// Applied only by the engine, never by the public API: transitions a
    /// run's observed state after reconciling against the compute backend.
    async fn update_run_observed_state(
        &self,
        id: i64,
        status: RunStatus,
        status_reason: Option<String>,
        running_count: Option<i32>,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<Run>;

    async fn mark_run_resources_created(&self, id: i64) -> Result<()>;
    async fn mark_run_logs_archived(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Runs the engine still needs to reconcile: non-final, or final but
    /// missing archived logs / un-pruned index entries.
    async fn list_runs_needing_reconciliation(&self, limit: i64) -> Result<Vec<Run>>;

    async fn prune_run_modified_at_index(&self, older_than: DateTime<Utc>) -> Result<u64>;

    // Leases
    async fn acquire_or_renew_lease(&self, name: &str, holder: &str, ttl_seconds: i64) -> Result<Lease>;
    async fn release_lease(&self, name: &str, holder: &str) -> Result<()>;
}

/// Observed state of one run as reported by a compute backend.
#[derive(Debug, Clone)]
pub struct BackendRunState {
    pub status: RunStatus,
    pub status_reason: Option<String>,
    pub running_count: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Abstraction over "a place that runs containers" — Kubernetes or Docker.
/// Grounded on the `EnvironmentConfiguration`/`bollard` shape from
/// `other_examples` and the `kube`/`k8s-openapi` job-pod shape from
/// `other_examples/manifests/5dlabs-cto`.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Create whatever resources are needed to run `run` (job pods / worker
    /// service, sockets, sidecars). Must be idempotent: called again for a
    /// run whose resources already exist is a no-op.
    async fn ensure_resources(&self, run: &Run, codespec_ref: &CodespecRef) -> Result<()>;

    /// Poll the backend for the current observed state of a run.
    async fn observe(&self, run: &Run) -> Result<BackendRunState>;

    /// Best-effort, idempotent: request cancellation of a run's resources.
    async fn cancel(&self, run: &Run) -> Result<()>;

    /// Tear down a run's resources once it has reached a terminal state.
    async fn finalize(&self, run: &Run) -> Result<()>;

    /// Validate that `node_pool`/`cluster` are targets this backend can
    /// serve; returns a `TygerError::Validation` with code `InvalidTarget`
    /// otherwise (spec.md §4.C).
    async fn validate_target(&self, node_pool: Option<&str>, cluster: Option<&str>) -> Result<()>;
}
