//! The run lifecycle engine: a single-writer reconciliation loop elected by
//! a Repository-backed lease, in the style of the `CancellationToken` +
//! `LeaseLock` reconcile loop in `eosin-platform-eosin`'s shard reconciler
//! and the polling shape of `sem_os_server::dispatcher::OutboxDispatcher`.
//! Backend-independent: driven entirely through the `Repository` and
//! `ComputeBackend` ports so the same engine runs against Kubernetes or
//! Docker without change.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{Result, TygerError};
use crate::ports::{ComputeBackend, Repository};
use crate::retry::{with_retry, RetryPolicy};
use crate::types::{Run, RunStatus};

/// How long a run may sit in `Pending` with resources created before the
/// engine gives up and fails it.
const PRE_START_GRACE: Duration = Duration::from_secs(5 * 60);

/// Lease TTL; the lease name is fixed per spec.md §4.D ("controller").
const LEASE_NAME: &str = "controller";
const LEASE_TTL_SECONDS: i64 = 15;
const RECONCILE_INTERVAL: Duration = Duration::from_secs(2);

/// Archives a terminated run's logs. Implemented by `tyger-logs` against
/// the backend's live log source; kept as a port here so `tyger-core` stays
/// free of any log-transport dependency.
#[async_trait::async_trait]
pub trait LogArchiver: Send + Sync {
    async fn archive(&self, run: &Run) -> Result<()>;
}

struct NoopLogArchiver;

#[async_trait::async_trait]
impl LogArchiver for NoopLogArchiver {
    async fn archive(&self, _run: &Run) -> Result<()> {
        Ok(())
    }
}

pub struct Controller {
    repo: Arc<dyn Repository>,
    backend: Arc<dyn ComputeBackend>,
    archiver: Arc<dyn LogArchiver>,
    instance_id: String,
    /// Notified by a backend-specific change listener (the Postgres
    /// `LISTEN/NOTIFY` bridge in `tyger-postgres::listen`) so a tick can run
    /// as soon as a run/buffer changes rather than waiting out the full
    /// `RECONCILE_INTERVAL`. Left un-notified, the loop just polls on that
    /// interval — this is an optimization, not a correctness requirement.
    wake: Arc<tokio::sync::Notify>,
}

impl Controller {
    pub fn new(repo: Arc<dyn Repository>, backend: Arc<dyn ComputeBackend>, instance_id: String) -> Self {
        Self {
            repo,
            backend,
            archiver: Arc::new(NoopLogArchiver),
            instance_id,
            wake: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn with_log_archiver(mut self, archiver: Arc<dyn LogArchiver>) -> Self {
        self.archiver = archiver;
        self
    }

    /// Wires in a change-notification source (spec.md §4.A
    /// `listenForNewRuns`/`listenForRunUpdates`) so the reconcile loop wakes
    /// promptly instead of only on the polling interval.
    pub fn with_wake_notify(mut self, wake: Arc<tokio::sync::Notify>) -> Self {
        self.wake = wake;
        self
    }

    /// Runs until `cancel` is triggered. Intended to be spawned as a single
    /// background task from `tyger-server`'s `main`.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let lease = tokio::select! {
                _ = cancel.cancelled() => return,
                lease = self.try_acquire_lease() => lease,
            };

            match lease {
                Ok(true) => {
                    info!(instance_id = %self.instance_id, "acquired controller lease");
                    self.hold_lease_and_reconcile(cancel.clone()).await;
                }
                Ok(false) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(LEASE_RETRY_INTERVAL) => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "lease acquisition failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(LEASE_RETRY_INTERVAL) => {}
                    }
                }
            }
        }
    }

    async fn try_acquire_lease(&self) -> Result<bool> {
        match self.repo.acquire_or_renew_lease(LEASE_NAME, &self.instance_id, LEASE_TTL_SECONDS).await {
            Ok(lease) => Ok(lease.holder == self.instance_id),
            Err(TygerError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// While holding the lease: renew it on every tick and reconcile; if
    /// renewal ever fails (lost the lease to another instance, or a
    /// transient error persists), stop reconciling immediately — spec.md §4.D
    /// "losing the lease suspends work immediately".
    async fn hold_lease_and_reconcile(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = self.repo.release_lease(LEASE_NAME, &self.instance_id).await;
                    return;
                }
                _ = tokio::time::sleep(RECONCILE_INTERVAL) => {}
                _ = self.wake.notified() => {}
            }

            match self.try_acquire_lease().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(instance_id = %self.instance_id, "lost controller lease");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "lease renewal error, suspending work until next tick");
                    return;
                }
            }

            if let Err(e) = self.reconcile_tick(&cancel).await {
                warn!(error = %e, "reconcile tick failed");
            }
        }
    }

    #[instrument(skip(self, cancel))]
    async fn reconcile_tick(&self, cancel: &CancellationToken) -> Result<()> {
        let runs = with_retry(RetryPolicy::database(), || self.repo.list_runs_needing_reconciliation(500)).await?;

        for run in runs {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if let Err(e) = self.reconcile_run(&run).await {
                warn!(run_id = run.id, error = %e, "failed to reconcile run");
            }
        }
        Ok(())
    }

    async fn reconcile_run(&self, run: &Run) -> Result<()> {
        // Step 1: create resources for runs that don't have them yet.
        if !run.resources_created {
            return self.create_resources(run).await;
        }

        // Step 2: pre-start timeout for runs stuck in Pending.
        let age = Utc::now().signed_duration_since(run.created_at);
        if run.status == RunStatus::Pending && age.num_seconds() > PRE_START_GRACE.as_secs() as i64 {
            self.repo
                .update_run_observed_state(run.id, RunStatus::Failed, Some("PreStartTimeout".into()), None, None, Some(Utc::now()))
                .await?;
            return Ok(());
        }

        // Step 5: overall run timeout, measured from createdAt.
        if !run.status.is_terminal() && run.status != RunStatus::Canceling && age.num_seconds() > run.timeout_seconds {
            self.repo.request_cancellation(run.id).await?;
            self.backend.cancel(run).await?;
            return Ok(());
        }

        // Step 3: merge observed state. Skipped for `Canceling` runs — that
        // status is owned by the cancel confirmation branch below, and
        // overwriting it with whatever the backend currently reports (e.g.
        // still `Running`) would silently revert the cancel request.
        if !run.status.is_terminal() && run.status != RunStatus::Canceling {
            self.observe_and_merge(run).await?;
        }

        // Confirm cancellation once the backend reports the run gone.
        if run.status == RunStatus::Canceling {
            let observed = self.backend.observe(run).await?;
            if observed.status.is_terminal() {
                self.repo
                    .update_run_observed_state(run.id, RunStatus::Canceled, run.status_reason.clone(), None, run.started_at, Some(Utc::now()))
                    .await?;
            }
        }

        // Step 4: archive logs and finalize once terminal.
        if run.status.is_terminal() && !run.final_ {
            self.finalize_run(run).await?;
        }

        Ok(())
    }

    async fn create_resources(&self, run: &Run) -> Result<()> {
        let codespec_ref = &run.job.codespec_ref;
        match self.backend.validate_target(run.job.node_pool.as_deref(), run.cluster.as_deref()).await {
            Ok(()) => {}
            Err(TygerError::Validation { message, .. }) => {
                self.repo
                    .update_run_observed_state(run.id, RunStatus::Failed, Some(message), None, None, Some(Utc::now()))
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        match with_retry(RetryPolicy::database(), || self.backend.ensure_resources(run, codespec_ref)).await {
            Ok(()) => {
                self.repo.mark_run_resources_created(run.id).await?;
                self.repo
                    .update_run_observed_state(run.id, RunStatus::Pending, None, None, Some(Utc::now()), None)
                    .await?;
                Ok(())
            }
            Err(TygerError::Validation { message, .. }) => {
                self.repo
                    .update_run_observed_state(run.id, RunStatus::Failed, Some(message), None, None, Some(Utc::now()))
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    async fn observe_and_merge(&self, run: &Run) -> Result<()> {
        let observed = self.backend.observe(run).await?;
        self.repo
            .update_run_observed_state(
                run.id,
                observed.status,
                observed.status_reason,
                observed.running_count,
                observed.started_at,
                observed.finished_at,
            )
            .await?;
        Ok(())
    }

    /// Archive logs then mark the run final. Archival failure still
    /// finalizes the run with `logsArchivedAt = None` per spec.md §4.D.
    async fn finalize_run(&self, run: &Run) -> Result<()> {
        self.backend.finalize(run).await?;
        match self.archive_logs(run).await {
            Ok(()) => self.repo.mark_run_logs_archived(run.id, Utc::now()).await?,
            Err(e) => {
                warn!(run_id = run.id, error = %e, "log archival failed, finalizing without archive");
            }
        }
        Ok(())
    }

    async fn archive_logs(&self, run: &Run) -> Result<()> {
        self.archiver.archive(run).await
    }

    /// Idempotent: terminal runs return immediately, matching spec.md §4.D.
    /// Requests backend deletion in the same call that marks the run
    /// `Canceling` — the confirmation branch in `reconcile_run` only ever
    /// observes, it never itself asks the backend to stop anything.
    pub async fn cancel(&self, run_id: i64) -> Result<Run> {
        let run = self.repo.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        let canceled = self.repo.request_cancellation(run_id).await?;
        self.backend.cancel(&canceled).await?;
        Ok(canceled)
    }
}

const LEASE_RETRY_INTERVAL: Duration = Duration::from_secs(3);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{BackendRunState, BufferListQuery, Page, RunListQuery};
    use crate::types::{CodespecContent, CodespecRef, RunJob};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeRepo {
        runs: Mutex<HashMap<i64, Run>>,
        lease_holder: Mutex<Option<String>>,
    }

    fn sample_run(id: i64) -> Run {
        Run {
            id,
            kind: crate::types::RunKind::User,
            job: RunJob {
                codespec_ref: CodespecRef { name: "hello".into(), version: 1 },
                node_pool: None,
                replicas: 1,
                buffers: HashMap::new(),
                tags: HashMap::new(),
                buffer_ttl_seconds: None,
            },
            worker: None,
            cluster: None,
            timeout_seconds: crate::types::DEFAULT_RUN_TIMEOUT_SECONDS,
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

    #[async_trait]
    impl Repository for FakeRepo {
        async fn put_codespec(&self, _: &str, _: CodespecContent) -> Result<crate::types::Codespec> {
            unimplemented!()
        }
        async fn get_codespec(&self, _: &str, _: Option<i64>) -> Result<crate::types::Codespec> {
            unimplemented!()
        }
        async fn list_codespecs(&self, _: crate::ports::CodespecListQuery) -> Result<Page<crate::types::Codespec>> {
            unimplemented!()
        }
        async fn create_buffer(&self, _: HashMap<String, String>) -> Result<crate::types::Buffer> {
            unimplemented!()
        }
        async fn get_buffer(&self, _: &str) -> Result<crate::types::Buffer> {
            unimplemented!()
        }
        async fn update_buffer_tags(&self, _: &str, _: HashMap<String, String>, _: Option<&str>) -> Result<crate::types::Buffer> {
            unimplemented!()
        }
        async fn soft_delete_buffer(&self, _: &str, _: Option<&str>) -> Result<crate::types::Buffer> {
            unimplemented!()
        }
        async fn restore_buffer(&self, _: &str) -> Result<crate::types::Buffer> {
            unimplemented!()
        }
        async fn list_buffers(&self, _: BufferListQuery) -> Result<Page<crate::types::Buffer>> {
            unimplemented!()
        }
        async fn set_buffer_ttl(&self, _: &str, _: i64) -> Result<crate::types::Buffer> {
            unimplemented!()
        }
        async fn create_run_with_idempotency(&self, run: Run, _: Option<&str>) -> Result<Run> {
            self.runs.lock().unwrap().insert(run.id, run.clone());
            Ok(run)
        }
        async fn get_run(&self, id: i64) -> Result<Run> {
            self.runs.lock().unwrap().get(&id).cloned().ok_or_else(|| TygerError::NotFound(id.to_string()))
        }
        async fn list_runs(&self, _: RunListQuery) -> Result<Page<Run>> {
            unimplemented!()
        }
        async fn count_runs_by_status(&self, _: Option<chrono::DateTime<Utc>>, _: HashMap<String, String>) -> Result<HashMap<String, i64>> {
            unimplemented!()
        }
        async fn request_cancellation(&self, id: i64) -> Result<Run> {
            let mut runs = self.runs.lock().unwrap();
            let run = runs.get_mut(&id).unwrap();
            run.status = RunStatus::Canceling;
            Ok(run.clone())
        }
        async fn update_run_tags(&self, _: i64, _: HashMap<String, String>, _: Option<&str>) -> Result<Run> {
            unimplemented!()
        }
        async fn update_run_observed_state(
            &self,
            id: i64,
            status: RunStatus,
            status_reason: Option<String>,
            running_count: Option<i32>,
            started_at: Option<chrono::DateTime<Utc>>,
            finished_at: Option<chrono::DateTime<Utc>>,
        ) -> Result<Run> {
            let mut runs = self.runs.lock().unwrap();
            let run = runs.get_mut(&id).unwrap();
            run.status = status;
            run.status_reason = status_reason;
            if running_count.is_some() {
                run.running_count = running_count;
            }
            if started_at.is_some() {
                run.started_at = started_at;
            }
            if finished_at.is_some() {
                run.finished_at = finished_at;
            }
            Ok(run.clone())
        }
        async fn mark_run_resources_created(&self, id: i64) -> Result<()> {
            self.runs.lock().unwrap().get_mut(&id).unwrap().resources_created = true;
            Ok(())
        }
        async fn mark_run_logs_archived(&self, id: i64, at: chrono::DateTime<Utc>) -> Result<()> {
            self.runs.lock().unwrap().get_mut(&id).unwrap().logs_archived_at = Some(at);
            self.runs.lock().unwrap().get_mut(&id).unwrap().final_ = true;
            Ok(())
        }
        async fn list_runs_needing_reconciliation(&self, _: i64) -> Result<Vec<Run>> {
            Ok(self.runs.lock().unwrap().values().cloned().collect())
        }
        async fn prune_run_modified_at_index(&self, _: chrono::DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }
        async fn acquire_or_renew_lease(&self, name: &str, holder: &str, _: i64) -> Result<crate::types::Lease> {
            let mut guard = self.lease_holder.lock().unwrap();
            if guard.is_none() || guard.as_deref() == Some(holder) {
                *guard = Some(holder.to_string());
                Ok(crate::types::Lease {
                    name: name.to_string(),
                    holder: holder.to_string(),
                    acquired_at: Utc::now(),
                    heartbeat_at: Utc::now(),
                })
            } else {
                Err(TygerError::Conflict("lease held by another instance".into()))
            }
        }
        async fn release_lease(&self, _: &str, _: &str) -> Result<()> {
            *self.lease_holder.lock().unwrap() = None;
            Ok(())
        }
    }

    struct FakeBackend {
        fail_validate: bool,
    }

    #[async_trait]
    impl ComputeBackend for FakeBackend {
        async fn ensure_resources(&self, _: &Run, _: &CodespecRef) -> Result<()> {
            Ok(())
        }
        async fn observe(&self, _: &Run) -> Result<BackendRunState> {
            Ok(BackendRunState {
                status: RunStatus::Succeeded,
                status_reason: None,
                running_count: Some(0),
                started_at: None,
                finished_at: Some(Utc::now()),
            })
        }
        async fn cancel(&self, _: &Run) -> Result<()> {
            Ok(())
        }
        async fn finalize(&self, _: &Run) -> Result<()> {
            Ok(())
        }
        async fn validate_target(&self, _: Option<&str>, _: Option<&str>) -> Result<()> {
            if self.fail_validate {
                Err(TygerError::validation("InvalidTarget", "no such node pool"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn cancel_is_idempotent_on_terminal_run() {
        let repo = Arc::new(FakeRepo { runs: Mutex::new(HashMap::new()), lease_holder: Mutex::new(None) });
        let mut run = sample_run(1);
        run.status = RunStatus::Succeeded;
        repo.runs.lock().unwrap().insert(1, run);
        let backend = Arc::new(FakeBackend { fail_validate: false });
        let engine = Controller::new(repo, backend, "instance-a".into());
        let result = engine.cancel(1).await.unwrap();
        assert_eq!(result.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn cancel_transitions_non_terminal_run_to_canceling() {
        let repo = Arc::new(FakeRepo { runs: Mutex::new(HashMap::new()), lease_holder: Mutex::new(None) });
        repo.runs.lock().unwrap().insert(1, sample_run(1));
        let backend = Arc::new(FakeBackend { fail_validate: false });
        let engine = Controller::new(repo, backend, "instance-a".into());
        let result = engine.cancel(1).await.unwrap();
        assert_eq!(result.status, RunStatus::Canceling);
    }

    #[tokio::test]
    async fn reconcile_run_fails_validation_target_immediately() {
        let repo = Arc::new(FakeRepo { runs: Mutex::new(HashMap::new()), lease_holder: Mutex::new(None) });
        let run = sample_run(1);
        repo.runs.lock().unwrap().insert(1, run.clone());
        let backend = Arc::new(FakeBackend { fail_validate: true });
        let engine = Controller::new(repo.clone(), backend, "instance-a".into());
        engine.reconcile_run(&run).await.unwrap();
        let stored = repo.get_run(1).await.unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.status_reason.as_deref(), Some("no such node pool"));
    }

    #[tokio::test]
    async fn only_one_instance_holds_the_lease() {
        let repo = Arc::new(FakeRepo { runs: Mutex::new(HashMap::new()), lease_holder: Mutex::new(None) });
        let backend = Arc::new(FakeBackend { fail_validate: false });
        let a = Controller::new(repo.clone(), backend.clone(), "a".into());
        let b = Controller::new(repo.clone(), backend, "b".into());
        assert!(a.try_acquire_lease().await.unwrap());
        assert!(!b.try_acquire_lease().await.unwrap());
    }
}
