//! SQLx row types for the Tyger Postgres adapter.
//!
//! Each row struct derives `sqlx::FromRow` and converts into a `tyger_core`
//! domain type. This isolates sqlx from `tyger-core`, which stays pure.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tyger_core::types::{Run, RunJob, RunKind, RunStatus, RunWorker};

// ── Enum string converters ────────────────────────────────────
//
// The core enums have no `sqlx::Type` derive; Postgres stores them as plain
// TEXT columns, decoded via `String` and converted here.

pub fn parse_run_kind(s: &str) -> RunKind {
    RunKind::from_str_opt(s).unwrap_or(RunKind::User) // safe fallback
}

pub fn encode_run_kind(kind: RunKind) -> &'static str {
    kind.as_str()
}

pub fn parse_run_status(s: &str) -> RunStatus {
    RunStatus::from_str_opt(s).unwrap_or(RunStatus::Pending) // safe fallback
}

pub fn encode_run_status(status: RunStatus) -> &'static str {
    status.as_str()
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PgRunRow {
    pub id: i64,
    pub kind: String,
    pub job: serde_json::Value,
    pub worker: Option<serde_json::Value>,
    pub cluster: Option<String>,
    pub timeout_seconds: i64,
    pub tags: serde_json::Value,
    pub status: String,
    pub status_reason: Option<String>,
    pub running_count: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub resources_created: bool,
    pub r#final: bool,
    pub logs_archived_at: Option<DateTime<Utc>>,
}

impl TryFrom<PgRunRow> for Run {
    type Error = anyhow::Error;

    fn try_from(row: PgRunRow) -> Result<Self, Self::Error> {
        let job: RunJob = serde_json::from_value(row.job)?;
        let worker: Option<RunWorker> = row.worker.map(serde_json::from_value).transpose()?;
        let tags: HashMap<String, String> = serde_json::from_value(row.tags)?;
        let mut run = Run {
            id: row.id,
            kind: parse_run_kind(&row.kind),
            job,
            worker,
            cluster: row.cluster,
            timeout_seconds: row.timeout_seconds,
            tags,
            etag: String::new(),
            status: parse_run_status(&row.status),
            status_reason: row.status_reason,
            running_count: row.running_count,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            resources_created: row.resources_created,
            final_: row.r#final,
            logs_archived_at: row.logs_archived_at,
        };
        run.etag = run.compute_etag();
        Ok(run)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PgBufferRow {
    pub id: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub is_soft_deleted: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub tags: serde_json::Value,
    pub etag: String,
}

impl TryFrom<PgBufferRow> for tyger_core::types::Buffer {
    type Error = anyhow::Error;

    fn try_from(row: PgBufferRow) -> Result<Self, Self::Error> {
        let tags: HashMap<String, String> = serde_json::from_value(row.tags)?;
        Ok(tyger_core::types::Buffer {
            id: row.id,
            location: row.location,
            created_at: row.created_at,
            is_soft_deleted: row.is_soft_deleted,
            expires_at: row.expires_at,
            tags,
            etag: row.etag,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PgCodespecRow {
    pub name: String,
    pub version: i64,
    pub content_hash: String,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<PgCodespecRow> for tyger_core::types::Codespec {
    type Error = anyhow::Error;

    fn try_from(row: PgCodespecRow) -> Result<Self, Self::Error> {
        let content = serde_json::from_value(row.content)?;
        Ok(tyger_core::types::Codespec {
            name: row.name,
            version: row.version,
            content,
            content_hash: row.content_hash,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_kind_round_trips() {
        for kind in [RunKind::User, RunKind::System] {
            assert_eq!(parse_run_kind(encode_run_kind(kind)), kind);
        }
    }

    #[test]
    fn run_status_round_trips() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Succeeded,
            RunStatus::Failed,
            RunStatus::Canceling,
            RunStatus::Canceled,
        ] {
            assert_eq!(parse_run_status(encode_run_status(status)), status);
        }
    }

    #[test]
    fn unknown_wire_strings_fall_back_safely() {
        assert_eq!(parse_run_kind("garbage"), RunKind::User);
        assert_eq!(parse_run_status("garbage"), RunStatus::Pending);
    }
}
