//! Core domain types for Tyger.
//! These are pure value types — no sqlx, no DB dependencies. The Postgres
//! wire encoding for each enum lives in `tyger-postgres`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Enums ─────────────────────────────────────────────────────

/// Codespec execution kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodespecKind {
    Job,
    Worker,
}

impl CodespecKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Worker => "worker",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "job" => Some(Self::Job),
            "worker" => Some(Self::Worker),
            _ => None,
        }
    }
}

/// Who submitted a run — a human-facing client, or the system itself
/// (e.g. a worker fan-out run launched on behalf of a job run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RunKind {
    User,
    System,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::System => "System",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "User" => Some(Self::User),
            "System" => Some(Self::System),
            _ => None,
        }
    }
}

/// Run lifecycle status. See spec.md §3 for the full transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceling,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Canceling => "Canceling",
            Self::Canceled => "Canceled",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(Self::Pending),
            "Running" => Some(Self::Running),
            "Succeeded" => Some(Self::Succeeded),
            "Failed" => Some(Self::Failed),
            "Canceling" => Some(Self::Canceling),
            "Canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Terminal = {Succeeded, Failed, Canceled} per spec.md §3.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

// ── Codespec ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodespecRef {
    pub name: String,
    pub version: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
    pub gpu: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodespecBuffers {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketSpec {
    pub port: u16,
    pub input_buffer: Option<String>,
    pub output_buffer: Option<String>,
}

/// The content that participates in the semantic-equality hash used for
/// codespec deduplication (spec.md §3 invariant). `name`, `version` and
/// `created_at` are intentionally excluded — they live on `Codespec` itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodespecContent {
    pub kind: CodespecKind,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
    pub identity: Option<String>,
    pub resources: ResourceRequirements,
    pub max_replicas: Option<i32>,
    pub buffers: Option<CodespecBuffers>,
    pub sockets: Vec<SocketSpec>,
    pub endpoints: HashMap<String, u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Codespec {
    pub name: String,
    pub version: i64,
    pub content: CodespecContent,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

// ── Buffer ────────────────────────────────────────────────────

pub const MAX_BUFFER_TAGS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buffer {
    pub id: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub is_soft_deleted: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub tags: HashMap<String, String>,
    pub etag: String,
}

// ── Run ───────────────────────────────────────────────────────

pub const DEFAULT_RUN_TIMEOUT_SECONDS: i64 = 43_200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJob {
    pub codespec_ref: CodespecRef,
    pub node_pool: Option<String>,
    pub replicas: i32,
    pub buffers: HashMap<String, String>,
    pub tags: HashMap<String, String>,
    pub buffer_ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunWorker {
    pub codespec_ref: CodespecRef,
    pub node_pool: Option<String>,
    pub replicas: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub kind: RunKind,
    pub job: RunJob,
    pub worker: Option<RunWorker>,
    pub cluster: Option<String>,
    pub timeout_seconds: i64,
    pub tags: HashMap<String, String>,
    /// Hash of the mutable fields below (spec.md §3); recomputed by the
    /// repository on every read, not stored as its own column.
    #[serde(default)]
    pub etag: String,

    // Observed / engine-populated fields.
    pub status: RunStatus,
    pub status_reason: Option<String>,
    pub running_count: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    // Flags not exposed to clients.
    pub resources_created: bool,
    pub final_: bool,
    pub logs_archived_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Deterministic etag over the mutable, client-supplied fields. Not the
    /// same hash family as buffer etags (spec.md keeps them independent),
    /// but follows the same "hash of mutable fields" contract.
    pub fn compute_etag(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.status.as_str().as_bytes());
        if let Some(reason) = &self.status_reason {
            hasher.update(reason.as_bytes());
        }
        if let Some(rc) = self.running_count {
            hasher.update(rc.to_le_bytes());
        }
        if let Some(started) = self.started_at {
            hasher.update(started.timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
        }
        if let Some(finished) = self.finished_at {
            hasher.update(finished.timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
        }
        let mut tag_keys: Vec<&String> = self.tags.keys().collect();
        tag_keys.sort();
        for k in tag_keys {
            hasher.update(k.as_bytes());
            hasher.update(self.tags[k].as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

// ── Lease ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

// ── Pagination ────────────────────────────────────────────────

pub const DEFAULT_PAGE_SIZE: i64 = 200;
pub const MAX_PAGE_SIZE: i64 = 1000;

/// Opaque continuation token: base32 of `(created_at nanos, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationToken {
    pub created_at_nanos: i64,
    pub id_low: i64,
}

impl ContinuationToken {
    pub fn encode(created_at: DateTime<Utc>, id: &str) -> String {
        let nanos = created_at.timestamp_nanos_opt().unwrap_or(0);
        // id is a base32 buffer id already; fold it into a stable low word
        // via a cheap FNV-1a so the token stays fixed-width.
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in id.as_bytes() {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&nanos.to_be_bytes());
        buf.extend_from_slice(&hash.to_be_bytes());
        data_encoding::BASE32_NOPAD.encode(&buf).to_lowercase()
    }

    pub fn decode(token: &str) -> Option<(DateTime<Utc>, u64)> {
        let bytes = data_encoding::BASE32_NOPAD
            .decode(token.to_uppercase().as_bytes())
            .ok()?;
        if bytes.len() != 16 {
            return None;
        }
        let nanos = i64::from_be_bytes(bytes[0..8].try_into().ok()?);
        let hash = u64::from_be_bytes(bytes[8..16].try_into().ok()?);
        let dt = DateTime::from_timestamp(nanos / 1_000_000_000, (nanos % 1_000_000_000) as u32)?;
        Some((dt, hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
            assert_eq!(RunStatus::from_str_opt(status.as_str()), Some(status));
        }
    }

    #[test]
    fn terminal_statuses_are_exactly_spec_set() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Canceling.is_terminal());
    }

    #[test]
    fn run_etag_changes_with_tags() {
        let mut run = Run {
            id: 1,
            kind: RunKind::User,
            job: RunJob {
                codespec_ref: CodespecRef { name: "c".into(), version: 1 },
                node_pool: None,
                replicas: 1,
                buffers: HashMap::new(),
                tags: HashMap::new(),
                buffer_ttl_seconds: None,
            },
            worker: None,
            cluster: None,
            timeout_seconds: DEFAULT_RUN_TIMEOUT_SECONDS,
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
        };
        let before = run.compute_etag();
        run.tags.insert("team".into(), "signal".into());
        let after = run.compute_etag();
        assert_ne!(before, after);

        // Tag key ordering must not affect the etag.
        let mut reordered_tags = HashMap::new();
        reordered_tags.insert("env".into(), "prod".into());
        reordered_tags.insert("team".into(), "signal".into());
        run.tags = reordered_tags.clone();
        let etag_a = run.compute_etag();
        let mut swapped = HashMap::new();
        swapped.insert("team".into(), "signal".into());
        swapped.insert("env".into(), "prod".into());
        run.tags = swapped;
        let etag_b = run.compute_etag();
        assert_eq!(etag_a, etag_b);
    }

    #[test]
    fn continuation_token_round_trips() {
        let now = Utc::now();
        let token = ContinuationToken::encode(now, "abcde123");
        let (decoded_time, _hash) = ContinuationToken::decode(&token).unwrap();
        // nanosecond precision through base32 round trip
        assert_eq!(decoded_time.timestamp_nanos_opt(), now.timestamp_nanos_opt());
    }
}
