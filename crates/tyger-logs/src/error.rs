//! Error type for the log pipeline. Kept separate from `TygerError` since
//! most of the pipeline (filters, reformatter) has nothing to do with the
//! control-plane error vocabulary in spec.md §7 — only the archival task
//! crosses back into `TygerError` territory (engine-visible failures).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend log source error: {0}")]
    Backend(String),

    #[error("archive source '{0}' has no recoverable line count")]
    UnknownLineCount(String),

    #[error("resumable source exhausted its reopen attempts")]
    ReopenExhausted,
}
