//! Domain error type for the Tyger engine.
//!
//! Kept free of any transport concern (axum lives in `tyger-server`). Every
//! variant maps to one of the error kinds in spec.md §7.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TygerError {
    #[error("validation failed ({code}): {message}")]
    Validation { code: &'static str, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transient error (retries exhausted): {0}")]
    Transient(String),

    #[error("buffer failed: {0}")]
    BufferFailed(String),

    #[error("fatal engine error: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl TygerError {
    /// Stable machine-readable code echoed in the API error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. } => code,
            Self::NotFound(_) => "NotFound",
            Self::PreconditionFailed(_) => "PreconditionFailed",
            Self::Conflict(_) => "Conflict",
            Self::Unauthenticated(_) => "Unauthenticated",
            Self::Unauthorized(_) => "Unauthorized",
            Self::Transient(_) => "Transient",
            Self::BufferFailed(_) => "BufferFailed",
            Self::Fatal(_) => "Fatal",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::NotFound(_) => 404,
            Self::PreconditionFailed(_) => 412,
            Self::Conflict(_) => 409,
            Self::Unauthenticated(_) => 401,
            Self::Unauthorized(_) => 403,
            Self::Transient(_) => 503,
            Self::BufferFailed(_) => 409,
            Self::Fatal(_) => 500,
        }
    }

    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TygerError>;
