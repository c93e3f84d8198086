//! Data-plane error kinds, mirroring Azure Blob Storage's error-code
//! vocabulary per spec.md §6 ("header `x-ms-error-code` mirrors Azure Blob
//! Storage error codes for compatibility").

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DataPlaneError {
    #[error("container not found")]
    ContainerNotFound,
    #[error("blob not found")]
    BlobNotFound,
    #[error("Content-MD5 does not match the stored blob")]
    Md5Mismatch,
    #[error("X-Hash-Chain does not match the preceding block's chain")]
    HashChainMismatch,
    #[error("blob already exists and may not be overwritten")]
    UnauthorizedBlobOverwrite,
    #[error("reader reached a buffer the writer marked failed before .end was written")]
    BufferFailedState,
    #[error("signed URL is missing required parameters, expired, or fails verification")]
    AuthenticationFailed,
    #[error("signed URL does not grant the requested action")]
    AuthorizationPermissionMismatch,
    #[error("server busy, retry with backoff")]
    ServerBusy,
}

impl DataPlaneError {
    /// The `x-ms-error-code` compatibility header value (spec.md §6).
    pub fn x_ms_error_code(&self) -> &'static str {
        match self {
            Self::ContainerNotFound => "ContainerNotFound",
            Self::BlobNotFound => "BlobNotFound",
            Self::Md5Mismatch => "Md5Mismatch",
            Self::HashChainMismatch => "HashChainMismatch",
            Self::UnauthorizedBlobOverwrite => "UnauthorizedBlobOverwrite",
            Self::BufferFailedState => "BufferFailedState",
            Self::AuthenticationFailed => "AuthenticationFailed",
            Self::AuthorizationPermissionMismatch => "AuthorizationPermissionMismatch",
            Self::ServerBusy => "ServerBusy",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::ContainerNotFound | Self::BlobNotFound => 404,
            Self::Md5Mismatch | Self::HashChainMismatch => 400,
            Self::UnauthorizedBlobOverwrite => 403,
            Self::BufferFailedState => 409,
            Self::AuthenticationFailed => 403,
            Self::AuthorizationPermissionMismatch => 403,
            Self::ServerBusy => 503,
        }
    }
}
