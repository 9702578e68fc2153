//! Crate-level error composition for `tracdap-kernel`.
//!
//! Each sub-module defines its own typed error; [`PlatformError`] wraps them
//! via `#[from]` so the `?` operator converts automatically when a caller
//! works across domains (e.g. an orchestrator worker touching both the job
//! cache and the metadata store).

use thiserror::Error;

/// Crate-level error type composing every sub-module's typed error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PlatformError {
    /// A configuration error. Always fatal at startup.
    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A job-cache error.
    #[error("Cache error: {0}")]
    Cache(#[from] crate::cache::CacheError),

    /// A batch-executor error.
    #[error("Executor error: {0}")]
    Executor(#[from] crate::exec::ExecutorError),

    /// A metadata DAL error.
    #[error("Metadata error: {0}")]
    Metadata(#[from] crate::metadata::MetadataError),

    /// An authentication / authorization error.
    #[error("Auth error: {0}")]
    Auth(#[from] crate::auth::AuthError),

    /// A low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An internal / untyped error described by a message string.
    #[error("{0}")]
    Internal(String),
}

/// Convenience result alias for cross-domain operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;

    #[test]
    fn cache_error_converts_via_from() {
        let cache_err = CacheError::NotFound("job-1".to_string());
        let platform_err: PlatformError = cache_err.into();

        assert!(matches!(platform_err, PlatformError::Cache(_)));
        assert!(platform_err.to_string().contains("job-1"));
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let platform_err: PlatformError = io_err.into();

        assert!(matches!(platform_err, PlatformError::Io(_)));
        assert!(platform_err.to_string().contains("file missing"));
    }

    #[test]
    fn internal_error_display() {
        let err = PlatformError::Internal("something broke".into());
        assert_eq!(err.to_string(), "something broke");
    }
}
