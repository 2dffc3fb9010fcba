//! Error types for the backup engine.

use thiserror::Error;

/// Errors surfaced synchronously to callers of the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Precondition(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure of a single backup unit. The `Display` text is what gets stored in
/// the job's error column.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error("optimize failed: {0}")]
    Optimize(String),

    #[error("dump failed: {0}")]
    Process(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("service restart failed: database did not come back within {0} seconds")]
    RestartFailed(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_error_messages_are_stable() {
        assert_eq!(
            UnitError::RestartFailed(600).to_string(),
            "service restart failed: database did not come back within 600 seconds"
        );
        assert_eq!(UnitError::Process("exit 2".into()).to_string(), "dump failed: exit 2");
    }

    #[test]
    fn anyhow_converts_to_internal() {
        let err: EngineError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, EngineError::Internal(_)));
        assert_eq!(err.to_string(), "boom");
    }
}
