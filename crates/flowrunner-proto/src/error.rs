//! Service-wide error taxonomy.
//!
//! One variant per error kind; every layer — HTTP surface, WebSocket
//! gateway, execution core — speaks this vocabulary. Transient
//! infrastructure kinds are retried inside the owning component; the rest
//! surface to the caller.

use thiserror::Error;

/// Errors that can occur across the task execution service.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The presented credential failed verification.
    #[error("authentication invalid: {0}")]
    AuthInvalid(String),

    /// The permission oracle denied the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The client's active-task quota is exhausted.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The task (or other resource) does not exist for this caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// The task is not currently waiting for input.
    #[error("task not waiting for input: {0}")]
    NotWaiting(String),

    /// The supplied request_id does not match the outstanding prompt.
    #[error("input request mismatch: {0}")]
    InputMismatch(String),

    /// The requested state transition is not allowed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The payload failed validation at the boundary.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The stream backend is unreachable.
    #[error("stream bus unavailable: {0}")]
    BusUnavailable(String),

    /// The object storage backend is unreachable.
    #[error("object storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The persistent store is unreachable.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// The child process violated the stream protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RunnerError {
    /// Transient infrastructure errors are retried with capped exponential
    /// backoff inside the owning component before they surface.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RunnerError::BusUnavailable(_)
                | RunnerError::StorageUnavailable(_)
                | RunnerError::PersistenceUnavailable(_)
        )
    }

    /// The HTTP status code this kind maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            RunnerError::AuthInvalid(_) => 401,
            // The permission oracle contract names 429 for denials.
            RunnerError::PermissionDenied(_) => 429,
            RunnerError::QuotaExceeded(_) => 429,
            RunnerError::NotFound(_) => 404,
            RunnerError::NotWaiting(_)
            | RunnerError::InputMismatch(_)
            | RunnerError::Conflict(_) => 400,
            RunnerError::ValidationFailed(_) => 422,
            RunnerError::BusUnavailable(_)
            | RunnerError::StorageUnavailable(_)
            | RunnerError::PersistenceUnavailable(_) => 503,
            RunnerError::ProtocolViolation(_) | RunnerError::Internal(_) => 500,
        }
    }

    /// Short machine-readable kind name, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            RunnerError::AuthInvalid(_) => "auth_invalid",
            RunnerError::PermissionDenied(_) => "permission_denied",
            RunnerError::QuotaExceeded(_) => "quota_exceeded",
            RunnerError::NotFound(_) => "not_found",
            RunnerError::NotWaiting(_) => "not_waiting",
            RunnerError::InputMismatch(_) => "input_mismatch",
            RunnerError::Conflict(_) => "conflict",
            RunnerError::ValidationFailed(_) => "validation_failed",
            RunnerError::BusUnavailable(_) => "bus_unavailable",
            RunnerError::StorageUnavailable(_) => "storage_unavailable",
            RunnerError::PersistenceUnavailable(_) => "persistence_unavailable",
            RunnerError::ProtocolViolation(_) => "protocol_violation",
            RunnerError::Internal(_) => "internal",
        }
    }
}

impl From<crate::task::InvalidTransition> for RunnerError {
    fn from(err: crate::task::InvalidTransition) -> Self {
        RunnerError::Conflict(err.to_string())
    }
}

/// Result type alias for the service.
pub type RunnerResult<T> = Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_mapping() {
        assert_eq!(RunnerError::AuthInvalid("bad token".into()).http_status(), 401);
        assert_eq!(RunnerError::QuotaExceeded("limit 3".into()).http_status(), 429);
        assert_eq!(RunnerError::NotFound("t-1".into()).http_status(), 404);
        assert_eq!(RunnerError::NotWaiting("t-1".into()).http_status(), 400);
        assert_eq!(RunnerError::ValidationFailed("empty".into()).http_status(), 422);
        assert_eq!(RunnerError::BusUnavailable("down".into()).http_status(), 503);
    }

    #[test]
    fn test_transient_kinds() {
        assert!(RunnerError::BusUnavailable("x".into()).is_transient());
        assert!(RunnerError::PersistenceUnavailable("x".into()).is_transient());
        assert!(!RunnerError::ProtocolViolation("x".into()).is_transient());
        assert!(!RunnerError::QuotaExceeded("x".into()).is_transient());
    }
}
