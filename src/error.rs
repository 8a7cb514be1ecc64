// Typed errors shared across the gateway, session store, engine, and registry

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the core components.
///
/// A non-zero verification exit is deliberately absent here: it is a normal
/// outcome that drives the engine's retry decision, and only reaches a caller
/// through a terminal task's recorded last error.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invocation timed out after {timeout_secs}s (last tier tried: {tier})")]
    InvocationTimeout { tier: String, timeout_secs: u64 },

    #[error("tool rejected the invocation: {diagnostic}")]
    InvocationRejected { diagnostic: String },

    #[error("tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error("session {0} is bound to an active evolution task")]
    SessionBusy(Uuid),

    #[error("capability violation: {0}")]
    CapabilityViolation(String),

    #[error("verification command could not execute: {0}")]
    VerificationCommandCrash(String),

    #[error("iteration limit of {0} reached without passing verification")]
    IterationLimitExceeded(u32),

    #[error("an active task already owns target path {}", .0.display())]
    ConcurrentTargetConflict(PathBuf),

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("task {0} is still running; cancel it before removal")]
    TaskActive(Uuid),
}

impl CoreError {
    /// True for errors that reject a request before any work is scheduled.
    pub fn is_submission_rejection(&self) -> bool {
        matches!(
            self,
            CoreError::SessionNotFound(_)
                | CoreError::CapabilityViolation(_)
                | CoreError::ConcurrentTargetConflict(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = CoreError::InvocationRejected {
            diagnostic: "tool refused: Write not permitted".to_string(),
        };
        assert!(err.to_string().contains("Write not permitted"));

        let err = CoreError::ConcurrentTargetConflict(PathBuf::from("/tmp/lib.rs"));
        assert!(err.to_string().contains("/tmp/lib.rs"));
    }

    #[test]
    fn test_submission_rejections() {
        assert!(CoreError::SessionNotFound(Uuid::new_v4()).is_submission_rejection());
        assert!(CoreError::ConcurrentTargetConflict(PathBuf::new()).is_submission_rejection());
        assert!(!CoreError::InvocationTimeout {
            tier: "sonnet".to_string(),
            timeout_secs: 300,
        }
        .is_submission_rejection());
    }
}
