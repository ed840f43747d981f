//! Typed outcomes of the session state machines.
//!
//! None of these are fatal: the orchestrator turns each into a chat reply
//! or a degraded response.

use thiserror::Error;

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("a collect session is already active")]
    AlreadyActive,

    #[error("the collect session has no items")]
    EmptySession,

    #[error("no active session")]
    NoActiveSession,

    #[error("stale reference: {0}")]
    StaleReference(String),

    #[error("{operation} is not valid while {from}")]
    InvalidTransition {
        from: &'static str,
        operation: &'static str,
    },

    #[error("external service failed: {0}")]
    ExternalService(String),
}

impl From<vn_services::ServiceError> for SessionError {
    fn from(e: vn_services::ServiceError) -> Self {
        Self::ExternalService(e.to_string())
    }
}
