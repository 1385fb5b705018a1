//! Common error types for Switchyard.

use thiserror::Error;

/// Top-level error type for Switchyard operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A configurable feature was absent from both the call context and the
    /// client defaults.
    #[error("Missing context feature: {0}")]
    MissingContext(String),

    /// No rule matched and no default exists.
    #[error("No match: {0}")]
    NoMatch(String),

    /// A server value could not be converted into the local type.
    #[error("Coercion rejected: {0}")]
    CoercionRejected(String),

    /// A validator refused a resolved value.
    #[error("Validator rejected value: {0}")]
    ValidatorRejected(String),

    /// Declare, fetch or ping against the service failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The first sync cycle of a scheduler failed.
    #[error("Initial sync failed: {0}")]
    SchedulerFatal(#[source] Box<Error>),

    /// A value did not have the expected Rust-side type.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not allowed in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_fatal_error_keeps_source() {
        let err = Error::SchedulerFatal(Box::new(Error::Transport("connection refused".into())));
        assert_eq!(
            err.to_string(),
            "Initial sync failed: Transport error: connection refused"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transport("timeout".into()).is_transient());
        assert!(!Error::NoMatch("a".into()).is_transient());
        assert!(!Error::CoercionRejected("x".into()).is_transient());
    }
}
