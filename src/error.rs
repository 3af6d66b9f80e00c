use bincode::ErrorKind;

use crate::storage::scn::Scn;

/// Custom Result type for mvstate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for mvstate
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Bounded wait on another writer's pending version exceeded
    #[error("lock timeout, another writer still holds the row")]
    LockTimeout,
    /// Write rejected by a row-level invariant
    #[error("write conflict: {0}")]
    Conflict(String),
    /// Recovery tried to apply a commit marker at or below the last replayed one
    #[error("replay out of order: last replayed scn {last}, got {got}")]
    ReplayOutOfOrder { last: Scn, got: Scn },
    /// Lookup of a key that was never written. Reads turn this into `None`.
    #[error("key not found")]
    KeyNotFound,
    /// Raised by scan consumers to stop a traversal
    #[error("scan aborted: {0}")]
    ScanAborted(String),
    /// Internal error (state machine, serialization, etc.)
    #[error("internal error {0}")]
    Internal(String),
}

impl From<Box<ErrorKind>> for Error {
    fn from(value: Box<ErrorKind>) -> Self {
        Error::Internal(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use crate::storage::scn::Scn;

    #[test]
    fn test_display() {
        assert_eq!(
            Error::ReplayOutOfOrder { last: Scn::new(5), got: Scn::new(3) }.to_string(),
            "replay out of order: last replayed scn 5, got 3"
        );
        assert_eq!(Error::ScanAborted("disk full".into()).to_string(), "scan aborted: disk full");
    }

    #[test]
    fn test_from_bincode() {
        let err: Error = Box::new(bincode::ErrorKind::SizeLimit).into();
        assert!(matches!(err, Error::Internal(_)));
    }
}
