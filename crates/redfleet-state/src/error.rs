//! Error types for the RedFleet state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("version conflict on {key}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid instance name: {0}")]
    InvalidName(String),
}

impl StateError {
    /// Whether the error is an infrastructure hiccup worth retrying.
    ///
    /// Conflicts and codec failures are not transient:
    /// retrying the same operation would fail the same way.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StateError::Unavailable(_) | StateError::Open(_) | StateError::Transaction(_)
        )
    }

    /// Whether the error is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::VersionConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StateError::Unavailable("down".into()).is_transient());
        assert!(StateError::Transaction("busy".into()).is_transient());
        assert!(!StateError::InvalidName("x".into()).is_transient());
        assert!(!StateError::Deserialize("bad".into()).is_transient());

        let conflict = StateError::VersionConflict {
            key: "status/a".into(),
            expected: Some(3),
            actual: Some(4),
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_transient());
    }
}
