//! Engine error types.

use arbor_storage::StorageError;

/// Errors surfaced by engine operations.
///
/// Non-fatal conditions (broken references, depth cut-offs, unresolved
/// values, incomplete blueprints) are reported through result values and
/// never appear here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Creating an occurrence failed; nothing of it was persisted.
    #[error("failed to instantiate occurrence {occurrence} of repeater {repeater}: {source}")]
    Instantiation {
        repeater: String,
        occurrence: u32,
        #[source]
        source: StorageError,
    },

    /// The node carries no occurrence back-references.
    #[error("node {0} is not part of a repeater occurrence")]
    NotAnOccurrence(String),

    /// The node is not a repeater and declares no template.
    #[error("node {0} is not a repeater")]
    NotARepeater(String),

    /// A whole-graph operation is already running.
    #[error("engine busy: {0}")]
    Busy(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Wraps a storage failure raised while building occurrence `occurrence`.
    pub fn instantiation(repeater: impl Into<String>, occurrence: u32, source: StorageError) -> Self {
        Self::Instantiation {
            repeater: repeater.into(),
            occurrence,
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_not_found(),
            Self::Instantiation { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Returns `true` if retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Busy(_) => true,
            Self::Storage(e) => e.is_retryable(),
            Self::Instantiation { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instantiation_keeps_storage_cause() {
        let e = EngineError::instantiation("rep", 3, StorageError::collision("node", "a-3"));
        assert_eq!(
            e.to_string(),
            "failed to instantiate occurrence 3 of repeater rep: node id already in use: a-3"
        );
        assert!(std::error::Error::source(&e).is_some());
        assert!(!e.is_retryable());
    }

    #[test]
    fn predicates_look_through_storage() {
        assert!(EngineError::from(StorageError::not_found("node", "x")).is_not_found());
        assert!(EngineError::Busy("batch".into()).is_retryable());
        assert!(!EngineError::NotARepeater("x".into()).is_not_found());
    }
}
