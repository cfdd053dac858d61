//! STEP codec error types.

use std::path::PathBuf;
use thiserror::Error;

use super::entity::EntityId;

/// Errors raised while reading or writing an exchange file.
#[derive(Debug, Error)]
pub enum StepError {
    /// Lexical or grammatical error, with the 1-based line it was found on.
    #[error("Malformed STEP at line {line}: {message}")]
    Syntax { line: usize, message: String },

    /// Structurally invalid content (dangling references, non-tree product structure, ...).
    #[error("Malformed STEP{}: {message}", entity.map(|e| format!(" at {e}")).unwrap_or_default())]
    Malformed {
        entity: Option<EntityId>,
        message: String,
    },

    /// Entity outside the recognized structural subset. Non-fatal: the entity
    /// is kept as opaque payload and the error is recorded as a warning.
    #[error("Unsupported entity {entity} ({keyword}); kept as opaque payload")]
    UnsupportedEntity { entity: EntityId, keyword: String },

    /// IO error.
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StepError {
    pub(crate) fn malformed(entity: EntityId, message: impl Into<String>) -> Self {
        StepError::Malformed {
            entity: Some(entity),
            message: message.into(),
        }
    }

    /// Malformed content not attributable to a single instance.
    pub(crate) fn malformed_file(message: impl Into<String>) -> Self {
        StepError::Malformed {
            entity: None,
            message: message.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StepError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error leaves the document usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StepError::UnsupportedEntity { .. })
    }
}

// Compared by rendered message so documents stay comparable.
impl PartialEq for StepError {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

pub type Result<T> = std::result::Result<T, StepError>;
