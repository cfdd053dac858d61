//! Graph store and mapping error types.

use thiserror::Error;

use crate::step::StepError;

/// Errors talking to the graph store.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Credentials rejected.
    #[error("Authentication failed for {user}@{host}: {message}")]
    Authentication {
        host: String,
        user: String,
        message: String,
    },

    /// Store unreachable or transiently failing.
    #[error("Graph store unavailable: {0}")]
    Unavailable(String),

    /// Transient failures persisted through every retry.
    #[error("Commit failed after {attempts} attempt(s): {message}")]
    Persistence { attempts: u32, message: String },

    /// Statement rejected by the store.
    #[error("Query rejected ({code}): {message}")]
    Query { code: String, message: String },

    /// Response that does not match the expected shape.
    #[error("Unexpected response from graph store: {0}")]
    Protocol(String),
}

impl GraphError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, GraphError::Unavailable(_))
    }
}

impl From<reqwest::Error> for GraphError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            GraphError::Unavailable(err.to_string())
        } else if err.is_decode() {
            GraphError::Protocol(err.to_string())
        } else {
            GraphError::Unavailable(err.to_string())
        }
    }
}

/// Errors converting between documents and graph records.
#[derive(Debug, Error)]
pub enum MapperError {
    /// Traversal reached a node twice.
    #[error("Cycle detected in stored hierarchy at '{key}'")]
    CycleDetected { key: String },

    /// No root node could be found.
    #[error("Hierarchy root not found{}", .root.as_ref().map(|r| format!(": '{r}'")).unwrap_or_default())]
    DisconnectedRoot { root: Option<String> },

    /// Several nodes without a parent.
    #[error("Graph holds several hierarchy roots: {}", .0.join(", "))]
    MultipleRoots(Vec<String>),

    /// A `CONTAINS` edge points at a node missing from the fetched set.
    #[error("Node '{parent}' contains '{child}', which was not fetched")]
    MissingNode { parent: String, child: String },

    /// Stored placement is not 7 finite numbers with a non-zero rotation.
    #[error("Invalid placement stored on '{key}'")]
    InvalidPlacement { key: String },

    /// Shape payload text could not be parsed back.
    #[error("Invalid shape payload on '{key}': {source}")]
    Payload {
        key: String,
        #[source]
        source: StepError,
    },
}
