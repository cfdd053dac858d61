//! Errors surfaced by [`crate::SyncEngine`] operations.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::graph::{GraphError, MapperError};
use crate::step::{EntityId, Quaternion, StepError};

/// Top-level error of a sync operation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The input file is not a well-formed assembly.
    #[error("{}{source}", path.as_ref().map(|p| format!("{}: ", p.display())).unwrap_or_default())]
    MalformedStep {
        path: Option<PathBuf>,
        #[source]
        source: StepError,
    },

    /// Entity outside the structural subset. Parsing records these as
    /// warnings; they only surface as errors when a caller asks for it.
    #[error("Unsupported entity {entity} ({keyword})")]
    UnsupportedEntity { entity: EntityId, keyword: String },

    /// The named part does not exist in the file or the database.
    #[error("Part '{part}' not found in {location}")]
    PartNotFound { part: String, location: String },

    /// Rotation that does not normalize to a unit quaternion.
    #[error("Invalid quaternion ({}, {}, {}, {}): norm {norm}", quaternion.x, quaternion.y, quaternion.z, quaternion.w)]
    InvalidQuaternion { quaternion: Quaternion, norm: f64 },

    #[error("Authentication failed for {user}@{host}: {message}")]
    Authentication {
        host: String,
        user: String,
        message: String,
    },

    #[error("Graph store unavailable: {0}")]
    Unavailable(String),

    #[error("Commit failed after {attempts} attempt(s): {message}")]
    Persistence { attempts: u32, message: String },

    /// A statement the store rejected for a non-transient reason.
    #[error("Query rejected ({code}): {message}")]
    Query { code: String, message: String },

    #[error("Cycle detected in stored hierarchy of database '{database}' at '{key}'")]
    CycleDetected { database: String, key: String },

    #[error("No hierarchy root{} in database '{database}'", root.as_ref().map(|r| format!(" '{r}'")).unwrap_or_default())]
    DisconnectedRoot { database: String, root: Option<String> },

    /// The stored hierarchy cannot be turned back into a document.
    #[error("Inconsistent hierarchy in database '{database}': {source}")]
    InconsistentGraph {
        database: String,
        #[source]
        source: MapperError,
    },

    /// `add_part` would mount below a root other than the stored one.
    #[error("Mount path '{mount}' is outside the hierarchy stored in database '{database}'")]
    RootMismatch { mount: String, database: String },

    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Attach the file being processed to a codec error.
    pub fn step(path: impl Into<PathBuf>, err: StepError) -> Self {
        match err {
            StepError::Io { path, source } => SyncError::Io { path, source },
            StepError::UnsupportedEntity { entity, keyword } => SyncError::UnsupportedEntity { entity, keyword },
            source => SyncError::MalformedStep {
                path: Some(path.into()),
                source,
            },
        }
    }

    /// Attach the database name to a mapping error.
    pub fn mapper(database: &str, err: MapperError) -> Self {
        let database = database.to_string();
        match err {
            MapperError::CycleDetected { key } => SyncError::CycleDetected { database, key },
            MapperError::DisconnectedRoot { root } => SyncError::DisconnectedRoot { database, root },
            source => SyncError::InconsistentGraph { database, source },
        }
    }

    /// Whether the operation may succeed if simply retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Unavailable(_) | SyncError::Persistence { .. })
    }
}

impl From<StepError> for SyncError {
    fn from(err: StepError) -> Self {
        match err {
            StepError::Io { path, source } => SyncError::Io { path, source },
            StepError::UnsupportedEntity { entity, keyword } => SyncError::UnsupportedEntity { entity, keyword },
            source => SyncError::MalformedStep { path: None, source },
        }
    }
}

impl From<GraphError> for SyncError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Authentication { host, user, message } => SyncError::Authentication { host, user, message },
            GraphError::Unavailable(message) => SyncError::Unavailable(message),
            GraphError::Persistence { attempts, message } => SyncError::Persistence { attempts, message },
            GraphError::Query { code, message } => SyncError::Query { code, message },
            GraphError::Protocol(message) => SyncError::Query {
                code: "protocol".into(),
                message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_keeps_path() {
        let err = SyncError::step(
            "/tmp/a.stp",
            StepError::Syntax {
                line: 3,
                message: "unexpected ';'".into(),
            },
        );
        assert_eq!(err.to_string(), "/tmp/a.stp: Malformed STEP at line 3: unexpected ';'");
    }

    #[test]
    fn test_mapper_error_mapping() {
        let err = SyncError::mapper("neo4j", MapperError::DisconnectedRoot { root: None });
        assert!(matches!(err, SyncError::DisconnectedRoot { ref database, root: None } if database == "neo4j"));
        assert_eq!(err.to_string(), "No hierarchy root in database 'neo4j'");

        let err = SyncError::mapper("neo4j", MapperError::MultipleRoots(vec!["A".into(), "B".into()]));
        assert!(matches!(err, SyncError::InconsistentGraph { .. }));
    }

    #[test]
    fn test_graph_error_mapping() {
        let err: SyncError = GraphError::Unavailable("refused".into()).into();
        assert!(err.is_transient());
        let err: SyncError = GraphError::Query {
            code: "Neo.ClientError.Statement.SyntaxError".into(),
            message: "bad".into(),
        }
        .into();
        assert!(!err.is_transient());
    }
}
