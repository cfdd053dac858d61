//! Graph store seam.
//!
//! A [`GraphConnector`] opens a [`GraphSession`] for one [`DbConfig`]. Every
//! write method of a session is one atomic transaction.

use async_trait::async_trait;

use super::error::GraphError;
use super::schema::{GraphCounts, NodeRecord, RawSubgraph, SubgraphUpsert};
use crate::config::DbConfig;

/// An open connection scoped to one database.
#[async_trait]
pub trait GraphSession: Send + Sync {
    /// Apply the whole batch atomically; returns the number of records written.
    async fn upsert_subtree(&self, upsert: &SubgraphUpsert) -> Result<usize, GraphError>;

    /// Snapshot of the subtree at `root`, or of the whole dataset.
    async fn fetch_subtree(&self, root: Option<&str>) -> Result<RawSubgraph, GraphError>;

    /// Properties of a single node, without children or shape.
    async fn fetch_node(&self, key: &str) -> Result<Option<NodeRecord>, GraphError>;

    /// Rewrite the `placement` property only. `false` if the key is absent.
    async fn update_placement(&self, key: &str, placement: &[f64; 7]) -> Result<bool, GraphError>;

    /// Remove the node at `key` with its descendants, their shapes and every
    /// relationship touching them. Returns the number of deleted nodes,
    /// zero when the key is absent.
    async fn delete_subtree(&self, key: &str) -> Result<u64, GraphError>;

    /// Number of stored nodes and relationships.
    async fn counts(&self) -> Result<GraphCounts, GraphError>;

    /// Remove every node and relationship of the configured database.
    /// Irreversible. Returns the number of deleted nodes.
    async fn delete_all(&self) -> Result<u64, GraphError>;

    /// Release the connection.
    async fn close(&self) -> Result<(), GraphError>;
}

/// Factory for sessions.
#[async_trait]
pub trait GraphConnector: Send + Sync {
    /// Open a session; fails with `Authentication` or `Unavailable`.
    async fn connect(&self, config: &DbConfig) -> Result<Box<dyn GraphSession>, GraphError>;
}

#[async_trait]
impl GraphConnector for Box<dyn GraphConnector> {
    async fn connect(&self, config: &DbConfig) -> Result<Box<dyn GraphSession>, GraphError> {
        (**self).connect(config).await
    }
}
