//! In-process graph store.
//!
//! Datasets are keyed by `(host, database)` and shared by every connector
//! cloned from the same instance. A batch is applied under one lock, so a
//! concurrent reader sees either all of it or none.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::debug;

use super::error::GraphError;
use super::schema::{
    in_subtree, ChildRef, EdgeUpsert, GraphCounts, MergePolicy, NodeRecord, RawNode, RawSubgraph, ShapeRecord,
    SubgraphUpsert, UpsertScope,
};
use super::store::{GraphConnector, GraphSession};
use crate::config::{DbConfig, UserCredentials};

#[derive(Debug, Default, Clone)]
struct Dataset {
    nodes: IndexMap<String, NodeRecord>,
    shapes: HashMap<String, ShapeRecord>,
    /// `(parent, child, ordinal)`
    contains: Vec<(String, String, Option<i64>)>,
    has_shape: HashSet<String>,
}

impl Dataset {
    fn apply(&mut self, upsert: &SubgraphUpsert) {
        let keys: HashSet<&str> = upsert.nodes.iter().map(|n| n.record.key.as_str()).collect();
        let owners: HashSet<&str> = upsert.shapes.iter().map(|s| s.owner.as_str()).collect();

        match &upsert.scope {
            UpsertScope::Dataset => {
                self.nodes.retain(|key, _| keys.contains(key.as_str()));
                self.shapes.retain(|owner, _| owners.contains(owner.as_str()));
                self.contains.clear();
            }
            UpsertScope::Subtree(root) => {
                self.nodes
                    .retain(|key, _| !in_subtree(key, root) || keys.contains(key.as_str()));
                self.shapes
                    .retain(|owner, _| !in_subtree(owner, root) || owners.contains(owner.as_str()));
                self.contains.retain(|(parent, _, _)| !in_subtree(parent, root));
            }
        }
        // Detach relationships of removed nodes.
        let nodes = &self.nodes;
        let shapes = &self.shapes;
        self.contains
            .retain(|(parent, child, _)| nodes.contains_key(parent) && nodes.contains_key(child));
        self.has_shape
            .retain(|owner| nodes.contains_key(owner) && shapes.contains_key(owner));

        for node in &upsert.nodes {
            match node.policy {
                MergePolicy::Overwrite => {
                    self.nodes.insert(node.record.key.clone(), node.record.clone());
                }
                MergePolicy::CreateOnly => {
                    self.nodes
                        .entry(node.record.key.clone())
                        .or_insert_with(|| node.record.clone());
                }
            }
        }

        for shape in &upsert.shapes {
            let unchanged = self
                .shapes
                .get(&shape.owner)
                .is_some_and(|existing| existing.checksum == shape.checksum);
            if !unchanged {
                self.shapes.insert(shape.owner.clone(), shape.clone());
            }
        }

        for edge in &upsert.edges {
            match edge {
                EdgeUpsert::Contains { parent, child, ordinal } => {
                    if !self.nodes.contains_key(parent) || !self.nodes.contains_key(child) {
                        continue;
                    }
                    let existing = self.contains.iter().position(|(p, c, _)| p == parent && c == child);
                    match (ordinal, existing) {
                        (Some(ordinal), Some(index)) => self.contains[index].2 = Some(i64::from(*ordinal)),
                        (Some(ordinal), None) => {
                            self.contains
                                .push((parent.clone(), child.clone(), Some(i64::from(*ordinal))))
                        }
                        (None, Some(_)) => {}
                        (None, None) => {
                            let next = self
                                .contains
                                .iter()
                                .filter(|(p, _, _)| p == parent)
                                .filter_map(|(_, _, o)| *o)
                                .max()
                                .map_or(0, |max| max + 1);
                            self.contains.push((parent.clone(), child.clone(), Some(next)));
                        }
                    }
                }
                EdgeUpsert::HasShape { owner } => {
                    if self.nodes.contains_key(owner) && self.shapes.contains_key(owner) {
                        self.has_shape.insert(owner.clone());
                    }
                }
            }
        }
    }

    fn remove_subtree(&mut self, root: &str) -> u64 {
        let before = self.nodes.len() + self.shapes.len();
        self.nodes.retain(|key, _| !in_subtree(key, root));
        self.shapes.retain(|owner, _| !in_subtree(owner, root));
        let nodes = &self.nodes;
        self.contains
            .retain(|(parent, child, _)| nodes.contains_key(parent) && nodes.contains_key(child));
        self.has_shape.retain(|owner| nodes.contains_key(owner));
        (before - self.nodes.len() - self.shapes.len()) as u64
    }

    fn snapshot(&self, root: Option<&str>) -> RawSubgraph {
        let mut nodes: Vec<RawNode> = self
            .nodes
            .values()
            .filter(|n| root.map_or(true, |root| in_subtree(&n.key, root)))
            .map(|record| RawNode {
                record: record.clone(),
                children: self
                    .contains
                    .iter()
                    .filter(|(parent, _, _)| *parent == record.key)
                    .map(|(_, child, ordinal)| ChildRef {
                        key: child.clone(),
                        ordinal: *ordinal,
                    })
                    .collect(),
                shape: self
                    .has_shape
                    .contains(&record.key)
                    .then(|| self.shapes.get(&record.key).cloned())
                    .flatten(),
            })
            .collect();
        nodes.sort_by(|a, b| a.record.key.cmp(&b.record.key));
        RawSubgraph { nodes }
    }
}

type Stores = Arc<Mutex<HashMap<(String, String), Dataset>>>;

/// Connector for the in-process store.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    stores: Stores,
    credentials: Option<UserCredentials>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject connections whose credentials differ from these.
    pub fn with_credentials(mut self, name: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(UserCredentials {
            name: name.into(),
            password: password.into(),
        });
        self
    }
}

#[async_trait]
impl GraphConnector for MemoryConnector {
    async fn connect(&self, config: &DbConfig) -> Result<Box<dyn GraphSession>, GraphError> {
        if let Some(expected) = &self.credentials {
            if *expected != config.user {
                return Err(GraphError::Authentication {
                    host: config.host.clone(),
                    user: config.user.name.clone(),
                    message: "invalid username or password".into(),
                });
            }
        }
        debug!(host = %config.host, database = %config.database, "opened in-memory session");
        Ok(Box::new(MemorySession {
            stores: Arc::clone(&self.stores),
            key: (config.base_url().to_string(), config.database.clone()),
        }))
    }
}

/// Session over one in-process dataset.
pub struct MemorySession {
    stores: Stores,
    key: (String, String),
}

impl MemorySession {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<(String, String), Dataset>>, GraphError> {
        self.stores
            .lock()
            .map_err(|_| GraphError::Unavailable("in-memory store lock poisoned".into()))
    }
}

#[async_trait]
impl GraphSession for MemorySession {
    async fn upsert_subtree(&self, upsert: &SubgraphUpsert) -> Result<usize, GraphError> {
        let mut stores = self.lock()?;
        // Apply to a copy and swap it in, so the batch is all-or-nothing.
        let mut dataset = stores.get(&self.key).cloned().unwrap_or_default();
        dataset.apply(upsert);
        stores.insert(self.key.clone(), dataset);
        Ok(upsert.len())
    }

    async fn fetch_subtree(&self, root: Option<&str>) -> Result<RawSubgraph, GraphError> {
        let stores = self.lock()?;
        Ok(stores
            .get(&self.key)
            .map(|d| d.snapshot(root))
            .unwrap_or_default())
    }

    async fn fetch_node(&self, key: &str) -> Result<Option<NodeRecord>, GraphError> {
        let stores = self.lock()?;
        Ok(stores.get(&self.key).and_then(|d| d.nodes.get(key).cloned()))
    }

    async fn update_placement(&self, key: &str, placement: &[f64; 7]) -> Result<bool, GraphError> {
        let mut stores = self.lock()?;
        match stores.get_mut(&self.key).and_then(|d| d.nodes.get_mut(key)) {
            Some(node) => {
                node.placement = placement.to_vec();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_subtree(&self, key: &str) -> Result<u64, GraphError> {
        let mut stores = self.lock()?;
        Ok(stores
            .get_mut(&self.key)
            .map(|d| d.remove_subtree(key))
            .unwrap_or(0))
    }

    async fn counts(&self) -> Result<GraphCounts, GraphError> {
        let stores = self.lock()?;
        Ok(stores
            .get(&self.key)
            .map(|d| GraphCounts {
                nodes: (d.nodes.len() + d.shapes.len()) as u64,
                edges: (d.contains.len() + d.has_shape.len()) as u64,
            })
            .unwrap_or_default())
    }

    async fn delete_all(&self) -> Result<u64, GraphError> {
        let mut stores = self.lock()?;
        Ok(stores
            .remove(&self.key)
            .map(|d| (d.nodes.len() + d.shapes.len()) as u64)
            .unwrap_or(0))
    }

    async fn close(&self) -> Result<(), GraphError> {
        debug!(database = %self.key.1, "closed in-memory session");
        Ok(())
    }
}
