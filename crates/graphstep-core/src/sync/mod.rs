//! Public sync operations.
//!
//! [`SyncEngine`] holds no session between calls: every operation parses
//! its input first, then connects, acts and closes the session on every
//! exit path.

pub mod estimate;
pub mod hierarchy;

use std::path::Path;

use chrono::Utc;
use glam::DQuat;
use tracing::{info, warn};

use crate::config::{Config, DbConfig, QUATERNION_TOLERANCE};
use crate::error::SyncError;
use crate::graph::schema::{escape_segment, in_subtree, join_key, parent_key, MergePolicy, KEY_SEPARATOR};
use crate::graph::{
    GraphConnector, GraphMapper, GraphSession, MapperError, Neo4jConnector, SubgraphUpsert, UpsertScope,
};
use crate::step::{NodeKind, Placement, Position, Quaternion, StepCodec, StepDocument, StepHeader};

pub use hierarchy::{PlacementView, ProductHierarchy};

/// Orchestrates codec, mapper and graph store.
pub struct SyncEngine<C: GraphConnector = Box<dyn GraphConnector>> {
    connector: C,
    config: Config,
}

impl SyncEngine<Neo4jConnector> {
    /// Engine talking to Neo4j over HTTP.
    pub fn neo4j(config: Config) -> Self {
        Self::new(Neo4jConnector::new(config.client.clone()), config)
    }
}

impl<C: GraphConnector> SyncEngine<C> {
    pub fn new(connector: C, config: Config) -> Self {
        Self { connector, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mount a part of `path` (or the whole file when `part_name` is empty)
    /// below `assembly_path`. Returns the number of records written.
    ///
    /// An empty `assembly_path` keeps the part's own parent path. With an
    /// empty `part_name` and an empty (or root) `assembly_path` this is
    /// exactly [`SyncEngine::push_file`].
    pub async fn add_part(
        &self,
        path: impl AsRef<Path>,
        assembly_path: &str,
        part_name: &str,
        db: &DbConfig,
    ) -> Result<usize, SyncError> {
        let path = path.as_ref();
        let doc = parse(path)?;
        let root_key = GraphMapper::root_key(&doc);
        let assembly_path = assembly_path.trim_matches(KEY_SEPARATOR);

        let upsert = if part_name.is_empty() {
            if assembly_path.is_empty() || assembly_path == root_key {
                return self.push_document(&doc, path, db).await;
            }
            GraphMapper::mount(&doc.root, &join_key(assembly_path, &root_key))
        } else {
            let (key, node) = GraphMapper::find_part(&doc, part_name).ok_or_else(|| SyncError::PartNotFound {
                part: part_name.to_string(),
                location: path.display().to_string(),
            })?;
            let key = if assembly_path.is_empty() {
                key
            } else {
                let segment = key.rsplit(KEY_SEPARATOR).next().unwrap_or(&key);
                join_key(assembly_path, segment)
            };
            GraphMapper::mount(node, &key)
        };

        info!(
            path = %path.display(),
            database = %db.database,
            mount = ?upsert.scope,
            "Adding part"
        );

        let session = self.connector.connect(db).await?;
        let result = mount(&*session, &upsert, db).await;
        finish(session, result).await
    }

    /// Rewrite the translation of the node at `part_key`, keeping its
    /// rotation. Returns the new placement.
    pub async fn move_part(&self, part_key: &str, position: Position, db: &DbConfig) -> Result<Placement, SyncError> {
        let session = self.connector.connect(db).await?;
        let result = async {
            let mut wire = current_placement(&*session, part_key, db).await?;
            wire[..3].copy_from_slice(&[position.x, position.y, position.z]);
            store_placement(&*session, part_key, wire, db).await
        }
        .await;
        let placement = finish(session, result).await?;
        info!(part = part_key, x = position.x, y = position.y, z = position.z, "Moved part");
        Ok(placement)
    }

    /// Apply `quaternion` on top of the current orientation of the node at
    /// `part_key`, keeping its translation. Returns the new placement.
    pub async fn rotate_part(
        &self,
        part_key: &str,
        quaternion: Quaternion,
        db: &DbConfig,
    ) -> Result<Placement, SyncError> {
        let rotation = quaternion
            .to_unit(QUATERNION_TOLERANCE)
            .ok_or_else(|| SyncError::InvalidQuaternion {
                quaternion,
                norm: quaternion.norm(),
            })?;

        let session = self.connector.connect(db).await?;
        let result = async {
            let wire = current_placement(&*session, part_key, db).await?;
            store_placement(&*session, part_key, rotate_wire(wire, rotation), db).await
        }
        .await;
        let placement = finish(session, result).await?;
        info!(part = part_key, "Rotated part");
        Ok(placement)
    }

    /// Remove the node at `part_key` together with its subtree and shapes.
    /// Deleting the root empties the dataset. Returns the number of deleted
    /// graph nodes.
    pub async fn delete_part(&self, part_key: &str, db: &DbConfig) -> Result<u64, SyncError> {
        let part_key = part_key.trim_matches(KEY_SEPARATOR);
        let session = self.connector.connect(db).await?;
        let result = session.delete_subtree(part_key).await.map_err(SyncError::from);
        let deleted = finish(session, result).await?;
        if deleted == 0 {
            return Err(part_not_found(part_key, db));
        }
        info!(part = part_key, database = %db.database, deleted, "Deleted part");
        Ok(deleted)
    }

    /// Copy the subtree at `part_key` as a new child of `assembly_path`, at
    /// identity placement. An empty `assembly_path` duplicates next to the
    /// original. Returns the key of the copy.
    pub async fn duplicate_part(
        &self,
        part_key: &str,
        assembly_path: &str,
        db: &DbConfig,
    ) -> Result<String, SyncError> {
        let part_key = part_key.trim_matches(KEY_SEPARATOR);
        let assembly_path = match assembly_path.trim_matches(KEY_SEPARATOR) {
            "" => parent_key(part_key).ok_or_else(|| part_not_found(&format!("parent of '{part_key}'"), db))?,
            path => path,
        };

        let session = self.connector.connect(db).await?;
        let result = duplicate(&*session, part_key, assembly_path, db).await;
        let key = finish(session, result).await?;
        info!(part = part_key, copy = %key, database = %db.database, "Duplicated part");
        Ok(key)
    }

    /// Upsert the whole document of `path`, replacing the stored dataset.
    /// Returns the number of records written.
    pub async fn push_file(&self, path: impl AsRef<Path>, db: &DbConfig) -> Result<usize, SyncError> {
        let path = path.as_ref();
        let doc = parse(path)?;
        self.push_document(&doc, path, db).await
    }

    async fn push_document(&self, doc: &StepDocument, path: &Path, db: &DbConfig) -> Result<usize, SyncError> {
        let upsert = GraphMapper::to_graph(doc);
        let session = self.connector.connect(db).await?;
        let result = session.upsert_subtree(&upsert).await.map_err(SyncError::from);
        let written = finish(session, result).await?;
        info!(
            path = %path.display(),
            database = %db.database,
            nodes = doc.node_count(),
            records = written,
            "Pushed document"
        );
        Ok(written)
    }

    /// Rebuild the stored hierarchy and write it to `output`. Returns the
    /// number of product nodes written.
    pub async fn pull_file(&self, output: impl AsRef<Path>, db: &DbConfig) -> Result<usize, SyncError> {
        let output = output.as_ref();
        let mut doc = self.fetch_document(db).await?;

        if !doc.root.placement.is_identity() {
            warn!(root = %doc.root.name, "Root placement is not representable in STEP; writing identity");
        }
        let file_name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        doc.header = StepHeader::generated(&file_name, Utc::now());

        StepCodec::write_file(&doc, output).map_err(|e| SyncError::step(output, e))?;
        info!(path = %output.display(), database = %db.database, nodes = doc.node_count(), "Pulled document");
        Ok(doc.node_count())
    }

    /// Stored hierarchy as a serializable tree.
    pub async fn get_product_hierarchy(&self, db: &DbConfig) -> Result<ProductHierarchy, SyncError> {
        let doc = self.fetch_document(db).await?;
        Ok(ProductHierarchy::from_document(&doc))
    }

    /// Delete every node and relationship of `db.database`. Irreversible.
    pub async fn clear_database(&self, db: &DbConfig) -> Result<u64, SyncError> {
        let session = self.connector.connect(db).await?;
        let result = session.delete_all().await.map_err(SyncError::from);
        let deleted = finish(session, result).await?;
        info!(database = %db.database, deleted, "Cleared database");
        Ok(deleted)
    }

    /// Advisory upload time for `path`, in seconds.
    pub async fn estimate_duration_upload(&self, path: impl AsRef<Path>) -> Result<f64, SyncError> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await.map_err(|source| SyncError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(estimate::upload_seconds(metadata.len(), &self.config.estimate))
    }

    /// Advisory download time for the stored dataset, in seconds.
    pub async fn estimate_duration_download(&self, db: &DbConfig) -> Result<f64, SyncError> {
        let session = self.connector.connect(db).await?;
        let result = session.counts().await.map_err(SyncError::from);
        let counts = finish(session, result).await?;
        Ok(estimate::download_seconds(counts, &self.config.estimate))
    }

    async fn fetch_document(&self, db: &DbConfig) -> Result<StepDocument, SyncError> {
        let session = self.connector.connect(db).await?;
        let result = session.fetch_subtree(None).await.map_err(SyncError::from);
        let raw = finish(session, result).await?;
        GraphMapper::from_graph(None, &raw).map_err(|e| SyncError::mapper(&db.database, e))
    }
}

fn parse(path: &Path) -> Result<StepDocument, SyncError> {
    StepCodec::parse_file(path).map_err(|e| SyncError::step(path, e))
}

/// Close the session, then hand back the operation's result. A close
/// failure is reported only when the operation itself succeeded.
async fn finish<T>(session: Box<dyn GraphSession>, result: Result<T, SyncError>) -> Result<T, SyncError> {
    match (session.close().await, result) {
        (Ok(()), result) => result,
        (Err(err), Ok(_)) => Err(err.into()),
        (Err(err), Err(original)) => {
            warn!(error = %err, "Failed to close session");
            Err(original)
        }
    }
}

async fn mount(session: &dyn GraphSession, upsert: &SubgraphUpsert, db: &DbConfig) -> Result<usize, SyncError> {
    let mounted = match &upsert.scope {
        UpsertScope::Subtree(key) => key.as_str(),
        UpsertScope::Dataset => "",
    };
    let root = mounted.split(KEY_SEPARATOR).next().unwrap_or(mounted);
    if session.fetch_node(root).await?.is_none() && session.counts().await?.nodes > 0 {
        return Err(SyncError::RootMismatch {
            mount: parent_key(mounted).unwrap_or(mounted).to_string(),
            database: db.database.clone(),
        });
    }
    Ok(session.upsert_subtree(upsert).await?)
}

async fn duplicate(
    session: &dyn GraphSession,
    part_key: &str,
    assembly_path: &str,
    db: &DbConfig,
) -> Result<String, SyncError> {
    let raw = session.fetch_subtree(Some(part_key)).await?;
    if raw.nodes.is_empty() {
        return Err(part_not_found(part_key, db));
    }
    let mut copy = GraphMapper::from_graph(Some(part_key), &raw)
        .map_err(|e| SyncError::mapper(&db.database, e))?
        .root;
    copy.placement = Placement::IDENTITY;

    let assembly = session.fetch_subtree(Some(assembly_path)).await?;
    let target = assembly
        .nodes
        .iter()
        .find(|n| n.record.key == assembly_path)
        .ok_or_else(|| part_not_found(assembly_path, db))?;

    let taken: Vec<&str> = assembly.nodes.iter().map(|n| n.record.key.as_str()).collect();
    let key = free_key(assembly_path, &copy.name, &taken);

    let mut upsert = GraphMapper::mount(&copy, &key);
    if target.record.kind == NodeKind::Part {
        // A part that gains a child becomes an assembly.
        if let Some(node) = upsert.nodes.iter_mut().find(|n| n.record.key == assembly_path) {
            node.record = target.record.clone();
            node.record.kind = NodeKind::Assembly;
            node.policy = MergePolicy::Overwrite;
        }
    }
    session.upsert_subtree(&upsert).await?;
    Ok(key)
}

/// First key below `parent` for a product called `name` that no stored node
/// uses: `name`, then `name[2]`, `name[3]`, ...
fn free_key(parent: &str, name: &str, taken: &[&str]) -> String {
    let segment = escape_segment(name);
    let used = |key: &str| taken.iter().any(|t| in_subtree(t, key));
    let mut key = join_key(parent, &segment);
    let mut n = 2;
    while used(&key) {
        key = join_key(parent, &format!("{segment}[{n}]"));
        n += 1;
    }
    key
}

async fn current_placement(session: &dyn GraphSession, key: &str, db: &DbConfig) -> Result<[f64; 7], SyncError> {
    let node = session
        .fetch_node(key)
        .await?
        .ok_or_else(|| part_not_found(key, db))?;
    let invalid = || SyncError::mapper(&db.database, MapperError::InvalidPlacement { key: key.to_string() });
    let wire: [f64; 7] = node.placement.as_slice().try_into().map_err(|_| invalid())?;
    Placement::from_wire(&wire).ok_or_else(invalid)?;
    Ok(wire)
}

async fn store_placement(
    session: &dyn GraphSession,
    key: &str,
    wire: [f64; 7],
    db: &DbConfig,
) -> Result<Placement, SyncError> {
    if !session.update_placement(key, &wire).await? {
        return Err(part_not_found(key, db));
    }
    Placement::from_wire(&wire).ok_or_else(|| {
        SyncError::mapper(
            &db.database,
            MapperError::InvalidPlacement { key: key.to_string() },
        )
    })
}

fn part_not_found(key: &str, db: &DbConfig) -> SyncError {
    SyncError::PartNotFound {
        part: key.to_string(),
        location: format!("database '{}'", db.database),
    }
}

/// Pre-multiply the stored rotation; identity leaves the values untouched.
fn rotate_wire(mut wire: [f64; 7], rotation: DQuat) -> [f64; 7] {
    if rotation == DQuat::IDENTITY {
        return wire;
    }
    let current = DQuat::from_xyzw(wire[3], wire[4], wire[5], wire[6]).normalize();
    let rotated = (rotation * current).normalize();
    wire[3..].copy_from_slice(&[rotated.x, rotated.y, rotated.z, rotated.w]);
    wire
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_free_key_skips_used_segments() {
        assert_eq!(free_key("A", "B", &["A", "A/C"]), "A/B");
        assert_eq!(free_key("A", "B", &["A", "A/B", "A/B/x"]), "A/B[2]");
        assert_eq!(free_key("A", "B", &["A", "A/B", "A/B[2]"]), "A/B[3]");
        assert_eq!(free_key("A", "M6/20", &["A"]), "A/M6%2F20");
    }

    #[test]
    fn test_rotate_wire_identity_is_exact() {
        let wire = [1.0, 2.0, 3.0, 0.1, 0.2, 0.3, 0.9273618495495703];
        assert_eq!(rotate_wire(wire, DQuat::IDENTITY), wire);
    }

    #[test]
    fn test_rotate_wire_composes() {
        let quarter = DQuat::from_rotation_z(FRAC_PI_2);
        let wire = rotate_wire(rotate_wire(Placement::IDENTITY.to_wire(), quarter), quarter);
        assert_eq!(&wire[..3], &[0.0, 0.0, 0.0]);
        let half = DQuat::from_xyzw(wire[3], wire[4], wire[5], wire[6]);
        assert!(half.abs_diff_eq(DQuat::from_rotation_z(std::f64::consts::PI), 1e-12));
    }
}
