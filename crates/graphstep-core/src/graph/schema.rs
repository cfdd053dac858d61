//! Persisted graph schema: labels, records and path keys.
//!
//! ```text
//! (:Product:Assembly {key, name, product_id, description, placement})
//!     -[:CONTAINS {ordinal}]->(:Product:Part {...})
//!     -[:HAS_SHAPE]->(:Shape {owner, representation, ..., data, checksum})
//! ```

use serde::{Deserialize, Serialize};

use crate::step::NodeKind;

/// Merge label shared by assemblies and parts.
pub const PRODUCT_LABEL: &str = "Product";
pub const ASSEMBLY_LABEL: &str = "Assembly";
pub const PART_LABEL: &str = "Part";
pub const SHAPE_LABEL: &str = "Shape";
pub const CONTAINS: &str = "CONTAINS";
pub const HAS_SHAPE: &str = "HAS_SHAPE";

/// Separator between key segments.
pub const KEY_SEPARATOR: char = '/';

/// Properties of an `Assembly` / `Part` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Path from the root, e.g. `montage-lasche/bracket-07`.
    pub key: String,
    pub kind: NodeKind,
    pub name: String,
    pub product_id: String,
    pub description: String,
    /// `[tx, ty, tz, qx, qy, qz, qw]`
    pub placement: Vec<f64>,
}

/// Properties of a `Shape` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeRecord {
    /// Key of the owning product node.
    pub owner: String,
    pub representation: String,
    #[serde(default)]
    pub representation_name: String,
    #[serde(default)]
    pub items: Vec<u64>,
    #[serde(default)]
    pub context: Option<u64>,
    #[serde(default)]
    pub linked: Vec<u64>,
    /// Payload entities as exchange-file instance text.
    pub data: String,
    /// SHA-256 of `data`, hex encoded.
    pub checksum: String,
}

/// How an upserted node treats an existing one with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Replace properties and labels.
    Overwrite,
    /// Create if absent; leave an existing node untouched.
    CreateOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUpsert {
    pub record: NodeRecord,
    pub policy: MergePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EdgeUpsert {
    /// `ordinal: None` appends after existing children and keeps the ordinal
    /// of an edge that already exists.
    Contains {
        parent: String,
        child: String,
        ordinal: Option<u32>,
    },
    HasShape { owner: String },
}

/// Region of the store an upsert replaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertScope {
    /// The whole database: anything not in the batch is removed.
    Dataset,
    /// Only the subtree rooted at this key.
    Subtree(String),
}

/// One atomic write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgraphUpsert {
    pub scope: UpsertScope,
    pub nodes: Vec<NodeUpsert>,
    pub shapes: Vec<ShapeRecord>,
    pub edges: Vec<EdgeUpsert>,
}

impl SubgraphUpsert {
    /// Number of records written by the batch.
    pub fn len(&self) -> usize {
        self.nodes.len() + self.shapes.len() + self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of the nodes that are overwritten (the upserted subtree proper).
    pub fn owned_keys(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.policy == MergePolicy::Overwrite)
            .map(|n| n.record.key.clone())
            .collect()
    }

    pub fn shape_owners(&self) -> Vec<String> {
        self.shapes.iter().map(|s| s.owner.clone()).collect()
    }
}

/// Ordered child reference as stored on a `CONTAINS` edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRef {
    pub key: String,
    /// Edges written by other tools may lack an ordinal; they sort last.
    #[serde(default)]
    pub ordinal: Option<i64>,
}

/// A node as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawNode {
    pub record: NodeRecord,
    pub children: Vec<ChildRef>,
    pub shape: Option<ShapeRecord>,
}

/// A consistent snapshot of (part of) the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSubgraph {
    pub nodes: Vec<RawNode>,
}

/// Size of the stored dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphCounts {
    pub nodes: u64,
    pub edges: u64,
}

// ============================================================================
// Path keys
// ============================================================================

/// Escape a product name for use as one key segment.
pub fn escape_segment(name: &str) -> String {
    name.replace('%', "%25").replace(KEY_SEPARATOR, "%2F")
}

/// Inverse of [`escape_segment`].
pub fn unescape_segment(segment: &str) -> String {
    segment.replace("%2F", "/").replace("%25", "%")
}

/// `parent/segment`, or just `segment` at the root.
pub fn join_key(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{parent}{KEY_SEPARATOR}{segment}")
    }
}

pub fn parent_key(key: &str) -> Option<&str> {
    key.rsplit_once(KEY_SEPARATOR).map(|(parent, _)| parent)
}

/// Key segments for siblings in structural order; repeated names become
/// `name[2]`, `name[3]`, ...
pub fn sibling_segments<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    names
        .into_iter()
        .map(|name| {
            let segment = escape_segment(name);
            let count = seen.entry(segment.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                segment
            } else {
                format!("{segment}[{count}]")
            }
        })
        .collect()
}

/// Product name encoded by the last segment of a key.
pub fn name_from_key(key: &str) -> String {
    let segment = key.rsplit(KEY_SEPARATOR).next().unwrap_or(key);
    let base = match segment.rfind('[') {
        Some(open) if segment.ends_with(']') && segment[open + 1..segment.len() - 1].parse::<u32>().is_ok() => {
            &segment[..open]
        }
        _ => segment,
    };
    unescape_segment(base)
}

/// Whether `key` is `root` or lies below it.
pub fn in_subtree(key: &str, root: &str) -> bool {
    key == root
        || key
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with(KEY_SEPARATOR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trip() {
        let name = "M6/20 100%";
        let escaped = escape_segment(name);
        assert_eq!(escaped, "M6%2F20 100%25");
        assert_eq!(unescape_segment(&escaped), name);
    }

    #[test]
    fn test_sibling_segments_disambiguate() {
        let segments = sibling_segments(["bolt", "nut", "bolt", "bolt"]);
        assert_eq!(segments, vec!["bolt", "nut", "bolt[2]", "bolt[3]"]);
    }

    #[test]
    fn test_key_helpers() {
        let key = join_key("montage-lasche", "bracket-07");
        assert_eq!(key, "montage-lasche/bracket-07");
        assert_eq!(parent_key(&key), Some("montage-lasche"));
        assert_eq!(parent_key("root"), None);
        assert_eq!(join_key("", "root"), "root");
    }

    #[test]
    fn test_name_from_key() {
        assert_eq!(name_from_key("a/bolt[2]"), "bolt");
        assert_eq!(name_from_key("a/M6%2F20"), "M6/20");
        assert_eq!(name_from_key("odd[x]"), "odd[x]");
    }

    #[test]
    fn test_in_subtree() {
        assert!(in_subtree("a/b", "a/b"));
        assert!(in_subtree("a/b/c", "a/b"));
        assert!(!in_subtree("a/bc", "a/b"));
        assert!(!in_subtree("a", "a/b"));
    }
}
