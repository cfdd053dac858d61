//! Conversion between [`StepDocument`] trees and graph records.

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::error::MapperError;
use super::schema::{
    escape_segment, join_key, name_from_key, parent_key, sibling_segments, EdgeUpsert, MergePolicy, NodeRecord, NodeUpsert,
    RawNode, RawSubgraph, ShapeRecord, SubgraphUpsert, UpsertScope, KEY_SEPARATOR,
};
use crate::step::parser::parse_instances;
use crate::step::writer::write_entity;
use crate::step::{EntityId, NodeKind, Placement, ProductNode, ShapePayload, StepDocument, StepHeader};

/// Stateless translator between documents and the persisted schema.
pub struct GraphMapper;

impl GraphMapper {
    /// Key of a document's root node.
    pub fn root_key(doc: &StepDocument) -> String {
        escape_segment(&doc.root.name)
    }

    /// Upserts for a whole document; the batch replaces the dataset.
    pub fn to_graph(doc: &StepDocument) -> SubgraphUpsert {
        let mut upsert = SubgraphUpsert {
            scope: UpsertScope::Dataset,
            nodes: Vec::new(),
            shapes: Vec::new(),
            edges: Vec::new(),
        };
        collect(&doc.root, &Self::root_key(doc), &mut upsert);
        debug!(
            nodes = upsert.nodes.len(),
            shapes = upsert.shapes.len(),
            edges = upsert.edges.len(),
            "mapped document to graph"
        );
        upsert
    }

    /// Upserts mounting `node` (and its subtree) at `key`.
    ///
    /// Ancestors named by the key's parent path are created as empty
    /// assemblies when missing and left alone otherwise. Only the mounted
    /// subtree is replaced.
    pub fn mount(node: &ProductNode, key: &str) -> SubgraphUpsert {
        let mut upsert = SubgraphUpsert {
            scope: UpsertScope::Subtree(key.to_string()),
            nodes: Vec::new(),
            shapes: Vec::new(),
            edges: Vec::new(),
        };

        let mut previous: Option<String> = None;
        if let Some(parent_path) = parent_key(key) {
            for segment in parent_path.split(KEY_SEPARATOR) {
                let ancestor = match &previous {
                    Some(parent) => join_key(parent, segment),
                    None => segment.to_string(),
                };
                let name = name_from_key(&ancestor);
                upsert.nodes.push(NodeUpsert {
                    record: NodeRecord {
                        key: ancestor.clone(),
                        kind: NodeKind::Assembly,
                        product_id: name.clone(),
                        name,
                        description: String::new(),
                        placement: Placement::IDENTITY.to_wire().to_vec(),
                    },
                    policy: MergePolicy::CreateOnly,
                });
                if let Some(parent) = previous.take() {
                    upsert.edges.push(EdgeUpsert::Contains {
                        parent,
                        child: ancestor.clone(),
                        ordinal: None,
                    });
                }
                previous = Some(ancestor);
            }
        }
        if let Some(parent) = previous {
            upsert.edges.push(EdgeUpsert::Contains {
                parent,
                child: key.to_string(),
                ordinal: None,
            });
        }

        collect(node, key, &mut upsert);
        upsert
    }

    /// Rebuild a document from a fetched subgraph.
    ///
    /// With `root = None` the unique node without an incoming `CONTAINS`
    /// edge is used. The returned document has an empty header.
    pub fn from_graph(root: Option<&str>, raw: &RawSubgraph) -> Result<StepDocument, MapperError> {
        let by_key: HashMap<&str, &RawNode> = raw.nodes.iter().map(|n| (n.record.key.as_str(), n)).collect();

        let root_key = match root {
            Some(root) => {
                if !by_key.contains_key(root) {
                    return Err(MapperError::DisconnectedRoot {
                        root: Some(root.to_string()),
                    });
                }
                root
            }
            None => find_root(raw)?,
        };

        let mut builder = TreeBuilder {
            by_key,
            visited: HashSet::new(),
        };
        let root = builder.node(root_key)?;
        Ok(StepDocument::new(StepHeader::default(), root))
    }

    /// Path keys of every node in pre-order, starting at `root_key`.
    pub fn keyed_nodes<'a>(root: &'a ProductNode, root_key: &str) -> Vec<(String, &'a ProductNode)> {
        let mut out = Vec::new();
        keyed(root, root_key.to_string(), &mut out);
        out
    }

    /// Locate a node by name, or by path relative to the root when `part`
    /// contains a `/`. First match in pre-order.
    pub fn find_part<'a>(doc: &'a StepDocument, part: &str) -> Option<(String, &'a ProductNode)> {
        let root_key = Self::root_key(doc);
        let nodes = Self::keyed_nodes(&doc.root, &root_key);
        if part.contains(KEY_SEPARATOR) {
            let absolute = join_key(&root_key, part);
            nodes.into_iter().find(|(key, _)| key == part || *key == absolute)
        } else {
            nodes.into_iter().find(|(_, node)| node.name == part)
        }
    }

    /// Payload as stored on a `Shape` node.
    pub fn shape_record(owner: &str, payload: &ShapePayload) -> ShapeRecord {
        let mut data = String::new();
        for entity in payload.entities.iter() {
            write_entity(&mut data, entity);
        }
        let checksum = checksum(&data);
        ShapeRecord {
            owner: owner.to_string(),
            representation: payload.representation.clone(),
            representation_name: payload.representation_name.clone(),
            items: payload.items.iter().map(|i| i.0).collect(),
            context: payload.context.map(|c| c.0),
            linked: payload.linked.iter().map(|i| i.0).collect(),
            data,
            checksum,
        }
    }

    /// Inverse of [`GraphMapper::shape_record`].
    pub fn payload(record: &ShapeRecord) -> Result<ShapePayload, MapperError> {
        if checksum(&record.data) != record.checksum {
            warn!(owner = %record.owner, "shape checksum mismatch; using stored data as is");
        }
        let entities = parse_instances(&record.data).map_err(|source| MapperError::Payload {
            key: record.owner.clone(),
            source,
        })?;
        Ok(ShapePayload {
            representation: record.representation.clone(),
            representation_name: record.representation_name.clone(),
            items: record.items.iter().map(|i| EntityId(*i)).collect(),
            context: record.context.map(EntityId),
            linked: record.linked.iter().map(|i| EntityId(*i)).collect(),
            entities,
        })
    }
}

/// SHA-256 of the payload text, hex encoded.
pub fn checksum(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

fn node_record(node: &ProductNode, key: &str) -> NodeRecord {
    NodeRecord {
        key: key.to_string(),
        kind: node.kind,
        name: node.name.clone(),
        product_id: node.product_id.clone(),
        description: node.description.clone(),
        placement: node.placement.to_wire().to_vec(),
    }
}

fn collect(node: &ProductNode, key: &str, upsert: &mut SubgraphUpsert) {
    upsert.nodes.push(NodeUpsert {
        record: node_record(node, key),
        policy: MergePolicy::Overwrite,
    });
    if let Some(payload) = node.shape.as_ref().filter(|p| p.has_content()) {
        upsert.shapes.push(GraphMapper::shape_record(key, payload));
        upsert.edges.push(EdgeUpsert::HasShape {
            owner: key.to_string(),
        });
    }

    let segments = sibling_segments(node.children.iter().map(|c| c.name.as_str()));
    for (ordinal, (child, segment)) in node.children.iter().zip(segments).enumerate() {
        let child_key = join_key(key, &segment);
        upsert.edges.push(EdgeUpsert::Contains {
            parent: key.to_string(),
            child: child_key.clone(),
            ordinal: Some(ordinal as u32),
        });
        collect(child, &child_key, upsert);
    }
}

fn keyed<'a>(node: &'a ProductNode, key: String, out: &mut Vec<(String, &'a ProductNode)>) {
    let segments = sibling_segments(node.children.iter().map(|c| c.name.as_str()));
    out.push((key.clone(), node));
    for (child, segment) in node.children.iter().zip(segments) {
        keyed(child, join_key(&key, &segment), out);
    }
}

fn find_root(raw: &RawSubgraph) -> Result<&str, MapperError> {
    if raw.nodes.is_empty() {
        return Err(MapperError::DisconnectedRoot { root: None });
    }
    let contained: HashSet<&str> = raw
        .nodes
        .iter()
        .flat_map(|n| n.children.iter().map(|c| c.key.as_str()))
        .collect();
    let mut roots: Vec<&str> = raw
        .nodes
        .iter()
        .map(|n| n.record.key.as_str())
        .filter(|key| !contained.contains(key))
        .collect();
    match roots.len() {
        1 => Ok(roots[0]),
        // Every node has a parent: the edges form a cycle.
        0 => Err(MapperError::CycleDetected {
            key: raw.nodes[0].record.key.clone(),
        }),
        _ => {
            roots.sort_unstable();
            Err(MapperError::MultipleRoots(roots.into_iter().map(String::from).collect()))
        }
    }
}

struct TreeBuilder<'a> {
    by_key: HashMap<&'a str, &'a RawNode>,
    visited: HashSet<String>,
}

impl<'a> TreeBuilder<'a> {
    fn node(&mut self, key: &str) -> Result<ProductNode, MapperError> {
        if !self.visited.insert(key.to_string()) {
            return Err(MapperError::CycleDetected { key: key.to_string() });
        }
        let raw = self
            .by_key
            .get(key)
            .copied()
            .ok_or_else(|| MapperError::DisconnectedRoot {
                root: Some(key.to_string()),
            })?;
        let record = &raw.record;

        let placement = Placement::from_wire(&record.placement)
            .filter(|_| record.placement.iter().all(|v| v.is_finite()))
            .ok_or_else(|| MapperError::InvalidPlacement { key: key.to_string() })?;

        let shape = raw.shape.as_ref().map(GraphMapper::payload).transpose()?;

        let mut ordered: Vec<_> = raw.children.iter().collect();
        ordered.sort_by(|a, b| {
            a.ordinal
                .unwrap_or(i64::MAX)
                .cmp(&b.ordinal.unwrap_or(i64::MAX))
                .then_with(|| a.key.cmp(&b.key))
        });

        let mut children = Vec::with_capacity(ordered.len());
        for child in ordered {
            if !self.by_key.contains_key(child.key.as_str()) {
                return Err(MapperError::MissingNode {
                    parent: key.to_string(),
                    child: child.key.clone(),
                });
            }
            children.push(self.node(&child.key)?);
        }

        Ok(ProductNode {
            product_id: record.product_id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            kind: record.kind,
            placement,
            shape,
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::schema::ChildRef;

    fn doc() -> StepDocument {
        let mut root = ProductNode::new("A", NodeKind::Assembly);
        let mut b = ProductNode::new("B", NodeKind::Part);
        b.shape = Some(ShapePayload {
            items: vec![EntityId(6)],
            ..ShapePayload::default_context()
        });
        b.shape.as_mut().unwrap().entities.insert(crate::step::Entity::simple(
            EntityId(6),
            crate::step::Record::new(
                "CARTESIAN_POINT",
                vec![crate::step::Value::String(String::new()), crate::step::Value::List(vec![])],
            ),
        ));
        root.children.push(b);
        root.children.push(ProductNode::new("C", NodeKind::Part));
        root.children.push(ProductNode::new("C", NodeKind::Part));
        StepDocument::new(StepHeader::default(), root)
    }

    fn raw(key: &str, children: &[(&str, i64)]) -> RawNode {
        RawNode {
            record: NodeRecord {
                key: key.into(),
                kind: if children.is_empty() { NodeKind::Part } else { NodeKind::Assembly },
                name: name_from_key(key),
                product_id: name_from_key(key),
                description: String::new(),
                placement: Placement::IDENTITY.to_wire().to_vec(),
            },
            children: children
                .iter()
                .map(|(k, o)| ChildRef {
                    key: k.to_string(),
                    ordinal: Some(*o),
                })
                .collect(),
            shape: None,
        }
    }

    #[test]
    fn test_to_graph_keys_and_edges() {
        let upsert = GraphMapper::to_graph(&doc());
        assert_eq!(upsert.scope, UpsertScope::Dataset);
        let keys: Vec<_> = upsert.nodes.iter().map(|n| n.record.key.as_str()).collect();
        assert_eq!(keys, vec!["A", "A/B", "A/C", "A/C[2]"]);
        assert_eq!(upsert.shapes.len(), 1);
        assert_eq!(upsert.shapes[0].owner, "A/B");
        assert!(upsert.edges.contains(&EdgeUpsert::Contains {
            parent: "A".into(),
            child: "A/C[2]".into(),
            ordinal: Some(2),
        }));
        assert!(upsert.edges.contains(&EdgeUpsert::HasShape { owner: "A/B".into() }));
    }

    #[test]
    fn test_mount_creates_ancestors_create_only() {
        let part = ProductNode::new("bolt", NodeKind::Part);
        let upsert = GraphMapper::mount(&part, "A/sub/bolt");
        assert_eq!(upsert.scope, UpsertScope::Subtree("A/sub/bolt".into()));
        let policies: Vec<_> = upsert.nodes.iter().map(|n| (n.record.key.as_str(), n.policy)).collect();
        assert_eq!(
            policies,
            vec![
                ("A", MergePolicy::CreateOnly),
                ("A/sub", MergePolicy::CreateOnly),
                ("A/sub/bolt", MergePolicy::Overwrite),
            ]
        );
        assert_eq!(
            upsert.edges,
            vec![
                EdgeUpsert::Contains {
                    parent: "A".into(),
                    child: "A/sub".into(),
                    ordinal: None
                },
                EdgeUpsert::Contains {
                    parent: "A/sub".into(),
                    child: "A/sub/bolt".into(),
                    ordinal: None
                },
            ]
        );
    }

    #[test]
    fn test_round_trip_through_records() {
        let original = doc();
        let upsert = GraphMapper::to_graph(&original);
        let shapes: HashMap<_, _> = upsert.shapes.iter().map(|s| (s.owner.clone(), s.clone())).collect();
        let mut nodes = Vec::new();
        for n in &upsert.nodes {
            let children = upsert
                .edges
                .iter()
                .filter_map(|e| match e {
                    EdgeUpsert::Contains { parent, child, ordinal } if *parent == n.record.key => Some(ChildRef {
                        key: child.clone(),
                        ordinal: ordinal.map(i64::from),
                    }),
                    _ => None,
                })
                .collect();
            nodes.push(RawNode {
                record: n.record.clone(),
                children,
                shape: shapes.get(&n.record.key).cloned(),
            });
        }
        // Reverse to prove ordering comes from ordinals, not fetch order.
        nodes.reverse();

        let rebuilt = GraphMapper::from_graph(None, &RawSubgraph { nodes }).unwrap();
        assert_eq!(rebuilt.root, original.root);
    }

    #[test]
    fn test_from_graph_orders_by_ordinal() {
        let subgraph = RawSubgraph {
            nodes: vec![raw("A", &[("A/C", 1), ("A/B", 0)]), raw("A/C", &[]), raw("A/B", &[])],
        };
        let doc = GraphMapper::from_graph(None, &subgraph).unwrap();
        let names: Vec<_> = doc.root.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["B", "C"]);
    }

    #[test]
    fn test_from_graph_empty_is_disconnected() {
        let err = GraphMapper::from_graph(None, &RawSubgraph::default()).unwrap_err();
        assert!(matches!(err, MapperError::DisconnectedRoot { root: None }));

        let subgraph = RawSubgraph {
            nodes: vec![raw("A", &[])],
        };
        let err = GraphMapper::from_graph(Some("X"), &subgraph).unwrap_err();
        assert!(matches!(err, MapperError::DisconnectedRoot { root: Some(_) }));
    }

    #[test]
    fn test_from_graph_detects_cycle() {
        let subgraph = RawSubgraph {
            nodes: vec![raw("A", &[("A/B", 0)]), raw("A/B", &[("A", 0)])],
        };
        let err = GraphMapper::from_graph(None, &subgraph).unwrap_err();
        assert!(matches!(err, MapperError::CycleDetected { .. }));

        let subgraph = RawSubgraph {
            nodes: vec![
                raw("R", &[("R/A", 0)]),
                raw("R/A", &[("R/B", 0)]),
                raw("R/B", &[("R/A", 0)]),
            ],
        };
        let err = GraphMapper::from_graph(None, &subgraph).unwrap_err();
        assert!(matches!(err, MapperError::CycleDetected { key } if key == "R/A"));
    }

    #[test]
    fn test_from_graph_multiple_roots() {
        let subgraph = RawSubgraph {
            nodes: vec![raw("B", &[]), raw("A", &[])],
        };
        let err = GraphMapper::from_graph(None, &subgraph).unwrap_err();
        assert!(matches!(err, MapperError::MultipleRoots(roots) if roots == vec!["A", "B"]));
    }

    #[test]
    fn test_find_part() {
        let doc = doc();
        let (key, node) = GraphMapper::find_part(&doc, "C").unwrap();
        assert_eq!(key, "A/C");
        assert_eq!(node.name, "C");
        let (key, _) = GraphMapper::find_part(&doc, "A/C[2]").unwrap();
        assert_eq!(key, "A/C[2]");
        assert!(GraphMapper::find_part(&doc, "Z").is_none());
    }

    #[test]
    fn test_mount_at_root_has_no_ancestors() {
        let upsert = GraphMapper::mount(&doc().root, "A");
        assert_eq!(upsert.scope, UpsertScope::Subtree("A".into()));
        assert!(upsert.nodes.iter().all(|n| n.policy == MergePolicy::Overwrite));
        assert!(!upsert.edges.iter().any(|e| matches!(e, EdgeUpsert::Contains { ordinal: None, .. })));
    }
}
