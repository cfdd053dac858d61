//! In-memory assembly model.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{Entity, EntityBody, EntityId, EntityTable, Record, Value};
use super::error::StepError;
use super::placement::Placement;

/// Schema identifier written into generated headers.
pub const DEFAULT_SCHEMA: &str = "AUTOMOTIVE_DESIGN { 1 0 10303 214 1 1 1 1 }";

/// Whether a node is composite or a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Assembly,
    Part,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Assembly => "Assembly",
            NodeKind::Part => "Part",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque geometry owned by a node.
///
/// The entities are the closure of everything the node's shape
/// representation points at beyond the assembly structure, renumbered from
/// `#1` in original file order. `items`, `context` and `linked` refer to
/// those local ids.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapePayload {
    /// Keyword of the owning representation, e.g. `SHAPE_REPRESENTATION`.
    pub representation: String,
    pub representation_name: String,
    /// Geometric items held directly by the representation.
    pub items: Vec<EntityId>,
    /// Representation context (units, uncertainty).
    pub context: Option<EntityId>,
    /// Representations attached through `SHAPE_REPRESENTATION_RELATIONSHIP`.
    pub linked: Vec<EntityId>,
    pub entities: EntityTable,
}

impl ShapePayload {
    /// Empty representation in millimetres and radians.
    pub fn default_context() -> Self {
        let unit = |id: u64, records: Vec<Record>| Entity {
            id: EntityId(id),
            body: EntityBody::Complex(records),
        };
        let named = || Record::new("NAMED_UNIT", vec![Value::Derived]);
        let si = |prefix: Option<&str>, name: &str| {
            Record::new(
                "SI_UNIT",
                vec![
                    prefix.map_or(Value::Unset, |p| Value::Enumeration(p.into())),
                    Value::Enumeration(name.into()),
                ],
            )
        };

        let entities: EntityTable = [
            unit(1, vec![Record::new("LENGTH_UNIT", vec![]), named(), si(Some("MILLI"), "METRE")]),
            unit(2, vec![named(), Record::new("PLANE_ANGLE_UNIT", vec![]), si(None, "RADIAN")]),
            unit(3, vec![named(), si(None, "STERADIAN"), Record::new("SOLID_ANGLE_UNIT", vec![])]),
            Entity::simple(
                EntityId(4),
                Record::new(
                    "UNCERTAINTY_MEASURE_WITH_UNIT",
                    vec![
                        Value::Typed {
                            keyword: "LENGTH_MEASURE".into(),
                            value: Box::new(Value::Real(1.0e-7)),
                        },
                        Value::Reference(EntityId(1)),
                        Value::String("distance_accuracy_value".into()),
                        Value::String("confusion accuracy".into()),
                    ],
                ),
            ),
            unit(
                5,
                vec![
                    Record::new("GEOMETRIC_REPRESENTATION_CONTEXT", vec![Value::Integer(3)]),
                    Record::new(
                        "GLOBAL_UNCERTAINTY_ASSIGNED_CONTEXT",
                        vec![Value::List(vec![Value::Reference(EntityId(4))])],
                    ),
                    Record::new(
                        "GLOBAL_UNIT_ASSIGNED_CONTEXT",
                        vec![Value::List(vec![
                            Value::Reference(EntityId(1)),
                            Value::Reference(EntityId(2)),
                            Value::Reference(EntityId(3)),
                        ])],
                    ),
                    Record::new(
                        "REPRESENTATION_CONTEXT",
                        vec![
                            Value::String("Context #1".into()),
                            Value::String("3D Context with UNIT and UNCERTAINTY".into()),
                        ],
                    ),
                ],
            ),
        ]
        .into_iter()
        .collect();

        Self {
            representation: "SHAPE_REPRESENTATION".into(),
            representation_name: String::new(),
            items: Vec::new(),
            context: Some(EntityId(5)),
            linked: Vec::new(),
            entities,
        }
    }

    /// True when the payload holds more than a bare representation context:
    /// geometry items, linked representations, or entities attached on their
    /// own such as styling.
    pub fn has_content(&self) -> bool {
        if !self.items.is_empty() || !self.linked.is_empty() {
            return true;
        }
        let mut reached = HashSet::new();
        let mut stack: Vec<EntityId> = self.context.into_iter().collect();
        while let Some(id) = stack.pop() {
            if reached.insert(id) {
                stack.extend(self.entities.get(id).map(Entity::references).unwrap_or_default());
            }
        }
        self.entities.iter().any(|e| !reached.contains(&e.id))
    }
}

/// One node of the product structure.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductNode {
    /// `PRODUCT.id`
    pub product_id: String,
    /// `PRODUCT.name`, falling back to the id when empty.
    pub name: String,
    pub description: String,
    pub kind: NodeKind,
    /// Placement relative to the parent; identity for the root.
    pub placement: Placement,
    pub shape: Option<ShapePayload>,
    pub children: Vec<ProductNode>,
}

impl ProductNode {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        let name = name.into();
        Self {
            product_id: name.clone(),
            name,
            description: String::new(),
            kind,
            placement: Placement::IDENTITY,
            shape: None,
            children: Vec::new(),
        }
    }

    pub fn is_assembly(&self) -> bool {
        self.kind == NodeKind::Assembly
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(ProductNode::node_count).sum::<usize>()
    }

    /// Visit the subtree in pre-order.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a ProductNode)) {
        f(self);
        for child in &self.children {
            child.walk(f);
        }
    }

    /// First node in pre-order with the given name.
    pub fn find_by_name(&self, name: &str) -> Option<&ProductNode> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_by_name(name))
    }
}

/// Header section records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepHeader {
    pub records: Vec<Record>,
}

impl StepHeader {
    /// Minimal AP214 header for files produced from the graph.
    pub fn generated(file_name: &str, timestamp: DateTime<Utc>) -> Self {
        let s = |v: &str| Value::String(v.to_string());
        let system = format!("graphstep {}", env!("CARGO_PKG_VERSION"));
        Self {
            records: vec![
                Record::new(
                    "FILE_DESCRIPTION",
                    vec![Value::List(vec![s("graphstep export")]), s("2;1")],
                ),
                Record::new(
                    "FILE_NAME",
                    vec![
                        s(file_name),
                        s(&timestamp.format("%Y-%m-%dT%H:%M:%S").to_string()),
                        Value::List(vec![s("")]),
                        Value::List(vec![s("")]),
                        s(&system),
                        s("graphstep"),
                        s(""),
                    ],
                ),
                Record::new("FILE_SCHEMA", vec![Value::List(vec![s(DEFAULT_SCHEMA)])]),
            ],
        }
    }

    /// `FILE_NAME.name`, if present.
    pub fn file_name(&self) -> Option<&str> {
        self.records
            .iter()
            .find(|r| r.keyword == "FILE_NAME")
            .and_then(|r| r.string(0))
    }
}

/// A parsed or reconstructed assembly.
#[derive(Debug, PartialEq)]
pub struct StepDocument {
    pub header: StepHeader,
    pub root: ProductNode,
    /// Non-fatal diagnostics collected while parsing.
    pub warnings: Vec<StepError>,
}

impl StepDocument {
    pub fn new(header: StepHeader, root: ProductNode) -> Self {
        Self {
            header,
            root,
            warnings: Vec::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }

    pub fn part_count(&self) -> usize {
        let mut count = 0;
        self.root.walk(&mut |n| {
            if n.kind == NodeKind::Part {
                count += 1;
            }
        });
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProductNode {
        let mut root = ProductNode::new("root", NodeKind::Assembly);
        let mut sub = ProductNode::new("sub", NodeKind::Assembly);
        sub.children.push(ProductNode::new("bolt", NodeKind::Part));
        root.children.push(ProductNode::new("plate", NodeKind::Part));
        root.children.push(sub);
        root
    }

    #[test]
    fn test_walk_is_pre_order() {
        let root = sample();
        let mut names = Vec::new();
        root.walk(&mut |n| names.push(n.name.clone()));
        assert_eq!(names, vec!["root", "plate", "sub", "bolt"]);
        assert_eq!(root.node_count(), 4);
    }

    #[test]
    fn test_find_by_name() {
        let root = sample();
        assert_eq!(root.find_by_name("bolt").map(|n| n.kind), Some(NodeKind::Part));
        assert!(root.find_by_name("missing").is_none());
    }

    #[test]
    fn test_default_context_has_no_geometry() {
        let payload = ShapePayload::default_context();
        assert!(!payload.has_content());
        assert_eq!(payload.entities.len(), 5);
        assert!(payload.entities.get(EntityId(5)).unwrap().is("GEOMETRIC_REPRESENTATION_CONTEXT"));
    }

    #[test]
    fn test_unreferenced_entity_counts_as_content() {
        let mut payload = ShapePayload::default_context();
        payload.entities.insert(Entity::simple(
            EntityId(6),
            Record::new(
                "COLOUR_RGB",
                vec![Value::String(String::new()), Value::Real(1.0), Value::Real(0.0), Value::Real(0.0)],
            ),
        ));
        assert!(payload.has_content());
    }

    #[test]
    fn test_generated_header() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T12:30:00Z").unwrap().with_timezone(&Utc);
        let header = StepHeader::generated("out.stp", ts);
        assert_eq!(header.file_name(), Some("out.stp"));
        assert_eq!(header.records[1].string(1), Some("2024-05-01T12:30:00"));
    }
}
