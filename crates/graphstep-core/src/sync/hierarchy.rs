//! Serializable view of a product tree.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::graph::schema::{join_key, sibling_segments};
use crate::graph::GraphMapper;
use crate::step::{NodeKind, Placement, ProductNode, StepDocument};

/// Placement as translation plus `[x, y, z, w]` rotation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlacementView {
    pub translation: [f64; 3],
    pub rotation: [f64; 4],
}

impl From<&Placement> for PlacementView {
    fn from(placement: &Placement) -> Self {
        let [tx, ty, tz, qx, qy, qz, qw] = placement.to_wire();
        Self {
            translation: [tx, ty, tz],
            rotation: [qx, qy, qz, qw],
        }
    }
}

/// One node of the hierarchy returned by `get_product_hierarchy`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductHierarchy {
    /// Path key; pass it to `move_part` / `rotate_part`.
    pub key: String,
    pub name: String,
    pub kind: NodeKind,
    pub placement: PlacementView,
    pub has_shape: bool,
    pub children: Vec<ProductHierarchy>,
}

impl ProductHierarchy {
    pub fn from_document(doc: &StepDocument) -> Self {
        Self::from_node(&doc.root, GraphMapper::root_key(doc))
    }

    fn from_node(node: &ProductNode, key: String) -> Self {
        let segments = sibling_segments(node.children.iter().map(|c| c.name.as_str()));
        let children = node
            .children
            .iter()
            .zip(segments)
            .map(|(child, segment)| Self::from_node(child, join_key(&key, &segment)))
            .collect();
        Self {
            key,
            name: node.name.clone(),
            kind: node.kind,
            placement: PlacementView::from(&node.placement),
            has_shape: node.shape.as_ref().is_some_and(|s| s.has_content()),
            children,
        }
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Self::node_count).sum::<usize>()
    }

    /// Find a node by path key.
    pub fn find(&self, key: &str) -> Option<&ProductHierarchy> {
        if self.key == key {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(key))
    }

    /// Indented text rendering, one node per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let [x, y, z] = self.placement.translation;
        let _ = writeln!(
            out,
            "{:indent$}{} [{}] at ({x}, {y}, {z}){}",
            "",
            self.name,
            self.kind,
            if self.has_shape { " +shape" } else { "" },
            indent = depth * 2
        );
        for child in &self.children {
            child.render_into(out, depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepHeader;

    fn doc() -> StepDocument {
        let mut root = ProductNode::new("A", NodeKind::Assembly);
        let mut b = ProductNode::new("B", NodeKind::Part);
        b.placement = Placement::new([10.0, 0.0, 0.0], None, None);
        root.children.push(b);
        root.children.push(ProductNode::new("C", NodeKind::Part));
        root.children.push(ProductNode::new("C", NodeKind::Part));
        StepDocument::new(StepHeader::default(), root)
    }

    #[test]
    fn test_keys_and_order() {
        let hierarchy = ProductHierarchy::from_document(&doc());
        let keys: Vec<_> = hierarchy.children.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["A/B", "A/C", "A/C[2]"]);
        assert_eq!(hierarchy.node_count(), 4);
        assert_eq!(hierarchy.find("A/B").unwrap().placement.translation, [10.0, 0.0, 0.0]);
        assert!(hierarchy.find("A/D").is_none());
    }

    #[test]
    fn test_json_shape() {
        let hierarchy = ProductHierarchy::from_document(&doc());
        let json = serde_json::to_value(&hierarchy).unwrap();
        assert_eq!(json["kind"], "assembly");
        assert_eq!(json["children"][0]["name"], "B");
        assert_eq!(json["children"][0]["placement"]["rotation"], serde_json::json!([0.0, 0.0, 0.0, 1.0]));
    }

    #[test]
    fn test_render() {
        let text = ProductHierarchy::from_document(&doc()).render();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "A [Assembly] at (0, 0, 0)");
        assert_eq!(lines[1], "  B [Part] at (10, 0, 0)");
    }
}
