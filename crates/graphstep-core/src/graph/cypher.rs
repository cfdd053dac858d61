//! Cypher statements for the graph schema.

use serde::Serialize;
use serde_json::{json, Value};

use super::schema::{EdgeUpsert, MergePolicy, NodeUpsert, SubgraphUpsert, UpsertScope, KEY_SEPARATOR};
use crate::step::NodeKind;

/// A parameterised statement as sent to the transactional endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    pub statement: String,
    pub parameters: Value,
}

impl Statement {
    pub fn new(statement: impl Into<String>, parameters: Value) -> Self {
        Self {
            statement: statement.into(),
            parameters,
        }
    }
}

/// Trivial round trip used to verify credentials on connect.
pub fn verify() -> Statement {
    Statement::new("RETURN 1", json!({}))
}

/// Statements applying one [`SubgraphUpsert`]; meant for a single transaction.
pub fn upsert(upsert: &SubgraphUpsert) -> Vec<Statement> {
    let mut statements = stale_removal(upsert);

    for kind in [NodeKind::Assembly, NodeKind::Part] {
        for policy in [MergePolicy::Overwrite, MergePolicy::CreateOnly] {
            let rows: Vec<Value> = upsert
                .nodes
                .iter()
                .filter(|n| n.record.kind == kind && n.policy == policy)
                .map(node_row)
                .collect();
            if !rows.is_empty() {
                statements.push(Statement::new(merge_nodes(kind, policy), json!({ "rows": rows })));
            }
        }
    }

    if !upsert.shapes.is_empty() {
        statements.push(Statement::new(
            "UNWIND $rows AS row \
             MERGE (s:Shape {owner: row.owner}) \
             WITH s, row WHERE s.checksum IS NULL OR s.checksum <> row.checksum \
             SET s.representation = row.representation, s.representation_name = row.representation_name, \
             s.items = row.items, s.context = row.context, s.linked = row.linked, \
             s.data = row.data, s.checksum = row.checksum",
            json!({ "rows": upsert.shapes }),
        ));
    }

    let mut ordered = Vec::new();
    let mut owners = Vec::new();
    for edge in &upsert.edges {
        match edge {
            EdgeUpsert::Contains {
                parent,
                child,
                ordinal: Some(ordinal),
            } => ordered.push(json!({ "parent": parent, "child": child, "ordinal": ordinal })),
            EdgeUpsert::Contains {
                parent,
                child,
                ordinal: None,
            } => statements.push(append_child(parent, child)),
            EdgeUpsert::HasShape { owner } => owners.push(owner.as_str()),
        }
    }
    if !ordered.is_empty() {
        statements.push(Statement::new(
            "UNWIND $rows AS row \
             MATCH (p:Product {key: row.parent}) \
             MATCH (c:Product {key: row.child}) \
             MERGE (p)-[r:CONTAINS]->(c) \
             SET r.ordinal = row.ordinal",
            json!({ "rows": ordered }),
        ));
    }
    if !owners.is_empty() {
        statements.push(Statement::new(
            "UNWIND $owners AS owner \
             MATCH (n:Product {key: owner}) \
             MATCH (s:Shape {owner: owner}) \
             MERGE (n)-[:HAS_SHAPE]->(s)",
            json!({ "owners": owners }),
        ));
    }

    statements
}

fn stale_removal(upsert: &SubgraphUpsert) -> Vec<Statement> {
    let keys: Vec<&str> = upsert.nodes.iter().map(|n| n.record.key.as_str()).collect();
    let owners = upsert.shape_owners();

    match &upsert.scope {
        UpsertScope::Dataset => vec![
            Statement::new(
                "MATCH (n) \
                 WHERE NOT ((n:Product AND n.key IN $keys) OR (n:Shape AND n.owner IN $owners)) \
                 DETACH DELETE n",
                json!({ "keys": keys, "owners": owners }),
            ),
            Statement::new("MATCH (:Product)-[r:CONTAINS]->(:Product) DELETE r", json!({})),
        ],
        UpsertScope::Subtree(root) => {
            let prefix = format!("{root}{KEY_SEPARATOR}");
            vec![
                Statement::new(
                    "MATCH (n:Product) \
                     WHERE (n.key = $root OR n.key STARTS WITH $prefix) AND NOT n.key IN $keys \
                     DETACH DELETE n",
                    json!({ "root": root, "prefix": prefix, "keys": keys }),
                ),
                Statement::new(
                    "MATCH (s:Shape) \
                     WHERE (s.owner = $root OR s.owner STARTS WITH $prefix) AND NOT s.owner IN $owners \
                     DETACH DELETE s",
                    json!({ "root": root, "prefix": prefix, "owners": owners }),
                ),
                Statement::new(
                    "MATCH (p:Product)-[r:CONTAINS]->(:Product) \
                     WHERE p.key = $root OR p.key STARTS WITH $prefix \
                     DELETE r",
                    json!({ "root": root, "prefix": prefix }),
                ),
            ]
        }
    }
}

fn labels(kind: NodeKind) -> (&'static str, &'static str) {
    match kind {
        NodeKind::Assembly => ("Assembly", "Part"),
        NodeKind::Part => ("Part", "Assembly"),
    }
}

fn merge_nodes(kind: NodeKind, policy: MergePolicy) -> String {
    let (label, other) = labels(kind);
    match policy {
        MergePolicy::Overwrite => format!(
            "UNWIND $rows AS row \
             MERGE (n:Product {{key: row.key}}) \
             SET n.name = row.name, n.product_id = row.product_id, \
             n.description = row.description, n.placement = row.placement \
             SET n:{label} REMOVE n:{other}"
        ),
        MergePolicy::CreateOnly => format!(
            "UNWIND $rows AS row \
             MERGE (n:Product {{key: row.key}}) \
             ON CREATE SET n.name = row.name, n.product_id = row.product_id, \
             n.description = row.description, n.placement = row.placement, n:{label}"
        ),
    }
}

fn node_row(node: &NodeUpsert) -> Value {
    let record = &node.record;
    json!({
        "key": record.key,
        "name": record.name,
        "product_id": record.product_id,
        "description": record.description,
        "placement": record.placement,
    })
}

fn append_child(parent: &str, child: &str) -> Statement {
    Statement::new(
        "MATCH (p:Product {key: $parent}) \
         MATCH (c:Product {key: $child}) \
         OPTIONAL MATCH (p)-[o:CONTAINS]->(:Product) \
         WITH p, c, coalesce(max(o.ordinal), -1) + 1 AS next \
         MERGE (p)-[r:CONTAINS]->(c) \
         ON CREATE SET r.ordinal = next",
        json!({ "parent": parent, "child": child }),
    )
}

const NODE_COLUMNS: &str = "n.key, CASE WHEN n:Assembly THEN 'assembly' ELSE 'part' END, \
     n.name, n.product_id, n.description, n.placement";

/// Every product in the subtree (or dataset) with its ordered children and
/// shape, one row per node.
pub fn fetch_subtree(root: Option<&str>) -> Statement {
    let prefix = root.map(|r| format!("{r}{KEY_SEPARATOR}"));
    Statement::new(
        format!(
            "MATCH (n:Product) \
             WHERE $root IS NULL OR n.key = $root OR n.key STARTS WITH $prefix \
             OPTIONAL MATCH (n)-[r:CONTAINS]->(c:Product) \
             WITH n, collect(CASE WHEN c IS NULL THEN NULL ELSE {{key: c.key, ordinal: r.ordinal}} END) AS children \
             OPTIONAL MATCH (n)-[:HAS_SHAPE]->(s:Shape) \
             WITH n, children, head(collect(s {{.*}})) AS shape \
             RETURN {NODE_COLUMNS}, children, shape \
             ORDER BY n.key"
        ),
        json!({ "root": root, "prefix": prefix }),
    )
}

pub fn fetch_node(key: &str) -> Statement {
    Statement::new(
        format!("MATCH (n:Product {{key: $key}}) RETURN {NODE_COLUMNS}, [] AS children, null AS shape"),
        json!({ "key": key }),
    )
}

pub fn update_placement(key: &str, placement: &[f64; 7]) -> Statement {
    Statement::new(
        "MATCH (n:Product {key: $key}) SET n.placement = $placement RETURN count(n)",
        json!({ "key": key, "placement": placement }),
    )
}

/// Shapes owned by the subtree at `root`, then its product nodes. Both
/// return the number of deleted nodes and belong in one transaction.
pub fn delete_subtree(root: &str) -> [Statement; 2] {
    let parameters = json!({ "root": root, "prefix": format!("{root}{KEY_SEPARATOR}") });
    [
        Statement::new(
            "MATCH (s:Shape) WHERE s.owner = $root OR s.owner STARTS WITH $prefix \
             DETACH DELETE s RETURN count(s)",
            parameters.clone(),
        ),
        Statement::new(
            "MATCH (n:Product) WHERE n.key = $root OR n.key STARTS WITH $prefix \
             DETACH DELETE n RETURN count(n)",
            parameters,
        ),
    ]
}

pub fn count_nodes() -> Statement {
    Statement::new("MATCH (n) RETURN count(n)", json!({}))
}

pub fn count_edges() -> Statement {
    Statement::new("MATCH ()-[r]->() RETURN count(r)", json!({}))
}

pub fn delete_all() -> Statement {
    Statement::new("MATCH (n) DETACH DELETE n RETURN count(n)", json!({}))
}
