//! Neo4j client over the HTTP transactional endpoint.
//!
//! Each request is `POST {host}/db/{database}/tx/commit` carrying every
//! statement of one logical write, so a request is one atomic transaction.
//! Transient failures are retried with exponential backoff.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::cypher::{self, Statement};
use super::error::GraphError;
use super::schema::{ChildRef, GraphCounts, NodeRecord, RawNode, RawSubgraph, ShapeRecord, SubgraphUpsert};
use super::store::{GraphConnector, GraphSession};
use crate::config::{ClientConfig, DbConfig};
use crate::step::NodeKind;

/// Opens [`Neo4jSession`]s.
#[derive(Debug, Clone, Default)]
pub struct Neo4jConnector {
    config: ClientConfig,
}

impl Neo4jConnector {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl GraphConnector for Neo4jConnector {
    async fn connect(&self, db: &DbConfig) -> Result<Box<dyn GraphSession>, GraphError> {
        let client = Client::builder()
            .timeout(self.config.request_timeout())
            .connect_timeout(self.config.connect_timeout())
            .build()
            .map_err(|e| GraphError::Unavailable(e.to_string()))?;

        let session = Neo4jSession {
            client,
            url: format!("{}/db/{}/tx/commit", db.base_url(), db.database),
            db: db.clone(),
            config: self.config.clone(),
        };

        session.run(&[cypher::verify()]).await.map_err(|err| match err {
            GraphError::Persistence { message, .. } => GraphError::Unavailable(message),
            other => other,
        })?;

        info!(host = %db.host, database = %db.database, "Connected to graph store");
        Ok(Box::new(session))
    }
}

/// One database on one Neo4j server.
pub struct Neo4jSession {
    client: Client,
    url: String,
    db: DbConfig,
    config: ClientConfig,
}

impl Neo4jSession {
    /// Send with retries. Exhausted retries become `Persistence`.
    async fn run(&self, statements: &[Statement]) -> Result<Vec<TxResult>, GraphError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.send(statements).await {
                Err(err) if err.is_transient() => {
                    if attempt >= max_attempts {
                        return Err(GraphError::Persistence {
                            attempts: attempt,
                            message: err.to_string(),
                        });
                    }
                    let delay = self.config.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient graph store failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn send(&self, statements: &[Statement]) -> Result<Vec<TxResult>, GraphError> {
        debug!(statements = statements.len(), url = %self.url, "Committing transaction");

        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.db.user.name, Some(&self.db.user.password))
            .header("accept", "application/json")
            .json(&TxRequest { statements })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, error_text, &self.db));
        }

        let body: TxResponse = response
            .json()
            .await
            .map_err(|e| GraphError::Protocol(e.to_string()))?;

        if let Some(error) = body.errors.into_iter().next() {
            return Err(classify_error(&error.code, error.message, &self.db));
        }
        if body.results.len() != statements.len() {
            return Err(GraphError::Protocol(format!(
                "expected {} result(s), got {}",
                statements.len(),
                body.results.len()
            )));
        }
        Ok(body.results)
    }

    async fn single(&self, statement: Statement) -> Result<TxResult, GraphError> {
        self.run(&[statement])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GraphError::Protocol("empty result set".into()))
    }
}

#[async_trait]
impl GraphSession for Neo4jSession {
    async fn upsert_subtree(&self, upsert: &SubgraphUpsert) -> Result<usize, GraphError> {
        let statements = cypher::upsert(upsert);
        self.run(&statements).await?;
        debug!(records = upsert.len(), statements = statements.len(), "Upsert committed");
        Ok(upsert.len())
    }

    async fn fetch_subtree(&self, root: Option<&str>) -> Result<RawSubgraph, GraphError> {
        let result = self.single(cypher::fetch_subtree(root)).await?;
        let nodes = result
            .data
            .into_iter()
            .map(|row| parse_node_row(row.row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RawSubgraph { nodes })
    }

    async fn fetch_node(&self, key: &str) -> Result<Option<NodeRecord>, GraphError> {
        let result = self.single(cypher::fetch_node(key)).await?;
        match result.data.into_iter().next() {
            Some(row) => Ok(Some(parse_node_row(row.row)?.record)),
            None => Ok(None),
        }
    }

    async fn update_placement(&self, key: &str, placement: &[f64; 7]) -> Result<bool, GraphError> {
        let result = self.single(cypher::update_placement(key, placement)).await?;
        Ok(scalar(&result)? > 0)
    }

    async fn delete_subtree(&self, key: &str) -> Result<u64, GraphError> {
        let results = self.run(&cypher::delete_subtree(key)).await?;
        let deleted = scalar(&results[0])? + scalar(&results[1])?;
        debug!(key, deleted, "Deleted subtree");
        Ok(deleted)
    }

    async fn counts(&self) -> Result<GraphCounts, GraphError> {
        let results = self.run(&[cypher::count_nodes(), cypher::count_edges()]).await?;
        Ok(GraphCounts {
            nodes: scalar(&results[0])?,
            edges: scalar(&results[1])?,
        })
    }

    async fn delete_all(&self) -> Result<u64, GraphError> {
        let result = self.single(cypher::delete_all()).await?;
        let deleted = scalar(&result)?;
        info!(database = %self.db.database, deleted, "Deleted all nodes");
        Ok(deleted)
    }

    async fn close(&self) -> Result<(), GraphError> {
        // Auto-commit requests hold no server-side state.
        debug!(database = %self.db.database, "Session closed");
        Ok(())
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct TxRequest<'a> {
    statements: &'a [Statement],
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Debug, Deserialize)]
struct TxRow {
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    code: String,
    message: String,
}

type NodeRow = (
    String,
    NodeKind,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<Vec<f64>>,
    Vec<ChildRef>,
    Option<ShapeRecord>,
);

fn parse_node_row(row: Vec<Value>) -> Result<RawNode, GraphError> {
    let (key, kind, name, product_id, description, placement, children, shape): NodeRow =
        serde_json::from_value(Value::Array(row)).map_err(|e| GraphError::Protocol(format!("node row: {e}")))?;
    Ok(RawNode {
        record: NodeRecord {
            key,
            kind,
            name: name.unwrap_or_default(),
            product_id: product_id.unwrap_or_default(),
            description: description.unwrap_or_default(),
            placement: placement.unwrap_or_default(),
        },
        children,
        shape,
    })
}

fn scalar(result: &TxResult) -> Result<u64, GraphError> {
    result
        .data
        .first()
        .and_then(|row| row.row.first())
        .and_then(Value::as_u64)
        .ok_or_else(|| GraphError::Protocol("expected a single count".into()))
}

/// Map a non-success HTTP status.
fn classify_status(status: StatusCode, message: String, db: &DbConfig) -> GraphError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GraphError::Authentication {
            host: db.host.clone(),
            user: db.user.name.clone(),
            message,
        },
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => GraphError::Unavailable(format!("HTTP {status}: {message}")),
        _ => GraphError::Query {
            code: format!("HTTP {}", status.as_u16()),
            message,
        },
    }
}

/// Map a Neo4j status code such as `Neo.ClientError.Security.Unauthorized`.
fn classify_error(code: &str, message: String, db: &DbConfig) -> GraphError {
    if code.starts_with("Neo.ClientError.Security.") {
        GraphError::Authentication {
            host: db.host.clone(),
            user: db.user.name.clone(),
            message,
        }
    } else if code.starts_with("Neo.TransientError.") {
        GraphError::Unavailable(format!("{code}: {message}"))
    } else {
        GraphError::Query {
            code: code.to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> DbConfig {
        DbConfig::new("http://localhost:7474", "neo4j", "neo4j", "secret")
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, String::new(), &db()),
            GraphError::Authentication { .. }
        ));
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new(), &db()).is_transient());
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad".into(), &db()),
            GraphError::Query { .. }
        ));
    }

    #[test]
    fn test_classify_error() {
        let auth = classify_error("Neo.ClientError.Security.Unauthorized", "no".into(), &db());
        assert!(matches!(auth, GraphError::Authentication { ref user, .. } if user == "neo4j"));
        let transient = classify_error("Neo.TransientError.Transaction.DeadlockDetected", "retry".into(), &db());
        assert!(transient.is_transient());
        let syntax = classify_error("Neo.ClientError.Statement.SyntaxError", "oops".into(), &db());
        assert!(matches!(syntax, GraphError::Query { ref code, .. } if code.ends_with("SyntaxError")));
    }

    #[test]
    fn test_parse_node_row() {
        let row = vec![
            json!("A/B"),
            json!("part"),
            json!("B"),
            json!("B-001"),
            Value::Null,
            json!([1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 1]),
            json!([{ "key": "A/B/C", "ordinal": 0 }, { "key": "A/B/D" }]),
            json!({ "owner": "A/B", "representation": "SHAPE_REPRESENTATION", "data": "", "checksum": "x" }),
        ];
        let node = parse_node_row(row).unwrap();
        assert_eq!(node.record.kind, NodeKind::Part);
        assert_eq!(node.record.description, "");
        assert_eq!(node.record.placement[6], 1.0);
        assert_eq!(node.children[1].ordinal, None);
        let shape = node.shape.unwrap();
        assert!(shape.items.is_empty());
        assert_eq!(shape.context, None);
    }

    #[test]
    fn test_parse_node_row_rejects_unknown_kind() {
        let row = vec![
            json!("A"),
            json!("widget"),
            Value::Null,
            Value::Null,
            Value::Null,
            Value::Null,
            json!([]),
            Value::Null,
        ];
        assert!(matches!(parse_node_row(row), Err(GraphError::Protocol(_))));
    }
}
