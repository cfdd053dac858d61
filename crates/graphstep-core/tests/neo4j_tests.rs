//! Neo4j client against a scripted HTTP server.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use graphstep_core::config::ClientConfig;
use graphstep_core::graph::{cypher, GraphConnector, GraphError, GraphMapper, Neo4jConnector};
use graphstep_core::step::NodeKind;
use graphstep_core::{Config, DbConfig, StepCodec, SyncEngine};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const ASSEMBLY: &str = include_str!("fixtures/assembly.stp");

/// One captured request: lowercased head and raw body.
#[derive(Debug, Clone)]
struct Captured {
    head: String,
    body: Value,
}

struct MockServer {
    host: String,
    requests: Arc<Mutex<Vec<Captured>>>,
}

impl MockServer {
    /// Answer requests with `responses` in order; the last one repeats.
    async fn start(responses: Vec<(u16, Value)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let mut script: VecDeque<(u16, Value)> = responses.into();

        let captured = requests.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let Some(request) = read_request(&mut stream).await else {
                    continue;
                };
                captured.lock().unwrap().push(request);
                let (status, body) = if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    script.front().cloned().unwrap()
                };
                let body = body.to_string();
                let response = format!(
                    "HTTP/1.1 {status} Mock\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        Self { host, requests }
    }

    fn db(&self) -> DbConfig {
        DbConfig::new(&self.host, "neo4j", "neo4j", "secret")
    }

    fn requests(&self) -> Vec<Captured> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<Captured> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= end + 4 + length {
            let body = serde_json::from_slice(&buf[end + 4..end + 4 + length]).unwrap_or(Value::Null);
            return Some(Captured { head, body });
        }
    }
}

fn results(n: usize) -> Value {
    json!({ "results": vec![json!({ "columns": [], "data": [] }); n], "errors": [] })
}

fn verified() -> (u16, Value) {
    (200, json!({ "results": [{ "columns": ["1"], "data": [{ "row": [1] }] }], "errors": [] }))
}

fn fast_retries(max_attempts: u32) -> ClientConfig {
    ClientConfig {
        max_attempts,
        initial_backoff_ms: 1,
        max_backoff_ms: 1,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn test_connect_posts_with_basic_auth() {
    let server = MockServer::start(vec![verified()]).await;
    let session = Neo4jConnector::default().connect(&server.db()).await.unwrap();
    session.close().await.unwrap();

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].head.starts_with("post /db/neo4j/tx/commit http/1.1"));
    assert!(requests[0].head.contains("authorization: basic bmvvngo6c2vjcmv0"));
    assert_eq!(requests[0].body["statements"][0]["statement"], "RETURN 1");
}

#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    let server = MockServer::start(vec![(401, json!({ "errors": [] }))]).await;
    let err = Neo4jConnector::new(fast_retries(3)).connect(&server.db()).await.err().unwrap();
    assert!(matches!(err, GraphError::Authentication { ref user, .. } if user == "neo4j"));
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn test_transient_status_is_retried() {
    let unavailable = (503, json!({}));
    let server = MockServer::start(vec![unavailable.clone(), unavailable, verified()]).await;
    Neo4jConnector::new(fast_retries(3)).connect(&server.db()).await.unwrap();
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_on_connect() {
    let server = MockServer::start(vec![(503, json!({}))]).await;
    let err = Neo4jConnector::new(fast_retries(2)).connect(&server.db()).await.err().unwrap();
    assert!(matches!(err, GraphError::Unavailable(_)), "{err}");
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test]
async fn test_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let db = DbConfig::new(host, "neo4j", "neo4j", "secret");
    let err = Neo4jConnector::new(fast_retries(1)).connect(&db).await.err().unwrap();
    assert!(matches!(err, GraphError::Unavailable(_)), "{err}");
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let syntax = json!({
        "results": [],
        "errors": [{ "code": "Neo.ClientError.Statement.SyntaxError", "message": "bad input" }]
    });
    let server = MockServer::start(vec![verified(), (200, syntax)]).await;
    let session = Neo4jConnector::new(fast_retries(3)).connect(&server.db()).await.unwrap();

    let err = session.counts().await.unwrap_err();
    assert!(matches!(err, GraphError::Query { ref code, .. } if code == "Neo.ClientError.Statement.SyntaxError"));
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test]
async fn test_transient_error_code_is_retried() {
    let deadlock = json!({
        "results": [],
        "errors": [{ "code": "Neo.TransientError.Transaction.DeadlockDetected", "message": "retry" }]
    });
    let counts = json!({
        "results": [{ "data": [{ "row": [4] }] }, { "data": [{ "row": [3] }] }],
        "errors": []
    });
    let server = MockServer::start(vec![verified(), (200, deadlock), (200, counts)]).await;
    let session = Neo4jConnector::new(fast_retries(3)).connect(&server.db()).await.unwrap();

    let counts = session.counts().await.unwrap();
    assert_eq!((counts.nodes, counts.edges), (4, 3));
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn test_fetch_subtree_rows() {
    let rows = json!({
        "results": [{
            "columns": ["key", "kind", "name", "product_id", "description", "placement", "children", "shape"],
            "data": [
                { "row": ["A", "assembly", "A", "A", null, [0, 0, 0, 0, 0, 0, 1], [{ "key": "A/B", "ordinal": 0 }], null] },
                { "row": ["A/B", "part", "B", "B", "bracket", [10, 0, 0, 0, 0, 0, 1], [], null] }
            ]
        }],
        "errors": []
    });
    let server = MockServer::start(vec![verified(), (200, rows)]).await;
    let session = Neo4jConnector::default().connect(&server.db()).await.unwrap();

    let raw = session.fetch_subtree(None).await.unwrap();
    assert_eq!(raw.nodes.len(), 2);
    assert_eq!(raw.nodes[0].record.kind, NodeKind::Assembly);
    assert_eq!(raw.nodes[0].record.description, "");
    assert_eq!(raw.nodes[0].children[0].key, "A/B");

    let doc = GraphMapper::from_graph(None, &raw).unwrap();
    assert_eq!(doc.root.name, "A");
    assert_eq!(doc.root.children[0].description, "bracket");
    assert_eq!(doc.root.children[0].placement.translation().x, 10.0);

    let fetch = &server.requests()[1].body["statements"][0];
    assert_eq!(fetch["parameters"]["root"], Value::Null);
}

#[tokio::test]
async fn test_push_commits_one_transaction() {
    let doc = StepCodec::parse(ASSEMBLY).unwrap();
    let statements = cypher::upsert(&GraphMapper::to_graph(&doc)).len();
    let server = MockServer::start(vec![verified(), (200, results(statements))]).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("assembly.stp");
    std::fs::write(&path, ASSEMBLY).unwrap();

    let engine = SyncEngine::new(Neo4jConnector::new(fast_retries(1)), Config::default());
    let written = engine.push_file(&path, &server.db()).await.unwrap();
    assert_eq!(written, GraphMapper::to_graph(&doc).len());

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    let sent = requests[1].body["statements"].as_array().unwrap();
    assert_eq!(sent.len(), statements);
    assert!(sent.iter().any(|s| s["statement"].as_str().unwrap().contains("MERGE")));
}

#[tokio::test]
async fn test_result_count_mismatch_is_protocol_error() {
    let server = MockServer::start(vec![verified(), (200, results(1))]).await;
    let session = Neo4jConnector::default().connect(&server.db()).await.unwrap();
    let err = session.counts().await.unwrap_err();
    assert!(matches!(err, GraphError::Protocol(_)));
}
