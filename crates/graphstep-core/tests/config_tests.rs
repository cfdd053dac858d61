use graphstep_core::config::{
    ConfigError, DEFAULT_AVG_EDGE_BYTES, DEFAULT_AVG_NODE_BYTES, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_UPLOAD_BYTES_PER_SEC,
};
use graphstep_core::{Config, DbConfig};

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.client.max_attempts, DEFAULT_MAX_ATTEMPTS);
    assert_eq!(config.client.initial_backoff_ms, DEFAULT_INITIAL_BACKOFF_MS);
    assert_eq!(config.estimate.upload_bytes_per_sec, DEFAULT_UPLOAD_BYTES_PER_SEC);
    assert_eq!(config.estimate.avg_node_bytes, DEFAULT_AVG_NODE_BYTES);
}

#[test]
fn test_config_to_toml() {
    let toml_str = Config::default_config_string();
    assert!(toml_str.contains("[client]"));
    assert!(toml_str.contains("[estimate]"));
}

#[test]
fn test_config_from_toml() {
    let toml_str = r#"
[client]
max_attempts = 2

[estimate]
download_bytes_per_sec = 500.0
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.client.max_attempts, 2);
    assert_eq!(config.estimate.download_bytes_per_sec, 500.0);
    // Unset keys keep their defaults
    assert_eq!(config.client.initial_backoff_ms, DEFAULT_INITIAL_BACKOFF_MS);
    assert_eq!(config.estimate.avg_edge_bytes, DEFAULT_AVG_EDGE_BYTES);
}

#[test]
fn test_config_file_rejects_zero_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graphstep.toml");
    std::fs::write(&path, "[client]\nmax_attempts = 0\n").unwrap();
    let err = Config::from_file(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn test_config_file_missing() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::ReadError { .. }));
}

#[test]
fn test_db_config_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.json");
    std::fs::write(
        &path,
        r#"{"host": "http://db:7474/", "database": "cad", "user": {"name": "neo4j", "password": "pw"}, "extra": 1}"#,
    )
    .unwrap();

    let db = DbConfig::from_file(&path).unwrap();
    assert_eq!(db, DbConfig::new("http://db:7474/", "cad", "neo4j", "pw"));
    assert_eq!(db.base_url(), "http://db:7474");
}

#[test]
fn test_db_config_legacy_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.yaml");
    std::fs::write(
        &path,
        "host: http://localhost:7474\ndatabase_name: cad\ncredentials:\n  user: neo4j\n  password: pw\n",
    )
    .unwrap();

    let db = DbConfig::from_file(&path).unwrap();
    assert_eq!(db.database, "cad");
    assert_eq!(db.user.name, "neo4j");
    assert_eq!(db.user.password, "pw");
}

#[test]
fn test_db_config_empty_database() {
    let err = DbConfig::from_json(r#"{"host": "http://x", "database": " ", "user": {"name": "a", "password": "b"}}"#)
        .unwrap_err();
    assert!(err.to_string().contains("database must not be empty"));
}
