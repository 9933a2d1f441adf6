use std::fs;
use std::sync::Arc;

use serde_json::json;
use tabula_engine::connectors::{MockConnector, SourceDescriptor, SourceFormat};
use tabula_engine::engine::{Backend, EngineBuilder, RouteRequest, TabulaEngine, TransformSpec};
use tabula_engine::utils::{
    config::EngineConfig,
    error::{QueryError, RouterError, TabulaError},
    types::Value,
};
use tempfile::TempDir;

fn engine() -> TabulaEngine {
    EngineBuilder::new()
        .with_relational(Arc::new(MockConnector::new()))
        .build()
        .expect("engine")
}

#[tokio::test]
async fn test_embedded_backend_over_csv_file() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("orders.csv");
    fs::write(&path, "category,amount\nA,10\nB,20\nA,30\nC,\n").expect("write csv");

    let request = RouteRequest {
        backend: Backend::Embedded,
        sql: "SELECT category, AVG(amount) AS mean_amount FROM df WHERE amount IS NOT NULL \
              GROUP BY category ORDER BY category"
            .to_string(),
        source: Some(SourceDescriptor::file(&path, SourceFormat::Csv)),
        ..Default::default()
    };
    let rows = engine().execute(&request).await.expect("execute");

    assert_eq!(rows.columns, vec!["category".to_string(), "mean_amount".to_string()]);
    assert_eq!(
        rows.rows,
        vec![
            vec![Value::Text("A".to_string()), Value::Float(20.0)],
            vec![Value::Text("B".to_string()), Value::Float(20.0)],
        ]
    );
}

#[tokio::test]
async fn test_embedded_backend_without_source() {
    let request = RouteRequest {
        backend: Backend::Embedded,
        sql: "SELECT * FROM df".to_string(),
        ..Default::default()
    };

    let result = engine().execute(&request).await;
    assert!(matches!(result, Err(TabulaError::Router(RouterError::MissingSource))));
}

#[tokio::test]
async fn test_embedded_backend_rejects_unknown_table() {
    let request = RouteRequest {
        backend: Backend::Embedded,
        sql: "SELECT * FROM orders".to_string(),
        source: Some(SourceDescriptor::mock("users")),
        ..Default::default()
    };

    let result = engine().execute(&request).await;
    assert!(matches!(result, Err(TabulaError::Query(QueryError::UnknownTable(_)))));
}

#[tokio::test]
async fn test_relational_backend() {
    let request: RouteRequest = serde_json::from_value(json!({
        "engine": "postgres",
        "sql": "SELECT id, age FROM users WHERE active ORDER BY age DESC"
    }))
    .expect("request");

    let rows = engine().execute(&request).await.expect("execute");
    assert_eq!(rows.rows, vec![vec![Value::Integer(1), Value::Integer(30)], vec![Value::Integer(2), Value::Integer(25)]]);
}

#[tokio::test]
async fn test_relational_backend_requires_configuration() {
    let engine = TabulaEngine::new(EngineConfig::default()).expect("engine");
    let request = RouteRequest {
        sql: "SELECT 1".to_string(),
        ..Default::default()
    };

    let result = engine.execute(&request).await;
    assert!(matches!(result, Err(TabulaError::Router(RouterError::BackendUnavailable(_)))));
}

#[tokio::test]
async fn test_transform_backend_groups_after_fill() {
    let operations: TransformSpec = serde_json::from_value(json!({
        "fillna": {"amount": 0},
        "groupby": {"by": ["region"], "agg": {"amount": "max", "order_id": "count"}}
    }))
    .expect("operations");
    let request = RouteRequest {
        backend: Backend::Transform,
        sql: "SELECT * FROM sales".to_string(),
        operations,
        ..Default::default()
    };

    let rows = engine().execute(&request).await.expect("execute");

    assert_eq!(rows.columns, vec!["region".to_string(), "amount".to_string(), "order_id".to_string()]);
    assert_eq!(
        rows.rows,
        vec![
            vec![Value::Text("East".to_string()), Value::Float(1099.0), Value::Integer(1)],
            vec![Value::Text("North".to_string()), Value::Float(999.99), Value::Integer(2)],
            vec![Value::Text("South".to_string()), Value::Float(12.5), Value::Integer(2)],
        ]
    );
}

#[tokio::test]
async fn test_engine_from_config_file() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("tabula.json");
    fs::write(
        &path,
        r#"{"cache": {"capacity": 1}, "relational": {"connector_type": "Mock", "connection_string": "mock://demo"}}"#,
    )
    .expect("write config");

    let config = EngineConfig::from_file(&path).expect("config");
    assert_eq!(config.cache.capacity, 1);
    assert_eq!(config.query.default_limit, 5000);

    let engine = TabulaEngine::new(config).expect("engine");
    let rows = engine
        .execute(&RouteRequest {
            sql: "SELECT COUNT(*) FROM sales".to_string(),
            ..Default::default()
        })
        .await
        .expect("execute");
    assert_eq!(rows.rows, vec![vec![Value::Integer(5)]]);
}
