use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::connectors::{
    Connector, ConnectorType, MockConnector, PostgresConnector, SourceDescriptor, SqlServerConnector,
};
use crate::engine::cleaning::{apply_operation, CleaningOperation, CleaningPipeline, OperationSpec};
use crate::engine::loader::Loader;
use crate::engine::query_engine::{group_aggregate, AggregationMethod, AggregationSpec};
use crate::engine::sql_session::EmbeddedSession;
use crate::utils::{
    config::RelationalConfig,
    error::{RouterError, TabulaError, TabulaResult},
    types::{RowSet, Table, Value},
};

/// Alias under which the embedded backend exposes its table
pub const EMBEDDED_TABLE_ALIAS: &str = "df";

/// Execution backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[serde(alias = "duckdb")]
    Embedded,
    #[default]
    #[serde(alias = "postgres")]
    Relational,
    #[serde(alias = "pandas")]
    Transform,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupKeys {
    One(String),
    Many(Vec<String>),
}

impl GroupKeys {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            GroupKeys::One(key) => vec![key.clone()],
            GroupKeys::Many(keys) => keys.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBySpec {
    pub by: GroupKeys,
    /// Target column to aggregation method, in output order
    #[serde(default)]
    pub agg: serde_json::Map<String, serde_json::Value>,
}

/// Declarative post-processing for the transform backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    /// Scalar for every column, or an object of per-column fill values
    #[serde(default)]
    pub fillna: Option<serde_json::Value>,
    #[serde(default)]
    pub drop_duplicates: bool,
    #[serde(default)]
    pub groupby: Option<GroupBySpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteRequest {
    #[serde(default, alias = "engine")]
    pub backend: Backend,
    pub sql: String,
    #[serde(default)]
    pub source: Option<SourceDescriptor>,
    #[serde(default)]
    pub source_sql: Option<String>,
    #[serde(default)]
    pub operations: TransformSpec,
}

/// Dispatches a request to the embedded, relational or transform backend
///
/// Holds no state of its own beyond handles to the loader and the
/// configured relational connector.
#[derive(Clone)]
pub struct BackendRouter {
    loader: Loader,
    relational: Option<Arc<dyn Connector>>,
}

impl BackendRouter {
    pub fn new(loader: Loader, relational: Option<Arc<dyn Connector>>) -> Self {
        Self { loader, relational }
    }

    /// Build the relational connector described by `config`
    pub fn relational_connector(config: &RelationalConfig) -> TabulaResult<Arc<dyn Connector>> {
        let connector: Arc<dyn Connector> = match config.connector_type {
            ConnectorType::PostgreSQL => Arc::new(PostgresConnector::with_pool(
                &config.connection_string,
                config.max_connections,
            )?),
            ConnectorType::SqlServer => Arc::new(SqlServerConnector::with_connection(config.connection_string.clone())),
            ConnectorType::Mock => Arc::new(MockConnector::new()),
            ConnectorType::File => {
                return Err(TabulaError::Configuration(
                    "A file connector cannot serve as the relational backend".to_string(),
                ))
            }
        };
        Ok(connector)
    }

    pub async fn execute(&self, request: &RouteRequest) -> TabulaResult<RowSet> {
        let start = Instant::now();
        let table = match request.backend {
            Backend::Embedded => self.execute_embedded(request).await?,
            Backend::Relational => self.relational()?.execute_sql(&request.sql).await?,
            Backend::Transform => {
                let table = self.relational()?.execute_sql(&request.sql).await?;
                apply_transform(table, &request.operations)?
            }
        };

        info!(
            backend = ?request.backend,
            rows = table.row_count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Routed query executed"
        );
        Ok(table.normalize_non_finite().to_row_set())
    }

    fn relational(&self) -> TabulaResult<&Arc<dyn Connector>> {
        self.relational
            .as_ref()
            .ok_or_else(|| RouterError::BackendUnavailable("no relational connection is configured".to_string()).into())
    }

    async fn execute_embedded(&self, request: &RouteRequest) -> TabulaResult<Table> {
        let table = match (&request.source, &request.source_sql) {
            (Some(source), _) => self.loader.load(source, None).await?,
            (None, Some(source_sql)) => Arc::new(self.relational()?.execute_sql(source_sql).await?),
            (None, None) => return Err(RouterError::MissingSource.into()),
        };

        let mut session = EmbeddedSession::open();
        session.register(EMBEDDED_TABLE_ALIAS, table);
        debug!(sql = %request.sql, "Running query on embedded backend");
        session.execute(&request.sql)
    }
}

/// Fill nulls, drop duplicate rows, then group and aggregate
pub fn apply_transform(mut table: Table, spec: &TransformSpec) -> TabulaResult<Table> {
    if let Some(fill) = &spec.fillna {
        table = fill_nulls(&table, fill)?;
    }

    if spec.drop_duplicates {
        let outcome = CleaningPipeline::apply(&table, &[OperationSpec::new("drop_duplicates", serde_json::Value::Null)]);
        table = outcome.table;
    }

    if let Some(groupby) = &spec.groupby {
        let keys = groupby.by.to_vec();
        if keys.is_empty() {
            return Err(RouterError::InvalidTransform("groupby.by must name at least one column".to_string()).into());
        }
        let aggregations = groupby
            .agg
            .iter()
            .map(|(column, method)| -> TabulaResult<AggregationSpec> {
                let method: AggregationMethod = serde_json::from_value(method.clone()).map_err(|_| {
                    RouterError::InvalidTransform(format!("Unsupported aggregation {} for '{}'", method, column))
                })?;
                Ok(AggregationSpec {
                    target_column: Some(column.clone()),
                    method,
                })
            })
            .collect::<TabulaResult<Vec<_>>>()?;
        let aggregations = if aggregations.is_empty() {
            vec![AggregationSpec {
                target_column: None,
                method: AggregationMethod::Count,
            }]
        } else {
            aggregations
        };
        table = group_aggregate(&table, &keys, &aggregations)?;
    }

    Ok(table)
}

fn fill_nulls(table: &Table, fill: &serde_json::Value) -> TabulaResult<Table> {
    let steps: Vec<(Vec<String>, Value)> = match fill {
        serde_json::Value::Object(map) => map
            .iter()
            .filter(|(name, _)| table.column_index(name).is_some())
            .map(|(name, v)| (vec![name.clone()], Value::from_json(v)))
            .collect(),
        scalar => vec![(Vec::new(), Value::from_json(scalar))],
    };

    let mut next = table.clone();
    for (columns, value) in steps {
        if value.is_null() {
            continue;
        }
        let operation = CleaningOperation::FillNa {
            columns,
            method: None,
            value: Some(value),
        };
        next = apply_operation(&next, &operation).map_err(|e| RouterError::InvalidTransform(e.to_string()))?;
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{ConnectorRegistry, FileConnector, SourceFormat};
    use crate::engine::table_cache::TableCache;
    use crate::utils::error::QueryError;
    use crate::utils::types::Column;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn loader() -> Loader {
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(FileConnector::new())).unwrap();
        registry.register(Arc::new(MockConnector::new())).unwrap();
        Loader::new(Arc::new(TableCache::new(8)), registry)
    }

    fn router() -> BackendRouter {
        BackendRouter::new(loader(), Some(Arc::new(MockConnector::new())))
    }

    #[test]
    fn test_request_deserialization() {
        let request: RouteRequest = serde_json::from_value(json!({
            "engine": "pandas",
            "sql": "SELECT * FROM sales",
            "operations": {"drop_duplicates": true, "groupby": {"by": "region", "agg": {"amount": "mean"}}}
        }))
        .unwrap();

        assert_eq!(request.backend, Backend::Transform);
        assert!(request.operations.drop_duplicates);
        assert_eq!(request.operations.groupby.unwrap().by.to_vec(), vec!["region".to_string()]);

        let default: RouteRequest = serde_json::from_value(json!({"sql": "SELECT 1"})).unwrap();
        assert_eq!(default.backend, Backend::Relational);
    }

    #[tokio::test]
    async fn test_relational_backend() {
        let request = RouteRequest {
            sql: "SELECT name FROM users ORDER BY name".to_string(),
            ..Default::default()
        };
        let rows = router().execute(&request).await.unwrap();

        assert_eq!(rows.columns, vec!["name".to_string()]);
        assert_eq!(rows.rows[0], vec![Value::Text("Alice Johnson".to_string())]);
    }

    #[tokio::test]
    async fn test_relational_backend_unavailable() {
        let router = BackendRouter::new(loader(), None);
        let request = RouteRequest {
            sql: "SELECT 1".to_string(),
            ..Default::default()
        };

        let result = router.execute(&request).await;
        assert!(matches!(result, Err(TabulaError::Router(RouterError::BackendUnavailable(_)))));
    }

    #[tokio::test]
    async fn test_embedded_backend_over_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "category,amount\nA,10\nB,20\nA,30").unwrap();

        let request = RouteRequest {
            backend: Backend::Embedded,
            sql: "SELECT category, SUM(amount) AS total FROM df GROUP BY category ORDER BY total DESC".to_string(),
            source: Some(SourceDescriptor::file(file.path(), SourceFormat::Csv)),
            ..Default::default()
        };
        let rows = router().execute(&request).await.unwrap();

        assert_eq!(rows.columns, vec!["category".to_string(), "total".to_string()]);
        assert_eq!(rows.rows[0], vec![Value::Text("A".to_string()), Value::Integer(40)]);
    }

    #[tokio::test]
    async fn test_embedded_backend_over_source_sql() {
        let request = RouteRequest {
            backend: Backend::Embedded,
            sql: "SELECT COUNT(*) AS n FROM df WHERE amount > 100".to_string(),
            source_sql: Some("SELECT * FROM sales".to_string()),
            ..Default::default()
        };
        let rows = router().execute(&request).await.unwrap();

        assert_eq!(rows.rows, vec![vec![Value::Integer(3)]]);
    }

    #[tokio::test]
    async fn test_embedded_backend_requires_source() {
        let request = RouteRequest {
            backend: Backend::Embedded,
            sql: "SELECT * FROM df".to_string(),
            ..Default::default()
        };

        let result = router().execute(&request).await;
        assert!(matches!(result, Err(TabulaError::Router(RouterError::MissingSource))));
    }

    #[tokio::test]
    async fn test_embedded_session_releases_table_on_error() {
        let loader = loader();
        let source = SourceDescriptor::mock("users");
        let router = BackendRouter::new(loader.clone(), None);
        let request = RouteRequest {
            backend: Backend::Embedded,
            sql: "SELECT nope FROM df".to_string(),
            source: Some(source.clone()),
            ..Default::default()
        };

        let result = router.execute(&request).await;
        assert!(matches!(result, Err(TabulaError::Query(QueryError::UnknownColumn(_)))));

        let cached = loader.cache().get(&source.cache_key()).unwrap();
        // one reference held by the cache, one by this test
        assert_eq!(Arc::strong_count(&cached), 2);
    }

    #[tokio::test]
    async fn test_transform_backend() {
        let request = RouteRequest {
            backend: Backend::Transform,
            sql: "SELECT region, amount FROM sales".to_string(),
            operations: TransformSpec {
                fillna: Some(json!(0)),
                drop_duplicates: true,
                groupby: Some(GroupBySpec {
                    by: GroupKeys::One("region".to_string()),
                    agg: json!({"amount": "sum"}).as_object().cloned().unwrap(),
                }),
            },
            ..Default::default()
        };
        let rows = router().execute(&request).await.unwrap();

        assert_eq!(rows.columns, vec!["region".to_string(), "amount".to_string()]);
        assert_eq!(rows.rows.len(), 3);
        assert_eq!(rows.rows[2], vec![Value::Text("South".to_string()), Value::Float(12.5)]);
    }

    #[test]
    fn test_transform_fill_per_column_and_invalid_agg() {
        let table = Table::new(vec![
            Column::new("k", vec![Value::Text("a".into()), Value::Null]),
            Column::new("v", vec![Value::Null, Value::Integer(2)]),
        ])
        .unwrap();

        let filled = apply_transform(
            table.clone(),
            &TransformSpec {
                fillna: Some(json!({"k": "none"})),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(filled.column("k").unwrap().values[1], Value::Text("none".into()));
        assert_eq!(filled.column("v").unwrap().values[0], Value::Null);

        let invalid = apply_transform(
            table,
            &TransformSpec {
                groupby: Some(GroupBySpec {
                    by: GroupKeys::Many(vec!["k".to_string()]),
                    agg: json!({"v": "median"}).as_object().cloned().unwrap(),
                }),
                ..Default::default()
            },
        );
        assert!(matches!(invalid, Err(TabulaError::Router(RouterError::InvalidTransform(_)))));
    }
}
