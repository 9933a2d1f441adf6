use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use deadpool_postgres::{Manager, Pool, Runtime};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, warn};

use crate::connectors::connector_trait::{Connector, ConnectorCapabilities, ConnectorType, SourceDescriptor};
use crate::utils::{
    error::{DataSourceError, TabulaResult},
    types::{parse_datetime, Column, Table, Value},
};

/// PostgreSQL connector using tokio-postgres, optionally backed by a deadpool pool
#[derive(Default)]
pub struct PostgresConnector {
    pool: Option<Pool>,
}

impl std::fmt::Debug for PostgresConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnector")
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl PostgresConnector {
    /// Connector that opens a short-lived connection per source
    pub fn new() -> Self {
        Self { pool: None }
    }

    /// Connector with a pool for `execute_sql`. Connections are opened lazily.
    pub fn with_pool(connection_string: &str, max_connections: usize) -> TabulaResult<Self> {
        let pg_config: tokio_postgres::Config = connection_string
            .parse()
            .map_err(|e| DataSourceError::ConnectionFailed(format!("Invalid connection string: {}", e)))?;

        let manager = Manager::new(pg_config, NoTls);
        let pool = Pool::builder(manager)
            .max_size(max_connections)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| DataSourceError::ConnectionFailed(format!("Failed to create pool: {}", e)))?;

        Ok(Self { pool: Some(pool) })
    }

    async fn connect(connection_string: &str) -> TabulaResult<Client> {
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(|e| DataSourceError::ConnectionFailed(format!("Failed to connect: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection closed with error");
            }
        });

        Ok(client)
    }

    /// Run `sql`, reading column types from the prepared statement and values as text
    async fn run_query(client: &Client, sql: &str) -> TabulaResult<Table> {
        let statement = client
            .prepare(sql)
            .await
            .map_err(|e| DataSourceError::QueryExecutionFailed(format!("Failed to prepare query: {}", e)))?;
        let names: Vec<String> = statement.columns().iter().map(|c| c.name().to_string()).collect();
        let oids: Vec<u32> = statement.columns().iter().map(|c| c.type_().oid()).collect();

        let messages = client
            .simple_query(sql)
            .await
            .map_err(|e| DataSourceError::QueryExecutionFailed(format!("Query failed: {}", e)))?;

        let mut buckets: Vec<Vec<Value>> = vec![Vec::new(); names.len()];
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                for (index, bucket) in buckets.iter_mut().enumerate() {
                    let raw = row.try_get(index).map_err(|e| {
                        DataSourceError::QueryExecutionFailed(format!("Failed to read column {}: {}", index, e))
                    })?;
                    bucket.push(raw.map(|text| Self::convert_pg_text(oids[index], text)).unwrap_or(Value::Null));
                }
            }
        }

        let columns = crate::utils::types::dedupe_column_names(names)
            .into_iter()
            .zip(buckets)
            .map(|(name, values)| Column::new(name, values))
            .collect();
        Table::new(columns)
    }

    /// Convert a text-format PostgreSQL value based on its type OID
    fn convert_pg_text(type_oid: u32, text: &str) -> Value {
        match type_oid {
            // BOOL
            16 => match text {
                "t" | "true" => Value::Boolean(true),
                "f" | "false" => Value::Boolean(false),
                other => Value::Text(other.to_string()),
            },
            // INT2, INT4, INT8, OID
            21 | 23 | 20 | 26 => text
                .parse::<i64>()
                .map(Value::Integer)
                .unwrap_or_else(|_| Value::Text(text.to_string())),
            // FLOAT4, FLOAT8, NUMERIC, MONEY-free numerics
            700 | 701 | 1700 => match text {
                "NaN" => Value::Float(f64::NAN),
                "Infinity" => Value::Float(f64::INFINITY),
                "-Infinity" => Value::Float(f64::NEG_INFINITY),
                _ => text
                    .parse::<f64>()
                    .map(Value::Float)
                    .unwrap_or_else(|_| Value::Text(text.to_string())),
            },
            // DATE
            1082 => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(Value::DateTime)
                .unwrap_or_else(|| Value::Text(text.to_string())),
            // TIMESTAMP
            1114 => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .or_else(|| parse_datetime(text))
                .map(Value::DateTime)
                .unwrap_or_else(|| Value::Text(text.to_string())),
            // TIMESTAMPTZ
            1184 => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
                .map(|dt| dt.naive_utc())
                .ok()
                .or_else(|| parse_datetime(text))
                .map(Value::DateTime)
                .unwrap_or_else(|| Value::Text(text.to_string())),
            _ => Value::Text(text.to_string()),
        }
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn fetch_table(&self, source: &SourceDescriptor) -> TabulaResult<Table> {
        let (connection_string, query) = source.connection_params()?;
        debug!(query = %query, "Fetching PostgreSQL source");

        let client = Self::connect(connection_string).await?;
        Self::run_query(&client, query).await
    }

    async fn execute_sql(&self, sql: &str) -> TabulaResult<Table> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| DataSourceError::ConnectionFailed("No connection pool available".to_string()))?;

        let client = pool
            .get()
            .await
            .map_err(|e| DataSourceError::ConnectionFailed(format!("Failed to get connection: {}", e)))?;

        Self::run_query(&client, sql).await
    }

    fn get_connector_type(&self) -> ConnectorType {
        ConnectorType::PostgreSQL
    }

    fn get_capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            supports_sql: true,
            supports_write_back: false,
            supports_pooling: self.pool.is_some(),
            max_concurrent_queries: self.pool.as_ref().map(|p| p.status().max_size as u32),
        }
    }
}
