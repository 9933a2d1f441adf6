use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use tiberius::{numeric::Numeric, Client, Config};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

use crate::connectors::{Connector, ConnectorCapabilities, ConnectorType, SourceDescriptor};
use crate::utils::{
    error::{DataSourceError, TabulaResult},
    types::{dedupe_column_names, Column, Table, Value},
};

/// SQL Server connector using tiberius. Each request opens its own connection.
#[derive(Debug, Clone, Default)]
pub struct SqlServerConnector {
    connection_string: Option<String>,
}

impl SqlServerConnector {
    /// Create a new SQL Server connector
    pub fn new() -> Self {
        Self { connection_string: None }
    }

    /// Connector bound to an ADO connection string for `execute_sql`
    pub fn with_connection(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: Some(connection_string.into()),
        }
    }

    async fn connect(connection_string: &str) -> TabulaResult<Client<Compat<TcpStream>>> {
        let config = Config::from_ado_string(connection_string)
            .map_err(|e| DataSourceError::ConnectionFailed(format!("Invalid connection string: {}", e)))?;

        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| DataSourceError::ConnectionFailed(format!("Failed to connect: {}", e)))?;
        tcp.set_nodelay(true)
            .map_err(|e| DataSourceError::ConnectionFailed(e.to_string()))?;

        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| DataSourceError::ConnectionFailed(format!("Failed to authenticate: {}", e)))?;
        Ok(client)
    }

    async fn run_query(client: &mut Client<Compat<TcpStream>>, sql: &str) -> TabulaResult<Table> {
        let failed = |e: tiberius::error::Error| DataSourceError::QueryExecutionFailed(e.to_string());

        let mut stream = client.simple_query(sql).await.map_err(failed)?;
        let names: Vec<String> = stream
            .columns()
            .await
            .map_err(failed)?
            .map(|columns| columns.iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let rows = stream.into_first_result().await.map_err(failed)?;

        let mut buckets: Vec<Vec<Value>> = vec![Vec::with_capacity(rows.len()); names.len()];
        for row in &rows {
            for (index, bucket) in buckets.iter_mut().enumerate() {
                bucket.push(Self::convert_row_value(row, index));
            }
        }

        let columns = dedupe_column_names(names)
            .into_iter()
            .zip(buckets)
            .map(|(name, values)| Column::new(name, values))
            .collect();
        Table::new(columns)
    }

    /// Convert tiberius row value to internal Value representation
    fn convert_row_value(row: &tiberius::Row, index: usize) -> Value {
        // Try different types in order of likelihood
        if let Ok(Some(val)) = row.try_get::<&str, usize>(index) {
            return Value::Text(val.to_string());
        }
        if let Ok(Some(val)) = row.try_get::<i32, usize>(index) {
            return Value::Integer(val as i64);
        }
        if let Ok(Some(val)) = row.try_get::<i64, usize>(index) {
            return Value::Integer(val);
        }
        if let Ok(Some(val)) = row.try_get::<i16, usize>(index) {
            return Value::Integer(val as i64);
        }
        if let Ok(Some(val)) = row.try_get::<u8, usize>(index) {
            return Value::Integer(val as i64);
        }
        if let Ok(Some(val)) = row.try_get::<f64, usize>(index) {
            return Value::Float(val);
        }
        if let Ok(Some(val)) = row.try_get::<f32, usize>(index) {
            return Value::Float(val as f64);
        }
        if let Ok(Some(val)) = row.try_get::<Numeric, usize>(index) {
            return Value::Float(numeric_to_f64(&val));
        }
        if let Ok(Some(val)) = row.try_get::<bool, usize>(index) {
            return Value::Boolean(val);
        }
        if let Ok(Some(val)) = row.try_get::<NaiveDateTime, usize>(index) {
            return Value::DateTime(val);
        }
        if let Ok(Some(val)) = row.try_get::<NaiveDate, usize>(index) {
            return val.and_hms_opt(0, 0, 0).map(Value::DateTime).unwrap_or(Value::Null);
        }

        // If all else fails, return null
        Value::Null
    }
}

fn numeric_to_f64(numeric: &Numeric) -> f64 {
    numeric.value() as f64 / 10f64.powi(numeric.scale() as i32)
}

#[async_trait]
impl Connector for SqlServerConnector {
    async fn fetch_table(&self, source: &SourceDescriptor) -> TabulaResult<Table> {
        let (connection_string, query) = source.connection_params()?;
        debug!(query = %query, "Fetching SQL Server source");

        let mut client = Self::connect(connection_string).await?;
        Self::run_query(&mut client, query).await
    }

    async fn execute_sql(&self, sql: &str) -> TabulaResult<Table> {
        let connection_string = self
            .connection_string
            .as_deref()
            .ok_or_else(|| DataSourceError::ConnectionFailed("No connection string configured".to_string()))?;

        let mut client = Self::connect(connection_string).await?;
        Self::run_query(&mut client, sql).await
    }

    fn get_connector_type(&self) -> ConnectorType {
        ConnectorType::SqlServer
    }

    fn get_capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            supports_sql: true,
            supports_write_back: false,
            supports_pooling: false,
            max_concurrent_queries: Some(20),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::SourceFormat;
    use crate::utils::error::TabulaError;

    #[test]
    fn test_numeric_conversion() {
        let numeric = Numeric::new_with_scale(12345, 2);
        assert!((numeric_to_f64(&numeric) - 123.45).abs() < 1e-9);
    }

    #[test]
    fn test_connector_type_and_capabilities() {
        let connector = SqlServerConnector::new();

        assert_eq!(connector.get_connector_type(), ConnectorType::SqlServer);
        assert!(connector.get_capabilities().supports_sql);
        assert!(!connector.get_capabilities().supports_write_back);
    }

    #[tokio::test]
    async fn test_fetch_table_requires_query() {
        let connector = SqlServerConnector::new();
        let source = SourceDescriptor {
            locator: crate::connectors::SourceLocator::Connection {
                connection_string: Some("server=tcp:localhost,1433".to_string()),
                query: None,
            },
            format: SourceFormat::SqlServer,
        };

        let result = connector.fetch_table(&source).await;
        assert!(matches!(
            result,
            Err(TabulaError::DataSource(DataSourceError::MissingConnectionParameter(_)))
        ));
    }

    #[tokio::test]
    async fn test_execute_sql_without_connection_string() {
        let connector = SqlServerConnector::new();

        let result = connector.execute_sql("SELECT 1").await;
        assert!(matches!(
            result,
            Err(TabulaError::DataSource(DataSourceError::ConnectionFailed(_)))
        ));
    }
}
