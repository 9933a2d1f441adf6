use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::utils::{
    error::{DataSourceError, TabulaError, TabulaResult},
    types::Table,
};

/// Connector types
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorType {
    Mock,
    PostgreSQL,
    SqlServer,
    File,
}

/// Storage formats a source can be read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceFormat {
    Csv,
    Excel,
    Json,
    Xml,
    Postgres,
    SqlServer,
    Mock,
}

impl SourceFormat {
    /// Canonical tag, used in cache keys
    pub fn tag(&self) -> &'static str {
        match self {
            SourceFormat::Csv => "csv",
            SourceFormat::Excel => "excel",
            SourceFormat::Json => "json",
            SourceFormat::Xml => "xml",
            SourceFormat::Postgres => "postgres",
            SourceFormat::SqlServer => "sqlserver",
            SourceFormat::Mock => "mock",
        }
    }

    /// Connector responsible for materializing this format
    pub fn connector_type(&self) -> ConnectorType {
        match self {
            SourceFormat::Csv | SourceFormat::Excel | SourceFormat::Json | SourceFormat::Xml => {
                ConnectorType::File
            }
            SourceFormat::Postgres => ConnectorType::PostgreSQL,
            SourceFormat::SqlServer => ConnectorType::SqlServer,
            SourceFormat::Mock => ConnectorType::Mock,
        }
    }

    pub fn is_relational(&self) -> bool {
        matches!(self, SourceFormat::Postgres | SourceFormat::SqlServer)
    }

    pub fn is_file(&self) -> bool {
        self.connector_type() == ConnectorType::File
    }
}

impl FromStr for SourceFormat {
    type Err = TabulaError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(SourceFormat::Csv),
            "excel" | "xlsx" | "xls" => Ok(SourceFormat::Excel),
            "json" => Ok(SourceFormat::Json),
            "xml" => Ok(SourceFormat::Xml),
            "postgres" | "postgresql" => Ok(SourceFormat::Postgres),
            "sqlserver" | "mssql" => Ok(SourceFormat::SqlServer),
            "mock" => Ok(SourceFormat::Mock),
            other => Err(DataSourceError::UnsupportedFormat(other.to_string()).into()),
        }
    }
}

impl TryFrom<String> for SourceFormat {
    type Error = TabulaError;

    fn try_from(tag: String) -> Result<Self, Self::Error> {
        tag.parse()
    }
}

impl From<SourceFormat> for String {
    fn from(format: SourceFormat) -> Self {
        format.tag().to_string()
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Where a source lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceLocator {
    Path(PathBuf),
    Connection {
        connection_string: Option<String>,
        query: Option<String>,
    },
}

/// Identifies a dataset: locator plus format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub locator: SourceLocator,
    pub format: SourceFormat,
}

impl SourceDescriptor {
    pub fn file(path: impl Into<PathBuf>, format: SourceFormat) -> Self {
        Self {
            locator: SourceLocator::Path(path.into()),
            format,
        }
    }

    pub fn connection(format: SourceFormat, connection_string: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            locator: SourceLocator::Connection {
                connection_string: Some(connection_string.into()),
                query: Some(query.into()),
            },
            format,
        }
    }

    /// In-memory source served by the mock connector
    pub fn mock(name: impl Into<String>) -> Self {
        Self {
            locator: SourceLocator::Connection {
                connection_string: None,
                query: Some(name.into()),
            },
            format: SourceFormat::Mock,
        }
    }

    /// Path for file sources, or the connection/query pair for relational ones
    pub fn identity(&self) -> String {
        match &self.locator {
            SourceLocator::Path(path) => path.display().to_string(),
            SourceLocator::Connection { connection_string, query } => format!(
                "{}|{}",
                connection_string.as_deref().unwrap_or_default(),
                query.as_deref().unwrap_or_default()
            ),
        }
    }

    /// `"{identity}_{format}"`; independent of any row limit
    pub fn cache_key(&self) -> String {
        format!("{}_{}", self.identity(), self.format.tag())
    }

    /// Filesystem path of a file-backed source
    pub fn path(&self) -> Option<&PathBuf> {
        match &self.locator {
            SourceLocator::Path(path) => Some(path),
            SourceLocator::Connection { .. } => None,
        }
    }

    /// Both connection parameters of a relational source
    pub fn connection_params(&self) -> TabulaResult<(&str, &str)> {
        match &self.locator {
            SourceLocator::Connection { connection_string, query } => {
                let connection_string = connection_string
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| DataSourceError::MissingConnectionParameter("connection_string".to_string()))?;
                let query = query
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| DataSourceError::MissingConnectionParameter("query".to_string()))?;
                Ok((connection_string, query))
            }
            SourceLocator::Path(_) => Err(DataSourceError::MissingConnectionParameter(
                "connection_string".to_string(),
            )
            .into()),
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.locator {
            SourceLocator::Path(path) => write!(f, "{} ({})", path.display(), self.format),
            SourceLocator::Connection { query, .. } => {
                write!(f, "{} query '{}'", self.format, query.as_deref().unwrap_or_default())
            }
        }
    }
}

/// Base trait for all data source connectors
#[async_trait]
pub trait Connector: Send + Sync {
    /// Materialize the complete table behind `source`
    async fn fetch_table(&self, source: &SourceDescriptor) -> TabulaResult<Table>;

    /// Run a SQL statement against the connector's own backend
    async fn execute_sql(&self, sql: &str) -> TabulaResult<Table> {
        let _ = sql;
        Err(DataSourceError::QueryExecutionFailed(format!(
            "{:?} connector does not execute SQL",
            self.get_connector_type()
        ))
        .into())
    }

    /// Get the type of this connector
    fn get_connector_type(&self) -> ConnectorType;

    /// Get connector-specific capabilities
    fn get_capabilities(&self) -> ConnectorCapabilities;
}

/// Capabilities supported by a connector
#[derive(Debug, Clone)]
pub struct ConnectorCapabilities {
    pub supports_sql: bool,
    pub supports_write_back: bool,
    pub supports_pooling: bool,
    pub max_concurrent_queries: Option<u32>,
}

impl Default for ConnectorCapabilities {
    fn default() -> Self {
        Self {
            supports_sql: false,
            supports_write_back: false,
            supports_pooling: false,
            max_concurrent_queries: Some(1),
        }
    }
}

/// Registry of connectors, one per connector type
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<ConnectorType, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    /// Register a connector under its own type
    pub fn register(&mut self, connector: Arc<dyn Connector>) -> TabulaResult<()> {
        let connector_type = connector.get_connector_type();
        if self.connectors.contains_key(&connector_type) {
            return Err(TabulaError::Configuration(format!(
                "Connector '{:?}' is already registered",
                connector_type
            )));
        }

        self.connectors.insert(connector_type, connector);
        Ok(())
    }

    /// Get the connector for a type
    pub fn get(&self, connector_type: &ConnectorType) -> Option<Arc<dyn Connector>> {
        self.connectors.get(connector_type).cloned()
    }

    /// Connector for a type, or `DataSourceError::NoConnector`
    pub fn resolve(&self, connector_type: &ConnectorType) -> TabulaResult<Arc<dyn Connector>> {
        self.get(connector_type)
            .ok_or_else(|| DataSourceError::NoConnector(format!("{:?}", connector_type)).into())
    }

    /// List all registered connector types
    pub fn list_connectors(&self) -> Vec<ConnectorType> {
        self.connectors.keys().cloned().collect()
    }

    /// Remove a connector from the registry
    pub fn unregister(&mut self, connector_type: &ConnectorType) -> Option<Arc<dyn Connector>> {
        self.connectors.remove(connector_type)
    }

    /// Check if a connector is registered
    pub fn contains(&self, connector_type: &ConnectorType) -> bool {
        self.connectors.contains_key(connector_type)
    }

    /// Get the number of registered connectors
    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}
