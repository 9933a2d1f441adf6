use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::connectors::{
    ConnectorRegistry, FileConnector, MockConnector, PostgresConnector, SourceDescriptor, SqlServerConnector,
};
use crate::engine::table_cache::TableCache;
use crate::utils::{error::TabulaResult, types::Table};

/// Resolves a source descriptor to a table, going through the shared cache
#[derive(Clone)]
pub struct Loader {
    cache: Arc<TableCache>,
    registry: ConnectorRegistry,
}

impl Loader {
    pub fn new(cache: Arc<TableCache>, registry: ConnectorRegistry) -> Self {
        Self { cache, registry }
    }

    /// Loader with the file, PostgreSQL, SQL Server and mock connectors registered
    pub fn with_default_connectors(cache: Arc<TableCache>) -> TabulaResult<Self> {
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(FileConnector::new()))?;
        registry.register(Arc::new(PostgresConnector::new()))?;
        registry.register(Arc::new(SqlServerConnector::new()))?;
        registry.register(Arc::new(MockConnector::new()))?;
        Ok(Self::new(cache, registry))
    }

    pub fn cache(&self) -> &Arc<TableCache> {
        &self.cache
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    /// Load a source, truncated to the first `row_limit` rows when given
    ///
    /// A limit of zero means no limit. The full table is cached under the
    /// source's key regardless of the limit, and only after it parsed successfully.
    pub async fn load(&self, source: &SourceDescriptor, row_limit: Option<usize>) -> TabulaResult<Arc<Table>> {
        if source.format.is_relational() {
            source.connection_params()?;
        }

        let key = source.cache_key();
        let table = match self.cache.get(&key) {
            Some(table) => {
                debug!(key = %key, "Serving source from cache");
                table
            }
            None => {
                let connector = self.registry.resolve(&source.format.connector_type())?;
                let start = Instant::now();
                let table = Arc::new(connector.fetch_table(source).await?);
                info!(
                    source = %source,
                    rows = table.row_count(),
                    columns = table.column_count(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Source loaded"
                );
                self.cache.set(key, table.clone());
                table
            }
        };

        Ok(match row_limit {
            Some(limit) if limit > 0 && limit < table.row_count() => Arc::new(table.head(limit)),
            _ => table,
        })
    }

    /// Drop the cached copy of a source
    pub fn invalidate(&self, source: &SourceDescriptor) -> bool {
        self.cache.invalidate(&source.cache_key())
    }
}
