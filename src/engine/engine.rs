use std::sync::Arc;
use tracing::info;

use crate::{
    connectors::{Connector, ConnectorRegistry, SourceDescriptor},
    engine::{
        cleaning::{CleaningPipeline, CleaningReport, OperationSpec},
        loader::Loader,
        query_engine::{Preview, QueryEngine, QueryOutcome, QueryRequest, RowWindow, SegmentComparison, SegmentFilter},
        router::{BackendRouter, RouteRequest},
        statistics::{CorrelationReport, StatisticsEngine, StatisticsReport},
        table_cache::TableCache,
    },
    utils::{
        config::EngineConfig,
        error::TabulaResult,
        types::RowSet,
    },
};

/// Main engine that wires the loader, cache and analysis components together
///
/// Every component shares the same [`TableCache`], so a clean through
/// [`TabulaEngine::clean`] is visible to the next load.
#[derive(Clone)]
pub struct TabulaEngine {
    config: EngineConfig,
    loader: Loader,
    query_engine: Arc<QueryEngine>,
    statistics: Arc<StatisticsEngine>,
    cleaning: CleaningPipeline,
    router: BackendRouter,
}

impl TabulaEngine {
    /// Create an engine with the default connectors and the relational backend from `config`
    pub fn new(config: EngineConfig) -> TabulaResult<Self> {
        EngineBuilder::new().with_config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn cache(&self) -> &Arc<TableCache> {
        self.loader.cache()
    }

    pub fn query_engine(&self) -> &QueryEngine {
        &self.query_engine
    }

    pub fn statistics(&self) -> &StatisticsEngine {
        &self.statistics
    }

    pub fn cleaning(&self) -> &CleaningPipeline {
        &self.cleaning
    }

    pub fn router(&self) -> &BackendRouter {
        &self.router
    }

    pub async fn preview(&self, source: &SourceDescriptor, limit: Option<usize>) -> TabulaResult<Preview> {
        let table = self.loader.load(source, None).await?;
        Ok(self.query_engine.preview(&table, limit))
    }

    pub async fn rows(&self, source: &SourceDescriptor, start: usize, end: usize) -> TabulaResult<RowWindow> {
        let table = self.loader.load(source, None).await?;
        Ok(self.query_engine.row_window(&table, start, end))
    }

    pub async fn query(&self, source: &SourceDescriptor, request: &QueryRequest) -> TabulaResult<QueryOutcome> {
        let table = self.loader.load(source, None).await?;
        self.query_engine.query(&table, request)
    }

    pub async fn compare(
        &self,
        source: &SourceDescriptor,
        first: &SegmentFilter,
        second: &SegmentFilter,
    ) -> TabulaResult<SegmentComparison> {
        let table = self.loader.load(source, None).await?;
        self.query_engine.compare_segments(&table, first, second)
    }

    pub async fn profile(&self, source: &SourceDescriptor) -> TabulaResult<StatisticsReport> {
        let table = self.loader.load(source, None).await?;
        let report = self.statistics.profile(&table);
        info!(source = %source, columns = report.column_stats.len(), "Profiled source");
        Ok(report)
    }

    pub async fn correlation(&self, source: &SourceDescriptor) -> TabulaResult<CorrelationReport> {
        let table = self.loader.load(source, None).await?;
        Ok(self.statistics.correlation(&table))
    }

    pub async fn clean(&self, source: &SourceDescriptor, operations: &[OperationSpec]) -> TabulaResult<CleaningReport> {
        self.cleaning.clean(source, operations).await
    }

    pub async fn execute(&self, request: &RouteRequest) -> TabulaResult<RowSet> {
        self.router.execute(request).await
    }
}

/// Builder for [`TabulaEngine`] with replaceable connectors
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<ConnectorRegistry>,
    relational: Option<Arc<dyn Connector>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `registry` for loads instead of the default connector set
    pub fn with_registry(mut self, registry: ConnectorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use `connector` as the relational backend, ignoring `config.relational`
    pub fn with_relational(mut self, connector: Arc<dyn Connector>) -> Self {
        self.relational = Some(connector);
        self
    }

    pub fn build(self) -> TabulaResult<TabulaEngine> {
        self.config.validate()?;

        let cache = Arc::new(TableCache::new(self.config.cache.capacity));
        let loader = match self.registry {
            Some(registry) => Loader::new(cache, registry),
            None => Loader::with_default_connectors(cache)?,
        };

        let relational = match (self.relational, &self.config.relational) {
            (Some(connector), _) => Some(connector),
            (None, Some(relational)) => Some(BackendRouter::relational_connector(relational)?),
            (None, None) => None,
        };

        Ok(TabulaEngine {
            query_engine: Arc::new(QueryEngine::new(self.config.query.clone())),
            statistics: Arc::new(StatisticsEngine::new(self.config.statistics.clone())),
            cleaning: CleaningPipeline::new(loader.clone()),
            router: BackendRouter::new(loader.clone(), relational),
            loader,
            config: self.config,
        })
    }
}
