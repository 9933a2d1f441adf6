use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::connectors::ConnectorType;
use crate::utils::error::{TabulaError, TabulaResult};

/// Main engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub query: QueryConfig,
    pub statistics: StatisticsConfig,
    pub relational: Option<RelationalConfig>,
    pub logging: LoggingConfig,
}

/// Table cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
}

/// Query engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_limit: usize,
    pub preview_limit: usize,
}

/// Statistics engine thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub outlier_index_cap: usize,
    pub histogram_bins: usize,
    pub top_values: usize,
    pub missing_threshold_pct: f64,
    pub skew_threshold: f64,
    pub summary_name_limit: usize,
}

/// Relational backend used by the router and by `source_sql` loads
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelationalConfig {
    pub connector_type: ConnectorType,
    pub connection_string: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
    pub json: bool,
}

fn default_max_connections() -> usize {
    10
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 50 }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 5000,
            preview_limit: 100,
        }
    }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            outlier_index_cap: 500,
            histogram_bins: 10,
            top_values: 10,
            missing_threshold_pct: 5.0,
            skew_threshold: 1.0,
            summary_name_limit: 3,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load a JSON configuration file. Missing sections take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> TabulaResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TabulaError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = serde_json::from_str(&raw).map_err(|e| {
            TabulaError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TabulaResult<()> {
        if self.cache.capacity == 0 {
            return Err(TabulaError::Configuration(
                "cache.capacity must be greater than zero".to_string(),
            ));
        }
        if self.query.default_limit == 0 {
            return Err(TabulaError::Configuration(
                "query.default_limit must be greater than zero".to_string(),
            ));
        }
        if self.statistics.histogram_bins == 0 {
            return Err(TabulaError::Configuration(
                "statistics.histogram_bins must be greater than zero".to_string(),
            ));
        }
        if let Some(relational) = &self.relational {
            if relational.connection_string.trim().is_empty() {
                return Err(TabulaError::Configuration(
                    "relational.connection_string must not be empty".to_string(),
                ));
            }
            if relational.max_connections == 0 {
                return Err(TabulaError::Configuration(
                    "relational.max_connections must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();

        assert_eq!(config.cache.capacity, 50);
        assert_eq!(config.query.default_limit, 5000);
        assert_eq!(config.statistics.outlier_index_cap, 500);
        assert_eq!(config.statistics.histogram_bins, 10);
        assert_eq!(config.statistics.top_values, 10);
        assert_eq!(config.statistics.missing_threshold_pct, 5.0);
        assert_eq!(config.statistics.skew_threshold, 1.0);
        assert!(config.relational.is_none());
        assert_eq!(config.logging.filter, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"cache": {"capacity": 2}}"#).unwrap();

        assert_eq!(config.cache.capacity, 2);
        assert_eq!(config.query.default_limit, 5000);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_relational_config_parsing() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"relational": {"connector_type": "PostgreSQL", "connection_string": "postgresql://localhost/sales"}}"#,
        )
        .unwrap();

        let relational = config.relational.unwrap();
        assert_eq!(relational.connector_type, ConnectorType::PostgreSQL);
        assert_eq!(relational.max_connections, 10);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = EngineConfig::default();
        config.cache.capacity = 0;

        match config.validate() {
            Err(TabulaError::Configuration(msg)) => assert!(msg.contains("cache.capacity")),
            other => panic!("Expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"query": {{"default_limit": 10}}, "logging": {{"json": true}}}}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.query.default_limit, 10);
        assert!(config.logging.json);
    }

    #[test]
    fn test_from_file_missing() {
        let result = EngineConfig::from_file("/definitely/not/here.json");
        assert!(matches!(result, Err(TabulaError::Configuration(_))));
    }
}
