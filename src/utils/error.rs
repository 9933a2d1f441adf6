use thiserror::Error;

/// Main error type for the Tabula engine
#[derive(Debug, Error)]
pub enum TabulaError {
    #[error("Data source error: {0}")]
    DataSource(#[from] DataSourceError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Cleaning error: {0}")]
    Cleaning(#[from] CleaningError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures while resolving or materializing a source
#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("Source is unreachable: {0}")]
    Unreachable(String),

    #[error("Failed to parse source: {0}")]
    Unparsable(String),

    #[error("Unsupported source format: {0}")]
    UnsupportedFormat(String),

    #[error("Missing connection parameter: {0}")]
    MissingConnectionParameter(String),

    #[error("Connection to backend failed: {0}")]
    ConnectionFailed(String),

    #[error("Query execution failed: {0}")]
    QueryExecutionFailed(String),

    #[error("No connector registered for {0}")]
    NoConnector(String),
}

/// Query engine and embedded SQL errors
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Column not found: {0}")]
    UnknownColumn(String),

    #[error("Aggregation method '{0}' requires an aggregation column")]
    MissingAggregationColumn(String),

    #[error("Invalid value {value} for filter on column '{column}'")]
    InvalidFilterValue { column: String, value: String },

    #[error("Invalid SQL syntax: {0}")]
    InvalidSql(String),

    #[error("Unsupported SQL feature: {0}")]
    UnsupportedSql(String),

    #[error("Table not registered: {0}")]
    UnknownTable(String),
}

/// Cleaning pipeline errors. Per-operation failures are reported, not raised.
#[derive(Debug, Error)]
pub enum CleaningError {
    #[error("Invalid cleaning operation: {0}")]
    InvalidOperation(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Column kernel failed: {0}")]
    Frame(#[from] polars::prelude::PolarsError),

    #[error("Persisting to origin failed: {0}")]
    PersistenceFailed(String),

    #[error("Write-back not supported for format '{0}'")]
    PersistenceUnsupported(String),

    #[error("Source is not file backed: {0}")]
    NotFileBacked(String),
}

/// Backend router errors
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("No data source provided for the embedded backend (source or source_sql required)")]
    MissingSource,

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Invalid transform: {0}")]
    InvalidTransform(String),
}

/// Result type alias for engine operations
pub type TabulaResult<T> = Result<T, TabulaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tabula_error_from_data_source_error() {
        let source_error = DataSourceError::UnsupportedFormat("parquet".to_string());
        let error: TabulaError = source_error.into();

        match error {
            TabulaError::DataSource(DataSourceError::UnsupportedFormat(msg)) => {
                assert_eq!(msg, "parquet");
            }
            _ => panic!("Expected DataSource error"),
        }
    }

    #[test]
    fn test_tabula_error_from_query_error() {
        let query_error = QueryError::UnknownColumn("region".to_string());
        let error: TabulaError = query_error.into();

        match error {
            TabulaError::Query(QueryError::UnknownColumn(msg)) => assert_eq!(msg, "region"),
            _ => panic!("Expected Query error"),
        }
    }

    #[test]
    fn test_tabula_error_from_cleaning_error() {
        let cleaning_error = CleaningError::PersistenceUnsupported("xml".to_string());
        let error: TabulaError = cleaning_error.into();

        assert!(matches!(error, TabulaError::Cleaning(CleaningError::PersistenceUnsupported(_))));
    }

    #[test]
    fn test_error_display() {
        let error = TabulaError::from(QueryError::InvalidFilterValue {
            column: "amount".to_string(),
            value: "abc".to_string(),
        });
        let error_string = format!("{}", error);
        assert!(error_string.contains("Query error"));
        assert!(error_string.contains("amount"));

        let error = TabulaError::Configuration("capacity must be positive".to_string());
        assert!(format!("{}", error).contains("Configuration error: capacity must be positive"));
    }

    #[test]
    fn test_router_error_message() {
        let error: TabulaError = RouterError::MissingSource.into();
        assert!(error.to_string().contains("source_sql"));
    }
}
