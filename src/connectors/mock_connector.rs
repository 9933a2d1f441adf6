use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connectors::connector_trait::{
    Connector, ConnectorCapabilities, ConnectorType, SourceDescriptor, SourceLocator,
};
use crate::engine::sql_session::EmbeddedSession;
use crate::utils::{
    error::{DataSourceError, TabulaResult},
    types::{Table, Value},
};

/// Mock connector serving deterministic in-memory tables
///
/// A source's query (or path) names a table; anything that reads like a
/// `SELECT` runs through an [`EmbeddedSession`] with every table registered.
/// `execute_sql` does the same, so the mock doubles as a relational backend.
#[derive(Debug)]
pub struct MockConnector {
    tables: HashMap<String, Arc<Table>>,
    fetch_count: AtomicUsize,
    delay_ms: u64,
}

impl MockConnector {
    /// Create a new mock connector with default test data
    pub fn new() -> Self {
        let mut connector = Self::empty();
        connector.initialize_test_data();
        connector
    }

    /// Mock connector without any tables
    pub fn empty() -> Self {
        Self {
            tables: HashMap::new(),
            fetch_count: AtomicUsize::new(0),
            delay_ms: 0,
        }
    }

    /// Create a mock connector that sleeps before every fetch
    pub fn with_delay(delay_ms: u64) -> Self {
        let mut connector = Self::new();
        connector.delay_ms = delay_ms;
        connector
    }

    /// Add or replace a table
    pub fn add_table(&mut self, name: &str, table: Table) {
        self.tables.insert(name.to_string(), Arc::new(table));
    }

    /// Add a table from column names and row tuples
    pub fn add_rows(&mut self, name: &str, column_names: &[&str], rows: Vec<Vec<Value>>) -> TabulaResult<()> {
        let names = column_names.iter().map(|n| n.to_string()).collect();
        let table = Table::from_rows(names, rows)?;
        self.add_table(name, table);
        Ok(())
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of `fetch_table` calls served so far
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn date(y: i32, m: u32, d: u32) -> Value {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(Value::DateTime)
            .unwrap_or(Value::Null)
    }

    /// Initialize deterministic test data
    fn initialize_test_data(&mut self) {
        let users = Table::from_rows(
            vec!["id".into(), "name".into(), "email".into(), "age".into(), "active".into()],
            vec![
                vec![
                    Value::Integer(1),
                    Self::text("Alice Johnson"),
                    Self::text("alice@example.com"),
                    Value::Integer(30),
                    Value::Boolean(true),
                ],
                vec![
                    Value::Integer(2),
                    Self::text("Bob Smith"),
                    Self::text("bob@example.com"),
                    Value::Integer(25),
                    Value::Boolean(true),
                ],
                vec![
                    Value::Integer(3),
                    Self::text("Charlie Brown"),
                    Value::Null,
                    Value::Integer(35),
                    Value::Boolean(false),
                ],
            ],
        );

        let sales = Table::from_rows(
            vec!["order_id".into(), "region".into(), "product".into(), "amount".into(), "order_date".into()],
            vec![
                vec![Value::Integer(1), Self::text("North"), Self::text("Laptop"), Value::Float(999.99), Self::date(2024, 1, 5)],
                vec![Value::Integer(2), Self::text("South"), Self::text("Coffee Mug"), Value::Float(12.5), Self::date(2024, 1, 6)],
                vec![Value::Integer(3), Self::text("North"), Self::text("Desk"), Value::Float(250.0), Self::date(2024, 2, 1)],
                vec![Value::Integer(4), Self::text("East"), Self::text("Laptop"), Value::Float(1099.0), Self::date(2024, 2, 14)],
                vec![Value::Integer(5), Self::text("South"), Self::text("Chair"), Value::Null, Self::date(2024, 3, 2)],
            ],
        );

        // Fixed literal data; construction cannot fail
        if let Ok(users) = users {
            self.add_table("users", users);
        }
        if let Ok(sales) = sales {
            self.add_table("sales", sales);
        }
    }

    fn source_name(source: &SourceDescriptor) -> TabulaResult<String> {
        match &source.locator {
            SourceLocator::Path(path) => Ok(path.display().to_string()),
            SourceLocator::Connection { query: Some(query), .. } if !query.trim().is_empty() => Ok(query.clone()),
            SourceLocator::Connection { .. } => {
                Err(DataSourceError::MissingConnectionParameter("query".to_string()).into())
            }
        }
    }

    fn looks_like_sql(text: &str) -> bool {
        let lowered = text.trim_start().to_ascii_lowercase();
        lowered.starts_with("select") || lowered.starts_with("with")
    }

    fn run_sql(&self, sql: &str) -> TabulaResult<Table> {
        let mut session = EmbeddedSession::open();
        for (name, table) in &self.tables {
            session.register(name, table.clone());
        }
        session.execute(sql)
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn fetch_table(&self, source: &SourceDescriptor) -> TabulaResult<Table> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.fetch_count.fetch_add(1, Ordering::SeqCst);

        let name = Self::source_name(source)?;
        if let Some(table) = self.tables.get(&name) {
            return Ok(table.as_ref().clone());
        }
        if Self::looks_like_sql(&name) {
            return self.run_sql(&name);
        }
        Err(DataSourceError::Unreachable(format!("Table '{}' not found", name)).into())
    }

    async fn execute_sql(&self, sql: &str) -> TabulaResult<Table> {
        self.run_sql(sql)
    }

    fn get_connector_type(&self) -> ConnectorType {
        ConnectorType::Mock
    }

    fn get_capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            supports_sql: true,
            supports_write_back: false,
            supports_pooling: false,
            max_concurrent_queries: Some(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::TabulaError;
    use std::time::Instant;

    #[tokio::test]
    async fn test_mock_connector_creation() {
        let connector = MockConnector::new();

        assert_eq!(connector.get_connector_type(), ConnectorType::Mock);
        assert_eq!(connector.table_names(), vec!["sales".to_string(), "users".to_string()]);
        assert_eq!(connector.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_connector_fetch_by_name() {
        let connector = MockConnector::new();

        let users = connector.fetch_table(&SourceDescriptor::mock("users")).await.unwrap();
        assert_eq!(users.row_count(), 3);
        assert_eq!(users.column_names(), vec!["id", "name", "email", "age", "active"]);
        assert_eq!(users.column("email").unwrap().values[2], Value::Null);
        assert_eq!(connector.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_connector_fetch_with_sql() {
        let connector = MockConnector::new();

        let table = connector
            .fetch_table(&SourceDescriptor::mock("SELECT name FROM users WHERE age > 28"))
            .await
            .unwrap();
        assert_eq!(table.column_names(), vec!["name"]);
        assert_eq!(table.row_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_connector_non_existent_table() {
        let connector = MockConnector::new();

        let result = connector.fetch_table(&SourceDescriptor::mock("orders")).await;
        match result {
            Err(TabulaError::DataSource(DataSourceError::Unreachable(msg))) => assert!(msg.contains("orders")),
            other => panic!("Expected Unreachable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mock_connector_execute_sql() {
        let connector = MockConnector::new();

        let table = connector
            .execute_sql("SELECT region, COUNT(*) AS orders FROM sales GROUP BY region ORDER BY region")
            .await
            .unwrap();
        assert_eq!(table.column("region").unwrap().values[0], Value::Text("East".to_string()));
        assert_eq!(table.column("orders").unwrap().values[1], Value::Integer(2));
    }

    #[tokio::test]
    async fn test_mock_connector_custom_rows() {
        let mut connector = MockConnector::empty();
        connector
            .add_rows("t", &["k", "v"], vec![vec![Value::Integer(1), Value::Text("a".to_string())]])
            .unwrap();

        let table = connector.fetch_table(&SourceDescriptor::mock("t")).await.unwrap();
        assert_eq!(table.row(0), vec![Value::Integer(1), Value::Text("a".to_string())]);

        let ragged = connector.add_rows("bad", &["k"], vec![vec![Value::Integer(1), Value::Integer(2)]]);
        assert!(ragged.is_err());
    }

    #[tokio::test]
    async fn test_mock_connector_with_delay() {
        let connector = MockConnector::with_delay(50);

        let start = Instant::now();
        connector.fetch_table(&SourceDescriptor::mock("users")).await.unwrap();
        assert!(start.elapsed().as_millis() >= 50);
    }

    #[test]
    fn test_mock_connector_capabilities() {
        let capabilities = MockConnector::default().get_capabilities();

        assert!(capabilities.supports_sql);
        assert!(!capabilities.supports_write_back);
        assert_eq!(capabilities.max_concurrent_queries, Some(10));
    }
}
