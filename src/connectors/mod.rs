// Connector implementations
pub mod connector_trait;
pub mod mock_connector;
pub mod postgres_connector;
pub mod file_connector;
pub mod sqlserver_connector;

pub use connector_trait::*;
pub use mock_connector::*;
pub use postgres_connector::*;
pub use file_connector::*;
pub use sqlserver_connector::*;
