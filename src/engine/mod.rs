// Core engine components
pub mod table_cache;
pub mod loader;
pub mod query_engine;
pub mod statistics;
pub mod cleaning;
pub mod sql_session;
pub mod router;
pub mod engine;

pub use table_cache::*;
pub use loader::*;
pub use query_engine::*;
pub use statistics::*;
pub use cleaning::*;
pub use sql_session::*;
pub use router::*;
pub use engine::*;
