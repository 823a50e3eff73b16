//! Durable state: task store and agent registry.

mod libsql_store;
pub mod migrations;
mod traits;

pub use libsql_store::LibSqlStore;
pub use traits::TaskStore;
