//! Persistence layer — libSQL-backed storage for workspaces, tasks, chats, and queues.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
