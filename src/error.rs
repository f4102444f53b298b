//! Error types for agent-foreman.

use std::time::Duration;

use uuid::Uuid;

use crate::cli::CliType;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("CLI error: {0}")]
    Cli(#[from] CliError),

    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failure of a single CLI invocation, one variant per stage.
///
/// Resolve → write input → spawn → wait → parse → validate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CliError {
    #[error("{cli} binary not found (checked settings, {env_var} and PATH)")]
    BinaryNotFound { cli: CliType, env_var: &'static str },

    #[error("Failed to prepare CLI input: {0}")]
    Input(String),

    #[error("Failed to spawn {cli}: {reason}")]
    Spawn { cli: CliType, reason: String },

    #[error("Failed waiting for CLI process: {0}")]
    Wait(String),

    #[error("CLI invocation cancelled")]
    Cancelled,

    #[error("CLI timed out after {0:?}")]
    TimedOut(Duration),

    #[error("CLI exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("CLI produced no output")]
    EmptyOutput,

    #[error("CLI output is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("CLI output does not match the expected schema: {0}")]
    SchemaViolation(String),
}

impl CliError {
    /// Cancellation is not a failure of the task; it leaves no trace.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors raised while processing a single queue item.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    #[error("Chat {0} not found")]
    ChatNotFound(Uuid),

    #[error("Workspace {0} not found")]
    WorkspaceNotFound(Uuid),

    #[error("Failed to prepare working directory {path}: {reason}")]
    WorkingDir { path: String, reason: String },

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Agent invocation failed: {0}")]
    Invocation(#[from] CliError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
