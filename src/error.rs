//! Error types for the farm manager.

use std::time::Duration;

/// Faults raised while opening the database. All of them are fatal: a store
/// that cannot be opened cleanly must not serve requests.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("Failed to open database at {path}: {reason}")]
    Connect { path: String, reason: String },

    #[error("Failed to set busy timeout to {timeout:?}: {reason}")]
    BusyTimeout { timeout: Duration, reason: String },

    #[error("Foreign keys are disabled, refusing to start: {0}")]
    ForeignKeys(String),

    #[error("Database integrity check failed: {0}")]
    Integrity(String),

    #[error("Database migration failed: {0}")]
    Migration(String),
}

/// Faults raised by queries on an open database.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database busy: connection not available within {0:?}")]
    Busy(Duration),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Refusing to delete a job when foreign keys are not enabled on the database")]
    DeletingWithoutForeignKeys,

    #[error("Transaction commit failed: {0}")]
    Commit(String),

    #[error("Transaction rollback failed: {reason}")]
    Rollback {
        reason: String,
        /// The failure that led to the rollback, if any.
        cause: Option<String>,
    },

    #[error("Integrity check failed: {0}")]
    Integrity(String),
}

impl StoreError {
    pub(crate) fn query(e: impl std::fmt::Display) -> Self {
        let msg = e.to_string();
        if msg.contains("constraint failed") || msg.contains("SQLITE_CONSTRAINT") {
            Self::Constraint(msg)
        } else {
            Self::Query(msg)
        }
    }

    /// True when the error indicates SQLite or the connection gate was busy.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Busy(_) => true,
            Self::Query(msg) => msg.contains("SQLITE_BUSY") || msg.contains("database is locked"),
            _ => false,
        }
    }
}

impl From<crate::model::UnknownStatus> for StoreError {
    fn from(e: crate::model::UnknownStatus) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors returned by a command runner while executing one command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown command {name}")]
    UnknownCommand { name: String },

    #[error("Invalid parameters for command {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Command {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("Command {name} was cancelled")]
    Cancelled { name: String },
}

/// Errors returned by a task execution listener when it cannot relay an update.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Failed to report task update: {0}")]
pub struct ListenerError(pub String);

/// Errors that stop the task executor itself (as opposed to a failing command,
/// which is reported as a task outcome).
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Error sending notification to manager: {0}")]
    Notify(#[from] ListenerError),
}

/// Errors returned by an event consumer. These are logged by the bus and never
/// reach the producer.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Could not serialize event for {topic}: {reason}")]
    Serialization { topic: String, reason: String },

    #[error("Outgoing queue full, dropped event for {topic}")]
    QueueFull { topic: String },

    #[error("Consumer rejected event on {topic}: {reason}")]
    Rejected { topic: String, reason: String },
}

/// Errors from the broker publishing transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("Could not connect to broker: {0}")]
    Connect(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Publish to {topic} failed: {reason}")]
    Failed { topic: String, reason: String },
}
