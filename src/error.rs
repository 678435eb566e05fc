//! Error types for the board core and its stores.

use std::path::PathBuf;

use thiserror::Error;

use crate::fields::Status;
use crate::task::TaskId;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for board operations.
pub type Result<T> = std::result::Result<T, BoardError>;

/// Failures reported by a query, command or change-feed implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("dependency {dependent_id} -> {dependency_id} already exists")]
    DuplicateEdge {
        dependent_id: TaskId,
        dependency_id: TaskId,
    },

    #[error("change feed closed")]
    FeedClosed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failures surfaced to callers of board operations.
#[derive(Debug, Error)]
pub enum BoardError {
    /// Expected, user-caused outcome. Never retried.
    #[error("task {task_id} cannot move to {target:?}: blocked by incomplete dependencies")]
    Blocked {
        task_id: TaskId,
        target: Status,
        blockers: Vec<TaskId>,
    },

    #[error("task {0} is not on this board")]
    TaskNotFound(TaskId),

    /// The remote command failed; the optimistic write has been rolled back.
    #[error("update of task {task_id} failed and was reverted: {source}")]
    Remote {
        task_id: TaskId,
        #[source]
        source: StoreError,
    },

    #[error("task {0} cannot depend on itself")]
    SelfDependency(TaskId),

    #[error("making {dependent_id} depend on {dependency_id} would create a cycle")]
    DependencyCycle {
        dependent_id: TaskId,
        dependency_id: TaskId,
    },

    #[error("invalid move: {0}")]
    InvalidMove(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BoardError {
    /// Whether the error is the expected dependency gate rather than a fault.
    pub fn is_blocked(&self) -> bool {
        matches!(self, BoardError::Blocked { .. })
    }
}

/// Failures loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid log filter: {0}")]
    LogFilter(String),

    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("logging already initialised: {0}")]
    LogInit(String),
}
