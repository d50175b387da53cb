//! Error types for workq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("work item already queued: {0}")]
    DuplicateId(String),

    #[error("already started: {0}")]
    AlreadyStarted(String),

    #[error("still stopping: {0}")]
    Stopping(String),

    #[error("no tokio runtime available to spawn workers")]
    NoRuntime,

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
