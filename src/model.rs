//! Core data model.
//!
//! A work item is an opaque payload with a caller-chosen identity and a retry
//! counter. Items live in a [`Queue`](crate::queue::Queue) until a worker
//! either completes them or gives up on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// Caller-chosen identity of a work item. Unique while the item is queued.
pub type WorkId = String;

/// A unit of work moving through a work list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem<P> {
    /// Identity, fixed for the item's lifetime.
    pub id: WorkId,

    /// Arbitrary job data. The queue never interprets it.
    pub payload: P,

    /// Number of failed attempts that led to a resubmission.
    pub retry_count: u32,

    pub created_at: DateTime<Utc>,
}

impl<P> WorkItem<P> {
    pub fn new(id: impl Into<WorkId>, payload: P) -> Self {
        Self {
            id: id.into(),
            payload,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Whether another attempt is allowed under `max_retries`.
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.retry_count < max_retries
    }
}

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Eviction policy of a queue, fixed at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Oldest item first.
    #[default]
    Fifo,
    /// Newest item first.
    Lifo,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Fifo => "fifo",
            Mode::Lifo => "lifo",
        };
        f.pad(s)
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Ok(Mode::Fifo),
            "lifo" => Ok(Mode::Lifo),
            other => Err(format!("unknown queue mode: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Requeue
// ---------------------------------------------------------------------------

/// Where a failed item goes when it is resubmitted for another attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Requeue {
    /// Normal insertion, as if freshly added under the queue's mode.
    #[default]
    Back,
    /// Placed so that it is the next item removed.
    Next,
}

// ---------------------------------------------------------------------------
// Handler errors
// ---------------------------------------------------------------------------

/// Failure reported by a caller-supplied handler. Drives the retry decision.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

pub type HandlerResult = std::result::Result<(), HandlerError>;

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying error, keeping it reachable through `source()`.
    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::with_source("handler failed", err)
    }
}
