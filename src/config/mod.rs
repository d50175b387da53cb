//! Typed configuration.
//!
//! [`Config`] is process-level and comes from environment variables.
//! [`WorkListConfig`] describes one work list and is immutable once the list
//! is built; several of them can be loaded from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Mode, Requeue};

// ---------------------------------------------------------------------------
// Process config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    /// TOML file with `[[worklist]]` tables.
    pub worklists_file: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables. Nothing is required.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            worklists_file: optional_var("WORKQ_CONFIG").map(PathBuf::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Work lists from [`worklists_file`](Self::worklists_file), or none if
    /// no file is configured.
    pub fn load_worklists(&self) -> Result<Vec<WorkListConfig>> {
        match &self.worklists_file {
            Some(path) => WorkListsFile::load(path).map(|file| file.worklist),
            None => Ok(Vec::new()),
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Work list config
// ---------------------------------------------------------------------------

/// Settings of a single work list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkListConfig {
    pub name: String,

    /// Number of concurrent workers sharing the queue.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Resubmissions allowed per item before it is wasted.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Upper bound on items per batch. Only used by bulk lists.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// How long a worker waits after finding the queue empty.
    #[serde(
        rename = "sleep_time_ms",
        with = "duration_ms",
        default = "default_sleep_time"
    )]
    pub sleep_time: Duration,

    #[serde(default)]
    pub mode: Mode,

    /// Maximum resident items. Zero means unbounded.
    #[serde(default)]
    pub capacity: usize,

    #[serde(default)]
    pub requeue: Requeue,

    /// Whether consumers take batches of up to `max_batch_size` items.
    /// Set automatically when a list is built with a batch handler.
    #[serde(default)]
    pub bulk: bool,
}

fn default_max_workers() -> usize {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_batch_size() -> usize {
    10
}

fn default_sleep_time() -> Duration {
    Duration::from_millis(500)
}

impl WorkListConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_workers: default_max_workers(),
            max_retries: default_max_retries(),
            max_batch_size: default_max_batch_size(),
            sleep_time: default_sleep_time(),
            mode: Mode::default(),
            capacity: 0,
            requeue: Requeue::default(),
            bulk: false,
        }
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn max_batch_size(mut self, n: usize) -> Self {
        self.max_batch_size = n;
        self
    }

    pub fn sleep_time(mut self, d: Duration) -> Self {
        self.sleep_time = d;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn capacity(mut self, n: usize) -> Self {
        self.capacity = n;
        self
    }

    pub fn requeue(mut self, requeue: Requeue) -> Self {
        self.requeue = requeue;
        self
    }

    pub fn bulk(mut self, bulk: bool) -> Self {
        self.bulk = bulk;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("work list name must not be empty".to_string()));
        }
        if self.max_workers == 0 {
            return Err(Error::Config(format!(
                "work list {}: max_workers must be at least 1",
                self.name
            )));
        }
        if self.max_batch_size == 0 {
            return Err(Error::Config(format!(
                "work list {}: max_batch_size must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// Top-level TOML wrapper: a sequence of `[[worklist]]` tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkListsFile {
    #[serde(default)]
    pub worklist: Vec<WorkListConfig>,
}

impl WorkListsFile {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad work list config: {e}")))?;
        for config in &file.worklist {
            config.validate()?;
        }
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read work list config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
