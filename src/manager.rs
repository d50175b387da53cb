//! Lifecycle contract and a registry of named work lists.
//!
//! The registry is what an embedding service holds on to: it starts every
//! registered list at boot and stops them on shutdown.

use std::sync::Arc;

use tracing::{error, info};

use crate::error::{Error, Result};

/// Start/stop contract a work list exposes to its owner.
pub trait Lifecycle: Send + Sync {
    fn name(&self) -> &str;
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn started(&self) -> bool;
}

/// Lifecycles indexed by name, kept in registration order.
#[derive(Default)]
pub struct Registry {
    entries: Vec<Arc<dyn Lifecycle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a lifecycle. Names must be unique.
    pub fn register(&mut self, lifecycle: Arc<dyn Lifecycle>) -> Result<()> {
        if self.get(lifecycle.name()).is_some() {
            return Err(Error::Config(format!(
                "work list already registered: {}",
                lifecycle.name()
            )));
        }
        self.entries.push(lifecycle);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Lifecycle>> {
        self.entries.iter().find(|e| e.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start everything in registration order, stopping at the first error.
    pub fn start_all(&self) -> Result<()> {
        for entry in &self.entries {
            entry.start()?;
            info!(worklist = entry.name(), "started");
        }
        Ok(())
    }

    /// Stop everything. Keeps going past failures and returns the first one.
    pub fn stop_all(&self) -> Result<()> {
        let mut first_err = None;
        for entry in &self.entries {
            if let Err(e) = entry.stop() {
                error!(worklist = entry.name(), error = %e, "stop failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
