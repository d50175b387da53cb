//! # workq
//!
//! Bounded in-memory work lists: a FIFO or LIFO queue shared by a pool of
//! background workers, with per-item retries, batch processing and panic
//! recovery.
//!
//! Producers call [`WorkList::add_work`]; workers pop items, run the
//! caller's handler and either drop the item, resubmit it, or hand it to a
//! wasted-retries handler once its retry budget is spent.

pub mod bulk;
pub mod config;
pub mod error;
pub mod handler;
pub mod manager;
pub mod model;
pub mod queue;
pub mod telemetry;
pub mod worker;
pub mod worklist;

pub use error::{Error, Result};
pub use worklist::{WorkList, WorkListBuilder};
