//! Caller-supplied callbacks.
//!
//! Handlers are stored as reference-counted trait objects so every worker of
//! a list can share them. Async handlers return boxed futures; use the `*_fn`
//! constructors to wrap plain async closures.

use std::any::Any;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::model::{HandlerResult, WorkId, WorkItem};
use crate::queue::Queue;

/// Processes one item. An `Err` asks for a retry.
pub type Handler<P> = Arc<dyn Fn(WorkId, P) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Processes a whole batch. An `Err` applies the retry policy to every item
/// of the batch.
pub type BatchHandler<P> =
    Arc<dyn Fn(Vec<WorkItem<P>>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Terminal disposal of an item that used up its retries.
pub type WastedRetriesHandler<P> =
    Arc<dyn Fn(WorkId, P) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Invoked after a batch handler panics, with the list's remaining queue and
/// the batch that was dropped.
pub type RecoveryHandler<P> = Arc<dyn Fn(&Queue<P>, &[WorkItem<P>]) + Send + Sync>;

pub fn handler_fn<P, F, Fut>(f: F) -> Handler<P>
where
    F: Fn(WorkId, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |id, payload| f(id, payload).boxed())
}

pub fn batch_handler_fn<P, F, Fut>(f: F) -> BatchHandler<P>
where
    F: Fn(Vec<WorkItem<P>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |batch| f(batch).boxed())
}

pub fn wasted_fn<P, F, Fut>(f: F) -> WastedRetriesHandler<P>
where
    F: Fn(WorkId, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |id, payload| f(id, payload).boxed())
}

pub fn recovery_fn<P, F>(f: F) -> RecoveryHandler<P>
where
    F: Fn(&Queue<P>, &[WorkItem<P>]) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Sources of an error, outermost first, joined for a log field.
pub(crate) fn error_sources(err: &dyn std::error::Error) -> String {
    let mut sources = Vec::new();
    let mut next = err.source();
    while let Some(source) = next {
        sources.push(source.to_string());
        next = source.source();
    }
    sources.join(": ")
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or(panic.downcast_ref::<&str>().copied())
        .unwrap_or("non-string panic payload")
        .to_string()
}
