//! Work list span helpers.
//!
//! Every work list owns a span; worker tasks run inside a child of it, and
//! each handler invocation gets its own item span.

use tracing::Span;

use crate::model::Mode;

/// Span owned by a work list for its whole lifetime.
pub fn start_worklist_span(name: &str, mode: Mode) -> Span {
    tracing::info_span!("worklist", "worklist.name" = name, "worklist.mode" = %mode)
}

/// Span for one background worker task, parented to its list's span.
pub fn start_worker_span(parent: &Span, worker_id: &str) -> Span {
    tracing::info_span!(parent: parent, "worker", "worker.id" = worker_id)
}

/// Start a span for a single handler invocation.
///
/// The `work.outcome` field is declared empty and is filled in by
/// [`record_outcome`].
pub fn start_item_span(worklist: &str, work_id: &str, retry_count: u32) -> Span {
    tracing::info_span!(
        "work.process",
        "worklist.name" = worklist,
        "work.id" = work_id,
        "work.retry_count" = retry_count,
        "work.outcome" = tracing::field::Empty,
    )
}

/// Record how an attempt ended ("completed", "retried", "wasted").
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("work.outcome", outcome);
    span.in_scope(|| {
        tracing::debug!(outcome = outcome, "work_outcome");
    });
}
