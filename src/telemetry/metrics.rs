//! Metric instrument factories for workq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workq"` meter. Without an
//! installed provider they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("workq")
}

/// Counter: items accepted by a queue (fresh adds and resubmissions).
/// Labels: `worklist`.
pub fn items_added() -> Counter<u64> {
    meter()
        .u64_counter("workq.items.added")
        .with_description("Number of items accepted by a queue")
        .build()
}

/// Counter: adds refused because the queue was at capacity.
/// Labels: `worklist`.
pub fn items_rejected() -> Counter<u64> {
    meter()
        .u64_counter("workq.items.rejected")
        .with_description("Number of adds rejected by a full queue")
        .build()
}

/// Counter: handler attempts.
/// Labels: `worklist`, `result` ("ok" | "error" | "panic").
pub fn items_processed() -> Counter<u64> {
    meter()
        .u64_counter("workq.items.processed")
        .with_description("Number of handler attempts")
        .build()
}

/// Counter: items resubmitted after a failed attempt.
/// Labels: `worklist`.
pub fn items_retried() -> Counter<u64> {
    meter()
        .u64_counter("workq.items.retried")
        .with_description("Number of items resubmitted for retry")
        .build()
}

/// Counter: items dropped after exhausting their retries.
/// Labels: `worklist`.
pub fn items_wasted() -> Counter<u64> {
    meter()
        .u64_counter("workq.items.wasted")
        .with_description("Number of items that exhausted their retries")
        .build()
}

/// Counter: batch handler panics caught by bulk workers.
/// Labels: `worklist`.
pub fn batch_panics() -> Counter<u64> {
    meter()
        .u64_counter("workq.batch.panics")
        .with_description("Number of batch handler panics")
        .build()
}

/// Bucket bounds for handler durations, from sub-millisecond in-memory
/// handlers up to a minute-long batch.
pub const HANDLER_DURATION_BOUNDARIES_MS: [f64; 14] = [
    0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 5_000.0, 15_000.0,
    60_000.0,
];

/// Histogram: handler duration in milliseconds, one sample per item
/// attempt or per batch.
/// Labels: `worklist`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workq.handler.duration_ms")
        .with_description("Handler duration in milliseconds")
        .with_unit("ms")
        .with_boundaries(HANDLER_DURATION_BOUNDARIES_MS.to_vec())
        .build()
}
