//! Batch worker: drain up to `max_batch_size` items, run one batch handler.
//!
//! A failed batch applies the retry policy to each of its items on its own.
//! A panicking batch handler is caught; its batch is dropped, the list's
//! recovery handler gets the remaining queue and the dropped items, and the
//! loop keeps going.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info};

use crate::error::Result;
use crate::handler::{BatchHandler, RecoveryHandler, panic_message};
use crate::model::{Requeue, WorkItem};
use crate::queue::Queue;
use crate::telemetry::metrics;
use crate::telemetry::work::start_worker_span;
use crate::worker::{TaskControl, WorkerContext, WorkerState, idle, processed_metric};

/// Handle to a batch consumer task.
pub struct BulkWorker<P> {
    id: String,
    ctx: WorkerContext<P>,
    handler: BatchHandler<P>,
    max_batch_size: usize,
    recovery: Option<RecoveryHandler<P>>,
    control: TaskControl,
}

impl<P: Clone + Send + Sync + 'static> BulkWorker<P> {
    pub fn new(
        id: impl Into<String>,
        ctx: WorkerContext<P>,
        handler: BatchHandler<P>,
        max_batch_size: usize,
    ) -> Self {
        Self {
            id: id.into(),
            ctx,
            handler,
            max_batch_size: max_batch_size.max(1),
            recovery: None,
            control: TaskControl::new(),
        }
    }

    pub fn with_recovery_handler(mut self, recovery: RecoveryHandler<P>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        self.control.state()
    }

    pub fn started(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Spawn the background task. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let span = start_worker_span(&self.ctx.span, &self.id);
        let batch = BatchLoop {
            ctx: self.ctx.clone(),
            handler: Arc::clone(&self.handler),
            max_batch_size: self.max_batch_size,
            recovery: self.recovery.clone(),
        };
        self.control
            .spawn(&self.id, |cancel| batch.run(cancel).instrument(span))
    }

    /// Signal the task to exit after its current batch. Does not wait.
    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.control.is_finished()
    }

    /// Stop and wait for the task to exit.
    pub async fn join(&self) {
        self.control.join(&self.id).await;
    }
}

/// State moved into the spawned task.
struct BatchLoop<P> {
    ctx: WorkerContext<P>,
    handler: BatchHandler<P>,
    max_batch_size: usize,
    recovery: Option<RecoveryHandler<P>>,
}

impl<P: Clone + Send + Sync + 'static> BatchLoop<P> {
    async fn run(self, cancel: CancellationToken) {
        info!(max_batch_size = self.max_batch_size, "bulk worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let batch = self.drain();
            if batch.is_empty() {
                idle(self.ctx.sleep_time, &cancel).await;
                continue;
            }
            self.process(batch).await;
        }
        info!("bulk worker stopped");
    }

    fn drain(&self) -> Vec<WorkItem<P>> {
        let mut batch = Vec::with_capacity(self.max_batch_size);
        while batch.len() < self.max_batch_size {
            match self.ctx.queue.remove() {
                Some(item) => batch.push(item),
                None => break,
            }
        }
        batch
    }

    async fn process(&self, batch: Vec<WorkItem<P>>) {
        let size = batch.len() as u64;
        let labels = [KeyValue::new("worklist", self.ctx.queue.name().to_string())];
        let started = Instant::now();
        debug!(size, "processing batch");

        let outcome = AssertUnwindSafe(async { (self.handler)(batch.clone()).await })
            .catch_unwind()
            .await;

        metrics::handler_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &labels);
        self.ctx.stats.add_batch();
        self.ctx.stats.add_processed(size);

        match outcome {
            Ok(Ok(())) => {
                self.ctx.stats.add_succeeded(size);
                processed_metric(&labels, "ok");
            }
            Ok(Err(e)) => {
                self.ctx.stats.add_failed(size);
                processed_metric(&labels, "error");
                debug!(size, error = %e, "batch failed");
                // Front insertion reverses order, so walk the batch backwards
                // to keep its items in their original relative order.
                let items: Vec<WorkItem<P>> = match self.ctx.requeue {
                    Requeue::Next => batch.into_iter().rev().collect(),
                    Requeue::Back => batch,
                };
                for item in items {
                    self.ctx.retry_or_discard(item, &e).await;
                }
            }
            Err(panic) => {
                self.ctx.stats.add_panic();
                processed_metric(&labels, "panic");
                metrics::batch_panics().add(1, &labels);
                let ids: Vec<&str> = batch.iter().map(|item| item.id.as_str()).collect();
                error!(
                    size,
                    ?ids,
                    panic = %panic_message(panic.as_ref()),
                    "batch handler panicked, batch dropped"
                );
                self.recover(&batch);
            }
        }
    }

    fn recover(&self, dropped: &[WorkItem<P>]) {
        let Some(recovery) = &self.recovery else {
            return;
        };
        let queue: &Queue<P> = &self.ctx.queue;
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| recovery(queue, dropped)));
        if let Err(panic) = outcome {
            error!(
                panic = %panic_message(panic.as_ref()),
                "recovery handler panicked"
            );
        }
    }
}
