//! Single-item worker: pop one item, run the handler, retry or discard.
//!
//! Each worker is one tokio task polling the shared queue. Cancellation is
//! cooperative: the stop signal is checked at the top of every iteration and
//! cuts an idle sleep short, but an in-flight handler always runs to
//! completion.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::handler::{Handler, WastedRetriesHandler, error_sources, panic_message};
use crate::model::{HandlerError, Requeue, WorkItem};
use crate::queue::Queue;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_outcome, start_item_span, start_worker_span};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters shared by all workers of a list.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed_attempts: AtomicU64,
    retried: AtomicU64,
    wasted: AtomicU64,
    panics: AtomicU64,
    batches: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Items handed to a handler (batch items count individually).
    pub processed: u64,
    pub succeeded: u64,
    pub failed_attempts: u64,
    pub retried: u64,
    pub wasted: u64,
    pub panics: u64,
    pub batches: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            wasted: self.wasted.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add_processed(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_succeeded(&self, n: u64) {
        self.succeeded.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_failed(&self, n: u64) {
        self.failed_attempts.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a worker needs besides its handler. Cheap to clone.
pub struct WorkerContext<P> {
    pub queue: Arc<Queue<P>>,
    pub max_retries: u32,
    pub requeue: Requeue,
    /// Wait after observing an empty queue.
    pub sleep_time: Duration,
    pub wasted: Option<WastedRetriesHandler<P>>,
    pub stats: Arc<WorkerStats>,
    /// Parent span for worker tasks.
    pub span: Span,
}

impl<P> Clone for WorkerContext<P> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            max_retries: self.max_retries,
            requeue: self.requeue,
            sleep_time: self.sleep_time,
            wasted: self.wasted.clone(),
            stats: Arc::clone(&self.stats),
            span: self.span.clone(),
        }
    }
}

impl<P: Clone + Send + Sync + 'static> WorkerContext<P> {
    pub fn new(queue: Arc<Queue<P>>, max_retries: u32, sleep_time: Duration) -> Self {
        Self {
            queue,
            max_retries,
            requeue: Requeue::default(),
            sleep_time,
            wasted: None,
            stats: Arc::new(WorkerStats::default()),
            span: Span::current(),
        }
    }

    pub fn with_requeue(mut self, requeue: Requeue) -> Self {
        self.requeue = requeue;
        self
    }

    pub fn with_wasted_handler(mut self, wasted: WastedRetriesHandler<P>) -> Self {
        self.wasted = Some(wasted);
        self
    }

    fn labels(&self) -> [KeyValue; 1] {
        [KeyValue::new("worklist", self.queue.name().to_string())]
    }

    /// Apply the retry policy to an item whose attempt failed: resubmit it
    /// with a bumped retry count, or hand it to the wasted-retries handler.
    /// Returns whether the item went back into the queue.
    pub(crate) async fn retry_or_discard(
        &self,
        mut item: WorkItem<P>,
        error: &HandlerError,
    ) -> bool {
        if item.can_retry(self.max_retries) {
            item.retry_count += 1;
            let resubmit = item.clone();
            let requeued = match self.requeue {
                Requeue::Back => self.queue.add_item(resubmit),
                Requeue::Next => self.queue.add_next(resubmit),
            };
            match requeued {
                Ok(()) => {
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    metrics::items_retried().add(1, &self.labels());
                    debug!(
                        id = %item.id,
                        retry_count = item.retry_count,
                        max_retries = self.max_retries,
                        %error,
                        "item requeued"
                    );
                    return true;
                }
                Err(e) => {
                    warn!(id = %item.id, error = %e, "could not requeue item, discarding");
                }
            }
        }
        self.discard(item, error).await;
        false
    }

    async fn discard(&self, item: WorkItem<P>, error: &HandlerError) {
        self.stats.wasted.fetch_add(1, Ordering::Relaxed);
        metrics::items_wasted().add(1, &self.labels());
        error!(
            id = %item.id,
            retry_count = item.retry_count,
            %error,
            error_source = %error_sources(error),
            "item exhausted its retries"
        );

        let Some(wasted) = &self.wasted else {
            return;
        };
        let outcome = AssertUnwindSafe(async { wasted(item.id.clone(), item.payload).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(id = %item.id, error = %e, "wasted-retries handler failed"),
            Err(panic) => error!(
                id = %item.id,
                panic = %panic_message(panic.as_ref()),
                "wasted-retries handler panicked"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Lifecycle of a worker. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    Stopped,
}

/// Spawn/stop bookkeeping shared by [`Worker`] and
/// [`BulkWorker`](crate::bulk::BulkWorker).
pub(crate) struct TaskControl {
    state: Mutex<WorkerState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TaskControl {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState::Idle),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move Idle -> Running by spawning the future built from the stop token.
    pub(crate) fn spawn<F>(
        &self,
        id: &str,
        make: impl FnOnce(CancellationToken) -> F,
    ) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != WorkerState::Idle {
            return Err(Error::AlreadyStarted(id.to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let handle = runtime.spawn(make(self.cancel.clone()));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        *state = WorkerState::Running;
        Ok(())
    }

    pub(crate) fn stop(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = WorkerState::Stopped;
        self.cancel.cancel();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    pub(crate) async fn join(&self, id: &str) {
        self.stop();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(task) = task else {
            return;
        };
        if let Err(e) = task.await {
            if e.is_panic() {
                error!(worker = id, "worker task panicked");
            } else {
                warn!(worker = id, "worker task cancelled: {e}");
            }
        }
    }
}

/// Handle to a single-item consumer task.
pub struct Worker<P> {
    id: String,
    ctx: WorkerContext<P>,
    handler: Handler<P>,
    control: TaskControl,
}

impl<P: Clone + Send + Sync + 'static> Worker<P> {
    pub fn new(id: impl Into<String>, ctx: WorkerContext<P>, handler: Handler<P>) -> Self {
        Self {
            id: id.into(),
            ctx,
            handler,
            control: TaskControl::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        self.control.state()
    }

    /// True between `start` and `stop`.
    pub fn started(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Spawn the background task. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let span = start_worker_span(&self.ctx.span, &self.id);
        let ctx = self.ctx.clone();
        let handler = Arc::clone(&self.handler);
        self.control
            .spawn(&self.id, |cancel| run(ctx, handler, cancel).instrument(span))
    }

    /// Signal the task to exit after its current iteration. Does not wait.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Whether the background task has actually exited.
    pub fn is_finished(&self) -> bool {
        self.control.is_finished()
    }

    /// Stop and wait for the task to exit.
    pub async fn join(&self) {
        self.control.join(&self.id).await;
    }
}

async fn run<P: Clone + Send + Sync + 'static>(
    ctx: WorkerContext<P>,
    handler: Handler<P>,
    cancel: CancellationToken,
) {
    info!("worker started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match ctx.queue.remove() {
            Some(item) => process(&ctx, &handler, item).await,
            None => idle(ctx.sleep_time, &cancel).await,
        }
    }
    info!("worker stopped");
}

/// Wait out an empty queue. Returns early once the worker is stopped.
pub(crate) async fn idle(sleep_time: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(sleep_time) => {}
    }
}

async fn process<P: Clone + Send + Sync + 'static>(
    ctx: &WorkerContext<P>,
    handler: &Handler<P>,
    item: WorkItem<P>,
) {
    let span = start_item_span(ctx.queue.name(), &item.id, item.retry_count);
    let started = Instant::now();

    // The call itself sits inside the async block so a panic raised before
    // the handler's first await is caught too.
    let outcome = AssertUnwindSafe(async { handler(item.id.clone(), item.payload.clone()).await })
        .catch_unwind()
        .instrument(span.clone())
        .await;

    let labels = ctx.labels();
    metrics::handler_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &labels);
    ctx.stats.add_processed(1);

    let (error, result) = match outcome {
        Ok(Ok(())) => {
            ctx.stats.add_succeeded(1);
            processed_metric(&labels, "ok");
            record_outcome(&span, "completed");
            return;
        }
        Ok(Err(e)) => (e, "error"),
        Err(panic) => {
            ctx.stats.add_panic();
            let message = panic_message(panic.as_ref());
            span.in_scope(|| error!(panic = %message, "handler panicked"));
            (HandlerError::new(format!("handler panicked: {message}")), "panic")
        }
    };

    ctx.stats.add_failed(1);
    processed_metric(&labels, result);
    let requeued = ctx.retry_or_discard(item, &error).instrument(span.clone()).await;
    record_outcome(&span, if requeued { "retried" } else { "wasted" });
}

pub(crate) fn processed_metric(labels: &[KeyValue; 1], result: &'static str) {
    let mut attrs = labels.to_vec();
    attrs.push(KeyValue::new("result", result));
    metrics::items_processed().add(1, &attrs);
}
