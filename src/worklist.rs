//! Work list: one queue, a pool of competing workers, and the lifecycle the
//! manager drives.
//!
//! Every worker of a list reads and writes the same [`Queue`]; the queue's
//! lock is the only synchronization between producers and consumers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{Span, debug, info};

use crate::bulk::BulkWorker;
use crate::config::WorkListConfig;
use crate::error::{Error, Result};
use crate::handler::{BatchHandler, Handler, RecoveryHandler, WastedRetriesHandler};
use crate::manager::Lifecycle;
use crate::queue::Queue;
use crate::telemetry::work::start_worklist_span;
use crate::worker::{StatsSnapshot, Worker, WorkerContext, WorkerStats};

/// Which kind of consumer the list runs.
pub enum WorkListKind<P> {
    Single(Handler<P>),
    Bulk(BatchHandler<P>),
}

impl<P> Clone for WorkListKind<P> {
    fn clone(&self) -> Self {
        match self {
            WorkListKind::Single(h) => WorkListKind::Single(Arc::clone(h)),
            WorkListKind::Bulk(h) => WorkListKind::Bulk(Arc::clone(h)),
        }
    }
}

enum Member<P> {
    Single(Worker<P>),
    Bulk(BulkWorker<P>),
}

impl<P: Clone + Send + Sync + 'static> Member<P> {
    fn start(&self) -> Result<()> {
        match self {
            Member::Single(w) => w.start(),
            Member::Bulk(w) => w.start(),
        }
    }

    fn stop(&self) {
        match self {
            Member::Single(w) => w.stop(),
            Member::Bulk(w) => w.stop(),
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            Member::Single(w) => w.is_finished(),
            Member::Bulk(w) => w.is_finished(),
        }
    }

    async fn join(&self) {
        match self {
            Member::Single(w) => w.join().await,
            Member::Bulk(w) => w.join().await,
        }
    }
}

struct Pool<P> {
    running: Option<Vec<Member<P>>>,
    /// Signalled but not yet joined.
    stopping: Vec<Member<P>>,
}

/// Coordinator owning a queue and its worker pool.
pub struct WorkList<P> {
    config: WorkListConfig,
    queue: Arc<Queue<P>>,
    kind: WorkListKind<P>,
    wasted: Option<WastedRetriesHandler<P>>,
    recovery: Option<RecoveryHandler<P>>,
    stats: Arc<WorkerStats>,
    span: Span,
    pool: Mutex<Pool<P>>,
}

impl<P: Clone + Send + Sync + 'static> WorkList<P> {
    pub fn builder(config: WorkListConfig) -> WorkListBuilder<P> {
        WorkListBuilder {
            config,
            kind: None,
            wasted: None,
            recovery: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &WorkListConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<Queue<P>> {
        &self.queue
    }

    pub fn is_bulk(&self) -> bool {
        self.config.bulk
    }

    pub fn size(&self) -> usize {
        self.queue.size()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn dump(&self) -> String {
        self.queue.dump()
    }

    fn pool(&self) -> MutexGuard<'_, Pool<P>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue work. Never blocks; a full queue is reported as
    /// [`Error::QueueFull`].
    pub fn add_work(&self, id: impl Into<String>, payload: P) -> Result<()> {
        self.queue.add(id, payload)
    }

    /// Spawn `max_workers` workers. A no-op when already started.
    ///
    /// Fails with [`Error::Stopping`] while workers from a previous run are
    /// still finishing, so the pool never exceeds `max_workers`; call
    /// [`shutdown`](Self::shutdown) first to wait for them.
    pub fn start(&self) -> Result<()> {
        let mut pool = self.pool();
        if pool.running.is_some() {
            return Ok(());
        }
        pool.stopping.retain(|m| !m.is_finished());
        if !pool.stopping.is_empty() {
            return Err(Error::Stopping(self.config.name.clone()));
        }

        let ctx = self.worker_context();
        let members: Vec<Member<P>> = (0..self.config.max_workers)
            .map(|n| self.member(format!("{}-{n}", self.config.name), ctx.clone()))
            .collect();

        let failed = members
            .iter()
            .enumerate()
            .find_map(|(n, member)| member.start().err().map(|e| (n, e)));
        if let Some((n, e)) = failed {
            for member in &members[..n] {
                member.stop();
            }
            pool.stopping.extend(members);
            return Err(e);
        }

        self.span.in_scope(|| {
            info!(
                workers = self.config.max_workers,
                bulk = self.is_bulk(),
                "work list started"
            )
        });
        pool.running = Some(members);
        Ok(())
    }

    /// Signal every worker to stop. Does not wait or drain the queue.
    /// A no-op when not started.
    pub fn stop(&self) -> Result<()> {
        let mut pool = self.pool();
        let Some(members) = pool.running.take() else {
            return Ok(());
        };
        for member in &members {
            member.stop();
        }
        pool.stopping.retain(|m| !m.is_finished());
        pool.stopping.extend(members);
        self.span.in_scope(|| {
            info!(remaining = self.queue.size(), "work list stopped");
        });
        Ok(())
    }

    pub fn started(&self) -> bool {
        self.pool().running.is_some()
    }

    /// Stop, then wait until every worker task has exited.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop()?;
        let members = std::mem::take(&mut self.pool().stopping);
        for member in &members {
            member.join().await;
        }
        self.span
            .in_scope(|| debug!(workers = members.len(), "work list shut down"));
        Ok(())
    }

    fn worker_context(&self) -> WorkerContext<P> {
        WorkerContext {
            queue: Arc::clone(&self.queue),
            max_retries: self.config.max_retries,
            requeue: self.config.requeue,
            sleep_time: self.config.sleep_time,
            wasted: self.wasted.clone(),
            stats: Arc::clone(&self.stats),
            span: self.span.clone(),
        }
    }

    fn member(&self, id: String, ctx: WorkerContext<P>) -> Member<P> {
        match &self.kind {
            WorkListKind::Single(handler) => {
                Member::Single(Worker::new(id, ctx, Arc::clone(handler)))
            }
            WorkListKind::Bulk(handler) => {
                let mut worker =
                    BulkWorker::new(id, ctx, Arc::clone(handler), self.config.max_batch_size);
                if let Some(recovery) = &self.recovery {
                    worker = worker.with_recovery_handler(Arc::clone(recovery));
                }
                Member::Bulk(worker)
            }
        }
    }
}

impl<P: Clone + Send + Sync + 'static> Lifecycle for WorkList<P> {
    fn name(&self) -> &str {
        WorkList::name(self)
    }

    fn start(&self) -> Result<()> {
        WorkList::start(self)
    }

    fn stop(&self) -> Result<()> {
        WorkList::stop(self)
    }

    fn started(&self) -> bool {
        WorkList::started(self)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`WorkList`] from its config and callbacks.
pub struct WorkListBuilder<P> {
    config: WorkListConfig,
    kind: Option<WorkListKind<P>>,
    wasted: Option<WastedRetriesHandler<P>>,
    recovery: Option<RecoveryHandler<P>>,
}

impl<P: Clone + Send + Sync + 'static> WorkListBuilder<P> {
    /// Run single-item workers with this handler.
    pub fn handler(mut self, handler: Handler<P>) -> Self {
        self.kind = Some(WorkListKind::Single(handler));
        self
    }

    /// Run bulk workers with this batch handler.
    pub fn batch_handler(mut self, handler: BatchHandler<P>) -> Self {
        self.kind = Some(WorkListKind::Bulk(handler));
        self
    }

    pub fn wasted_retries_handler(mut self, handler: WastedRetriesHandler<P>) -> Self {
        self.wasted = Some(handler);
        self
    }

    /// Only consulted by bulk lists.
    pub fn recovery_handler(mut self, handler: RecoveryHandler<P>) -> Self {
        self.recovery = Some(handler);
        self
    }

    pub fn build(mut self) -> Result<WorkList<P>> {
        self.config.validate()?;
        let kind = self.kind.ok_or_else(|| {
            Error::Config(format!(
                "work list {}: a handler or batch handler is required",
                self.config.name
            ))
        })?;
        let bulk = matches!(kind, WorkListKind::Bulk(_));
        if self.config.bulk && !bulk {
            return Err(Error::Config(format!(
                "work list {}: configured as bulk but given a single-item handler",
                self.config.name
            )));
        }
        self.config.bulk = bulk;

        let span = start_worklist_span(&self.config.name, self.config.mode);
        let queue = Queue::new(
            self.config.name.clone(),
            self.config.mode,
            self.config.capacity,
        );

        Ok(WorkList {
            config: self.config,
            queue: Arc::new(queue),
            kind,
            wasted: self.wasted,
            recovery: self.recovery,
            stats: Arc::new(WorkerStats::default()),
            span,
            pool: Mutex::new(Pool {
                running: None,
                stopping: Vec::new(),
            }),
        })
    }
}
