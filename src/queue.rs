//! Ordered, id-indexed, capacity-bounded work queue.
//!
//! Items are kept in an arena-backed doubly linked list: every node lives in a
//! slot of a `Vec`, neighbours are slot indices, and a `HashMap` maps each
//! resident id to its slot. This gives O(1) insertion at either end, O(1)
//! eviction from either end and O(1) removal of an arbitrary id.
//!
//! New items are always linked at the tail. A FIFO queue evicts from the head
//! and a LIFO queue from the tail. All access goes through a single mutex
//! that is never held across a handler call.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::model::{Mode, WorkId, WorkItem};
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Node<P> {
    item: WorkItem<P>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// The linked list proper. Only ever touched with the queue lock held.
#[derive(Debug)]
struct Slots<P> {
    nodes: Vec<Option<Node<P>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: HashMap<WorkId, usize>,
}

impl<P> Slots<P> {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            index: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn alloc(&mut self, node: Node<P>) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node<P> {
        match self.nodes[slot].as_mut() {
            Some(node) => node,
            None => unreachable!("linked slot {slot} is vacant"),
        }
    }

    fn push_back(&mut self, item: WorkItem<P>) {
        let id = item.id.clone();
        let old_tail = self.tail;
        let slot = self.alloc(Node {
            item,
            prev: old_tail,
            next: None,
        });
        match old_tail {
            Some(t) => self.node_mut(t).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.index.insert(id, slot);
    }

    fn push_front(&mut self, item: WorkItem<P>) {
        let id = item.id.clone();
        let old_head = self.head;
        let slot = self.alloc(Node {
            item,
            prev: None,
            next: old_head,
        });
        match old_head {
            Some(h) => self.node_mut(h).prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
        self.index.insert(id, slot);
    }

    /// Detach the node in `slot`, free the slot and hand back its item.
    fn unlink(&mut self, slot: usize) -> WorkItem<P> {
        let node = match self.nodes[slot].take() {
            Some(node) => node,
            None => unreachable!("unlinking vacant slot {slot}"),
        };
        match node.prev {
            Some(p) => self.node_mut(p).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.node_mut(n).prev = node.prev,
            None => self.tail = node.prev,
        }
        self.free.push(slot);
        self.index.remove(&node.item.id);
        node.item
    }

    fn pop_front(&mut self) -> Option<WorkItem<P>> {
        self.head.map(|slot| self.unlink(slot))
    }

    fn pop_back(&mut self) -> Option<WorkItem<P>> {
        self.tail.map(|slot| self.unlink(slot))
    }

    fn remove_id(&mut self, id: &str) -> Option<WorkItem<P>> {
        let slot = *self.index.get(id)?;
        Some(self.unlink(slot))
    }

    /// Ids from head to tail.
    fn ids(&self) -> Vec<WorkId> {
        let mut ids = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let Some(node) = self.nodes[slot].as_ref() else {
                break;
            };
            ids.push(node.item.id.clone());
            cursor = node.next;
        }
        ids
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Diagnostic view of a queue, produced by [`Queue::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub mode: Mode,
    /// Zero means unbounded.
    pub capacity: usize,
    pub size: usize,
    /// Resident ids in eviction order.
    pub ids: Vec<WorkId>,
}

/// The shared queue of a work list.
#[derive(Debug)]
pub struct Queue<P> {
    name: String,
    mode: Mode,
    capacity: usize,
    slots: Mutex<Slots<P>>,
}

impl<P> Queue<P> {
    /// Create an empty queue. A `capacity` of zero means unbounded.
    pub fn new(name: impl Into<String>, mode: Mode, capacity: usize) -> Self {
        Self {
            name: name.into(),
            mode,
            capacity,
            slots: Mutex::new(Slots::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<P>> {
        // Nothing panics while the lock is held, but a poisoned list is
        // still structurally sound, so keep serving it.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue a fresh item built from `id` and `payload`.
    pub fn add(&self, id: impl Into<WorkId>, payload: P) -> Result<()> {
        self.add_item(WorkItem::new(id, payload))
    }

    /// Enqueue an existing item, keeping its retry count.
    pub fn add_item(&self, item: WorkItem<P>) -> Result<()> {
        self.insert(item, false)
    }

    /// Enqueue an item so that it is the next one [`remove`](Self::remove)
    /// returns.
    pub fn add_next(&self, item: WorkItem<P>) -> Result<()> {
        self.insert(item, true)
    }

    fn insert(&self, item: WorkItem<P>, next: bool) -> Result<()> {
        let labels = [KeyValue::new("worklist", self.name.clone())];
        let mut slots = self.lock();

        if self.capacity > 0 && slots.len() >= self.capacity {
            drop(slots);
            metrics::items_rejected().add(1, &labels);
            debug!(queue = %self.name, id = %item.id, capacity = self.capacity, "queue full");
            return Err(Error::QueueFull {
                capacity: self.capacity,
            });
        }
        if slots.index.contains_key(&item.id) {
            return Err(Error::DuplicateId(item.id));
        }

        trace!(queue = %self.name, id = %item.id, retry_count = item.retry_count, "enqueue");
        match (next, self.mode) {
            (false, _) | (true, Mode::Lifo) => slots.push_back(item),
            (true, Mode::Fifo) => slots.push_front(item),
        }
        drop(slots);

        metrics::items_added().add(1, &labels);
        Ok(())
    }

    /// Evict one item according to the queue's mode. `None` when empty.
    pub fn remove(&self) -> Option<WorkItem<P>> {
        let mut slots = self.lock();
        match self.mode {
            Mode::Fifo => slots.pop_front(),
            Mode::Lifo => slots.pop_back(),
        }
    }

    /// Remove specific items wherever they sit. Ids that are not resident
    /// are skipped; the result follows the order of `ids`.
    pub fn remove_by_ids<S: AsRef<str>>(&self, ids: &[S]) -> Vec<WorkItem<P>> {
        let mut slots = self.lock();
        ids.iter()
            .filter_map(|id| slots.remove_id(id.as_ref()))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().index.contains_key(id)
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Resident ids in the order [`remove`](Self::remove) would return them.
    pub fn peek_ids(&self) -> Vec<WorkId> {
        let mut ids = self.lock().ids();
        if self.mode == Mode::Lifo {
            ids.reverse();
        }
        ids
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let ids = self.peek_ids();
        QueueSnapshot {
            name: self.name.clone(),
            mode: self.mode,
            capacity: self.capacity,
            size: ids.len(),
            ids,
        }
    }

    /// JSON rendering of [`snapshot`](Self::snapshot). Payloads are omitted.
    pub fn dump(&self) -> String {
        let snapshot = self.snapshot();
        serde_json::to_string(&snapshot).unwrap_or_else(|e| {
            format!(
                "queue {} ({}, size {}): dump failed: {e}",
                snapshot.name, snapshot.mode, snapshot.size
            )
        })
    }
}
