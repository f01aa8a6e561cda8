//! Per-shard operation admission
//!
//! Every shard owns one `ContainerShardExecutor`. It decides *when* an
//! operation may run; the shared `WorkerPool` runs it.
//!
//! # Key operations
//!
//! Key operations wait in one FIFO queue and drive a small state machine:
//! `Idle`, `Exclusive` (one write or delete) or `Multiple(n)` (n concurrent
//! reads). A read at the head joins running reads; a write or delete at the
//! head waits until the state is back to `Idle`, and reads queued behind it
//! wait too.
//!
//! # Value operations
//!
//! Value operations bypass the key queue and are tracked per value id:
//! - a read of a value that is being deleted, or whose delete is waiting,
//!   is cancelled without running
//! - a delete of a value with live readers waits until the last reader
//!   finishes
//! - a delete arriving while the same id is being freed targets a chain that
//!   reused the id, and runs once the first delete is done
//! - writes always target fresh ids and are never held back
//!
//! # Completion
//!
//! An operation's outcome goes to a `Completion`. `Then` continuations run
//! while the operation still holds its slot, so follow-up operations they
//! admit are ordered before anything the slot was blocking. Value deletes are
//! the exception and release their slot first. Promises are completed after
//! the slot is released. Autonomous operations have nobody
//! waiting; their failures are logged and counted.
//!
//! # Shutdown
//!
//! After `shutdown`, operations admitted with `fail_in_shutdown` fail with
//! `Interrupted`; everything else, including what is already queued, drains
//! normally. `wait_for_shutdown` returns once the executor is idle.

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tessera_core::{Error, Result};
use tracing::{debug, warn};

use crate::cleanup::CleanupManager;
use crate::operation::{promise, OperationHandle, Promise};
use crate::pool::{TaskPriority, WorkerPool};

/// What a key operation does to the key index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOperationKind {
    /// Lookup or listing; may run alongside other reads
    Read,
    /// Insert or update; runs alone
    Write,
    /// Removal; runs alone
    Delete,
}

impl KeyOperationKind {
    fn is_exclusive(self) -> bool {
        !matches!(self, KeyOperationKind::Read)
    }
}

/// What a value operation does, and to which value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOperation {
    /// Read value `id`
    Read(u64),
    /// Write a new value
    Write,
    /// Free value `id`
    Delete(u64),
}

/// Admission state of the key index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Nothing running
    Idle,
    /// One write or delete running
    Exclusive,
    /// This many reads running
    Multiple(usize),
}

/// Where an operation's outcome goes.
pub enum Completion<T> {
    /// Complete a promise after the slot is released
    Promise(Promise<T>),
    /// Run a continuation while the slot is still held
    Then(Box<dyn FnOnce(Result<T>) + Send>),
    /// Nobody waits; failures are logged with this label and counted
    Autonomous(&'static str),
}

impl<T> Completion<T> {
    /// Continuation completion
    pub fn then(f: impl FnOnce(Result<T>) + Send + 'static) -> Self {
        Completion::Then(Box::new(f))
    }
}

/// Snapshot of an executor's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Key operations waiting for admission
    pub queued_key_operations: usize,
    /// Current key state
    pub key_state: KeyState,
    /// Values being freed
    pub running_deletes: usize,
    /// Value deletes waiting for readers
    pub waiting_deletes: usize,
    /// Value deletes queued behind a running delete of the same id
    pub queued_deletes: usize,
    /// Values with live readers
    pub reading_values: usize,
    /// Value writes in flight
    pub running_writes: usize,
    /// Failed autonomous operations since creation
    pub autonomous_failures: u64,
}

trait Runnable: Send {
    fn run(self: Box<Self>, executor: &ContainerShardExecutor, slot: SlotGuard);
    fn reject(self: Box<Self>, executor: &ContainerShardExecutor, error: Error);
}

struct Operation<T> {
    body: Box<dyn FnOnce() -> Result<T> + Send>,
    completion: Completion<T>,
}

impl<T: Send + 'static> Runnable for Operation<T> {
    fn run(self: Box<Self>, executor: &ContainerShardExecutor, slot: SlotGuard) {
        let Operation { body, completion } = *self;
        let result = body();
        let slot = slot.keep_unless_delete();
        match completion {
            Completion::Then(then) => {
                then(result);
                drop(slot);
            }
            Completion::Promise(promise) => {
                drop(slot);
                promise.complete(result);
            }
            Completion::Autonomous(label) => {
                if let Err(e) = result {
                    executor.record_autonomous_failure(label, &e);
                }
                drop(slot);
            }
        }
    }

    fn reject(self: Box<Self>, executor: &ContainerShardExecutor, error: Error) {
        match self.completion {
            Completion::Then(then) => then(Err(error)),
            Completion::Promise(promise) => promise.complete(Err(error)),
            Completion::Autonomous(label) => {
                if !matches!(error, Error::Cancelled) {
                    executor.record_autonomous_failure(label, &error);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Key,
    ValueRead(u64),
    ValueWrite,
    ValueDelete(u64),
}

type Ready = Vec<(Slot, Box<dyn Runnable>)>;

struct State {
    key_queue: VecDeque<(KeyOperationKind, Box<dyn Runnable>)>,
    key_state: KeyState,
    running_deletes: FxHashSet<u64>,
    waiting_deletes: FxHashMap<u64, Box<dyn Runnable>>,
    queued_deletes: FxHashMap<u64, VecDeque<Box<dyn Runnable>>>,
    read_values: FxHashMap<u64, usize>,
    running_writes: usize,
}

impl State {
    fn is_idle(&self) -> bool {
        self.key_state == KeyState::Idle
            && self.key_queue.is_empty()
            && self.running_deletes.is_empty()
            && self.waiting_deletes.is_empty()
            && self.queued_deletes.is_empty()
            && self.read_values.is_empty()
            && self.running_writes == 0
    }

    /// Admit key operations from the head of the queue.
    fn drain_key_queue(&mut self, ready: &mut Ready) {
        while let Some((kind, _)) = self.key_queue.front() {
            let kind = *kind;
            let admitted = match (kind.is_exclusive(), self.key_state) {
                (true, KeyState::Idle) => {
                    self.key_state = KeyState::Exclusive;
                    true
                }
                (false, KeyState::Idle) => {
                    self.key_state = KeyState::Multiple(1);
                    true
                }
                (false, KeyState::Multiple(n)) => {
                    self.key_state = KeyState::Multiple(n + 1);
                    true
                }
                _ => false,
            };
            if !admitted {
                break;
            }
            if let Some((_, op)) = self.key_queue.pop_front() {
                ready.push((Slot::Key, op));
            }
            if kind.is_exclusive() {
                break;
            }
        }
    }

    fn release(&mut self, slot: Slot, ready: &mut Ready) {
        match slot {
            Slot::Key => {
                self.key_state = match self.key_state {
                    KeyState::Multiple(n) if n > 1 => KeyState::Multiple(n - 1),
                    _ => KeyState::Idle,
                };
                self.drain_key_queue(ready);
            }
            Slot::ValueRead(id) => {
                let remaining = match self.read_values.get_mut(&id) {
                    Some(readers) => {
                        *readers -= 1;
                        *readers
                    }
                    None => 0,
                };
                if remaining == 0 {
                    self.read_values.remove(&id);
                    if let Some(delete) = self.waiting_deletes.remove(&id) {
                        self.running_deletes.insert(id);
                        ready.push((Slot::ValueDelete(id), delete));
                    }
                }
            }
            Slot::ValueWrite => self.running_writes -= 1,
            Slot::ValueDelete(id) => {
                let next = match self.queued_deletes.get_mut(&id) {
                    Some(queue) => {
                        let next = queue.pop_front();
                        if queue.is_empty() {
                            self.queued_deletes.remove(&id);
                        }
                        next
                    }
                    None => None,
                };
                match next {
                    Some(delete) => ready.push((Slot::ValueDelete(id), delete)),
                    None => {
                        self.running_deletes.remove(&id);
                    }
                }
            }
        }
    }
}

/// Releases an operation's slot when dropped, whether the operation ran,
/// panicked, or was never executed.
struct SlotGuard {
    executor: Arc<ContainerShardExecutor>,
    slot: Slot,
}

impl SlotGuard {
    /// Release a delete slot as soon as its body returns: the freed id may
    /// already be handed out again.
    fn keep_unless_delete(self) -> Option<Self> {
        match self.slot {
            Slot::ValueDelete(_) => None,
            _ => Some(self),
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.executor.finish(self.slot);
    }
}

/// Admission control for the operations of one shard.
pub struct ContainerShardExecutor {
    name: String,
    pool: Arc<WorkerPool>,
    state: Mutex<State>,
    shutdown: AtomicBool,
    shutdown_done: Mutex<bool>,
    shutdown_cond: Condvar,
    expiry: OnceLock<Arc<CleanupManager>>,
    background: Vec<Arc<CleanupManager>>,
    autonomous_failures: AtomicU64,
}

impl ContainerShardExecutor {
    /// Executor running on `pool` that piggybacks the store-wide
    /// `background` maintenance on its operations.
    pub fn new(name: impl Into<String>, pool: Arc<WorkerPool>, background: Vec<Arc<CleanupManager>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            pool,
            state: Mutex::new(State {
                key_queue: VecDeque::new(),
                key_state: KeyState::Idle,
                running_deletes: FxHashSet::default(),
                waiting_deletes: FxHashMap::default(),
                queued_deletes: FxHashMap::default(),
                read_values: FxHashMap::default(),
                running_writes: 0,
            }),
            shutdown: AtomicBool::new(false),
            shutdown_done: Mutex::new(false),
            shutdown_cond: Condvar::new(),
            expiry: OnceLock::new(),
            background,
            autonomous_failures: AtomicU64::new(0),
        })
    }

    /// Install the shard's expiry sweep. Its runs execute as exclusive key
    /// operations. Only the first call has an effect.
    pub fn set_expiry_cleanup(self: &Arc<Self>, manager: Arc<CleanupManager>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        manager.set_finalized(move || {
            if let Some(executor) = weak.upgrade() {
                executor.check_shutdown_complete();
            }
        });
        let _ = self.expiry.set(manager);
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit a key operation and get a handle on its outcome.
    pub fn submit_key<T, F>(self: &Arc<Self>, kind: KeyOperationKind, fail_in_shutdown: bool, body: F) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (producer, handle) = promise();
        self.key_operation(kind, fail_in_shutdown, body, Completion::Promise(producer));
        handle
    }

    /// Submit a value operation and get a handle on its outcome.
    pub fn submit_value<T, F>(self: &Arc<Self>, op: ValueOperation, fail_in_shutdown: bool, body: F) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (producer, handle) = promise();
        self.value_operation(op, fail_in_shutdown, body, Completion::Promise(producer));
        handle
    }

    /// Admit a key operation with an arbitrary completion.
    pub fn key_operation<T, F>(
        self: &Arc<Self>,
        kind: KeyOperationKind,
        fail_in_shutdown: bool,
        body: F,
        completion: Completion<T>,
    ) where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let op: Box<dyn Runnable> = Box::new(Operation {
            body: Box::new(body),
            completion,
        });
        if let Err(e) = self.precheck(fail_in_shutdown) {
            op.reject(self, e);
            return;
        }
        let mut ready = Vec::new();
        {
            let mut state = self.state.lock();
            state.key_queue.push_back((kind, op));
            state.drain_key_queue(&mut ready);
        }
        self.dispatch(ready);
    }

    /// Admit a value operation with an arbitrary completion.
    ///
    /// A read of a value that is being deleted completes with `Cancelled`.
    pub fn value_operation<T, F>(
        self: &Arc<Self>,
        value_op: ValueOperation,
        fail_in_shutdown: bool,
        body: F,
        completion: Completion<T>,
    ) where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let op: Box<dyn Runnable> = Box::new(Operation {
            body: Box::new(body),
            completion,
        });
        if let Err(e) = self.precheck(fail_in_shutdown) {
            op.reject(self, e);
            return;
        }
        let mut ready: Ready = Vec::new();
        let rejected = {
            let mut state = self.state.lock();
            match value_op {
                ValueOperation::Read(id) => {
                    if state.running_deletes.contains(&id) || state.waiting_deletes.contains_key(&id) {
                        Some((op, Error::Cancelled))
                    } else {
                        *state.read_values.entry(id).or_insert(0) += 1;
                        ready.push((Slot::ValueRead(id), op));
                        None
                    }
                }
                ValueOperation::Write => {
                    state.running_writes += 1;
                    ready.push((Slot::ValueWrite, op));
                    None
                }
                ValueOperation::Delete(id) => {
                    if state.waiting_deletes.contains_key(&id) {
                        let error = Error::Corruption(format!("secondary delete of value {} already deleting", id));
                        Some((op, error))
                    } else if state.running_deletes.contains(&id) {
                        state.queued_deletes.entry(id).or_default().push_back(op);
                        None
                    } else if state.read_values.contains_key(&id) {
                        state.waiting_deletes.insert(id, op);
                        None
                    } else {
                        state.running_deletes.insert(id);
                        ready.push((Slot::ValueDelete(id), op));
                        None
                    }
                }
            }
        };
        if let Some((op, error)) = rejected {
            if let Error::Corruption(message) = &error {
                tracing::error!(shard = %self.name, "{}", message);
            } else {
                debug!(shard = %self.name, ?value_op, "value read cancelled by pending delete");
            }
            op.reject(self, error);
        }
        self.dispatch(ready);
    }

    fn precheck(&self, fail_in_shutdown: bool) -> Result<()> {
        if fail_in_shutdown {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(Error::Interrupted);
            }
            if self.pool.is_saturated() {
                return Err(Error::Backpressure);
            }
        }
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, ready: Ready) {
        for (slot, op) in ready {
            let guard = SlotGuard {
                executor: Arc::clone(self),
                slot,
            };
            let executor = Arc::clone(self);
            let spawned = self.pool.spawn(TaskPriority::Normal, move || {
                executor.maintain();
                op.run(&executor, guard);
            });
            if let Err(e) = spawned {
                // the job was dropped: its guard released the slot and its
                // promise resolved to Interrupted
                warn!(shard = %self.name, error = %e, "operation dropped by worker pool");
            }
        }
    }

    fn finish(self: &Arc<Self>, slot: Slot) {
        let mut ready = Vec::new();
        self.state.lock().release(slot, &mut ready);
        self.dispatch(ready);
        self.check_shutdown_complete();
    }

    /// Trigger due maintenance from an executing operation.
    fn maintain(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        if let Some(expiry) = self.expiry.get() {
            let executor = Arc::clone(self);
            expiry.trigger(move |job| {
                executor.key_operation(
                    KeyOperationKind::Delete,
                    false,
                    move || {
                        job();
                        Ok(())
                    },
                    Completion::Autonomous("expiry sweep"),
                );
                Ok(())
            });
        }
        for manager in &self.background {
            manager.trigger(|job| self.pool.submit(TaskPriority::Low, job));
        }
    }

    fn record_autonomous_failure(&self, label: &'static str, error: &Error) {
        self.autonomous_failures.fetch_add(1, Ordering::Relaxed);
        warn!(shard = %self.name, operation = label, error = %error, "autonomous operation failed");
    }

    /// Failed autonomous operations since creation
    pub fn autonomous_failures(&self) -> u64 {
        self.autonomous_failures.load(Ordering::Relaxed)
    }

    /// Whether nothing is queued, running or pending
    pub fn is_idle(&self) -> bool {
        let cleanup_queued = self.expiry.get().map_or(false, |m| m.is_queued());
        !cleanup_queued && self.state.lock().is_idle()
    }

    /// Whether `shutdown` has been called
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Reject new `fail_in_shutdown` operations and let the rest drain.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            debug!(shard = %self.name, "executor shutting down");
        }
        self.check_shutdown_complete();
    }

    fn check_shutdown_complete(&self) {
        if !self.shutdown.load(Ordering::Acquire) || !self.is_idle() {
            return;
        }
        let mut done = self.shutdown_done.lock();
        if !*done {
            *done = true;
            self.shutdown_cond.notify_all();
        }
    }

    /// Block until the executor is shut down and idle.
    pub fn wait_for_shutdown(&self) {
        let mut done = self.shutdown_done.lock();
        while !*done {
            self.shutdown_cond.wait(&mut done);
        }
    }

    /// Like `wait_for_shutdown`, failing with `Timeout` after `timeout`.
    pub fn wait_for_shutdown_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut done = self.shutdown_done.lock();
        while !*done {
            if self.shutdown_cond.wait_until(&mut done, deadline).timed_out() && !*done {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    /// Current bookkeeping
    pub fn stats(&self) -> ExecutorStats {
        let state = self.state.lock();
        ExecutorStats {
            queued_key_operations: state.key_queue.len(),
            key_state: state.key_state,
            running_deletes: state.running_deletes.len(),
            waiting_deletes: state.waiting_deletes.len(),
            queued_deletes: state.queued_deletes.values().map(VecDeque::len).sum(),
            reading_values: state.read_values.len(),
            running_writes: state.running_writes,
            autonomous_failures: self.autonomous_failures(),
        }
    }
}
