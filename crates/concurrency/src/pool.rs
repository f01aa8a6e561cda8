//! Shared worker pool
//!
//! A fixed set of named worker threads draining one priority queue. Every
//! key and value operation of every shard runs here, as does store-wide
//! maintenance.
//!
//! Jobs are ranked by `TaskPriority`, then by arrival. Every job enters
//! through `enqueue` with an `Admission` class: `Fresh` work is refused with
//! `Backpressure` once `max_queue_depth` jobs are waiting, while work a shard
//! executor already `Admitted` is only refused after shutdown. `submit` and
//! `spawn` are shorthands for the two classes.
//!
//! All bookkeeping lives in one `Board` behind the queue lock; workers
//! release the lock while a job runs.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tessera_core::{Error, Result};
use tracing::{debug, error};

/// A unit of work for the pool
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Priority levels for pooled work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Maintenance: idle block closing, expiry sweeps
    Low = 0,
    /// Key and value operations
    Normal = 1,
    /// Work that unblocks waiting callers
    High = 2,
}

/// How a job reaches the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New work, refused while the queue is full
    Fresh,
    /// Work already accepted by a shard executor; dropping it would lose an
    /// admitted operation
    Admitted,
}

/// Pool metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Jobs waiting in the queue
    pub queue_depth: usize,
    /// Jobs currently executing
    pub active_tasks: usize,
    /// Jobs finished since the pool started, panicked ones included
    pub tasks_completed: u64,
    /// Worker threads
    pub worker_count: usize,
}

/// A waiting job and its rank: higher priority first, then lower sequence.
struct Queued {
    rank: (TaskPriority, Reverse<u64>),
    job: Job,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank.cmp(&other.rank)
    }
}

#[derive(Default)]
struct Board {
    waiting: BinaryHeap<Queued>,
    next_sequence: u64,
    running: usize,
    completed: u64,
    closed: bool,
}

impl Board {
    fn is_quiet(&self) -> bool {
        self.waiting.is_empty() && self.running == 0
    }
}

struct Shared {
    board: Mutex<Board>,
    /// Signalled when a job is queued or the pool closes
    work: Condvar,
    /// Signalled when the board turns quiet
    quiet: Condvar,
    max_queue_depth: usize,
}

/// Fixed-size priority worker pool.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl WorkerPool {
    /// Start `num_threads` workers named `tessera-worker-N`.
    pub fn new(num_threads: usize, max_queue_depth: usize) -> Result<Self> {
        if num_threads == 0 {
            return Err(Error::invalid_argument("worker pool needs at least one thread"));
        }
        let pool = Self {
            shared: Arc::new(Shared {
                board: Mutex::new(Board::default()),
                work: Condvar::new(),
                quiet: Condvar::new(),
                max_queue_depth,
            }),
            workers: Mutex::new(Vec::with_capacity(num_threads)),
            worker_count: num_threads,
        };
        for i in 0..num_threads {
            let shared = Arc::clone(&pool.shared);
            let spawned = thread::Builder::new()
                .name(format!("tessera-worker-{}", i))
                .spawn(move || run_worker(&shared));
            match spawned {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(e.into());
                }
            }
        }
        debug!(workers = num_threads, max_queue_depth, "worker pool started");
        Ok(pool)
    }

    /// Queue `work` at `priority`.
    ///
    /// Fails with `Interrupted` after shutdown, and with `Backpressure` for
    /// `Fresh` work while the queue is full. A refused job is dropped
    /// unexecuted.
    pub fn enqueue(
        &self,
        priority: TaskPriority,
        admission: Admission,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let mut board = self.shared.board.lock();
        if board.closed {
            return Err(Error::Interrupted);
        }
        if admission == Admission::Fresh && board.waiting.len() >= self.shared.max_queue_depth {
            return Err(Error::Backpressure);
        }
        let sequence = board.next_sequence;
        board.next_sequence += 1;
        board.waiting.push(Queued {
            rank: (priority, Reverse(sequence)),
            job: Box::new(work),
        });
        drop(board);
        self.shared.work.notify_one();
        Ok(())
    }

    /// Queue fresh work
    pub fn submit(&self, priority: TaskPriority, work: impl FnOnce() + Send + 'static) -> Result<()> {
        self.enqueue(priority, Admission::Fresh, work)
    }

    /// Queue admitted work
    pub fn spawn(&self, priority: TaskPriority, work: impl FnOnce() + Send + 'static) -> Result<()> {
        self.enqueue(priority, Admission::Admitted, work)
    }

    /// Whether fresh work is currently refused
    pub fn is_saturated(&self) -> bool {
        self.shared.board.lock().waiting.len() >= self.shared.max_queue_depth
    }

    /// Whether `shutdown` has been called
    pub fn is_shutdown(&self) -> bool {
        self.shared.board.lock().closed
    }

    /// Block until every queued and running job has finished.
    ///
    /// Workers keep running afterwards.
    pub fn drain(&self) {
        let mut board = self.shared.board.lock();
        while !board.is_quiet() {
            self.shared.quiet.wait(&mut board);
        }
    }

    /// Stop accepting work, let workers finish the queue, and join them.
    ///
    /// Called from a worker, every other worker is joined and the calling
    /// one exits once its current job returns.
    pub fn shutdown(&self) {
        self.close();
        let current = thread::current().id();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.thread().id() != current && handle.join().is_err() {
                error!("worker thread panicked outside a job");
            }
        }
    }

    fn close(&self) {
        self.shared.board.lock().closed = true;
        self.shared.work.notify_all();
    }

    /// Current metrics
    pub fn stats(&self) -> PoolStats {
        let board = self.shared.board.lock();
        PoolStats {
            queue_depth: board.waiting.len(),
            active_tasks: board.running,
            tasks_completed: board.completed,
            worker_count: self.worker_count,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // no join: the last reference may be dropped on a worker
        self.close();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic")
}

fn run_worker(shared: &Shared) {
    let mut board = shared.board.lock();
    loop {
        let Some(Queued { job, .. }) = board.waiting.pop() else {
            if board.closed {
                return;
            }
            shared.work.wait(&mut board);
            continue;
        };
        board.running += 1;
        let outcome = MutexGuard::unlocked(&mut board, || panic::catch_unwind(AssertUnwindSafe(job)));
        board.running -= 1;
        board.completed += 1;
        if board.is_quiet() {
            shared.quiet.notify_all();
        }
        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref()).to_string();
            MutexGuard::unlocked(&mut board, move || {
                error!(panic = %message, "pooled job panicked");
                drop(payload);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Barrier;

    fn blocked(pool: &WorkerPool) -> Arc<Barrier> {
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        pool.submit(TaskPriority::Low, move || {
            b.wait();
        })
        .unwrap();
        // let the single worker pick it up
        std::thread::sleep(std::time::Duration::from_millis(50));
        barrier
    }

    #[test]
    fn test_submit_and_drain() {
        let pool = WorkerPool::new(2, 1024).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = Arc::clone(&counter);
            pool.submit(TaskPriority::Normal, move || {
                c.fetch_add(1, AtomicOrdering::Relaxed);
            })
            .unwrap();
        }
        pool.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 10);
        pool.shutdown();
    }

    #[test]
    fn test_priority_then_fifo() {
        let pool = WorkerPool::new(1, 1024).unwrap();
        let barrier = blocked(&pool);
        let order = Arc::new(Mutex::new(Vec::new()));
        for (priority, tag) in [
            (TaskPriority::Low, "low"),
            (TaskPriority::Normal, "normal-1"),
            (TaskPriority::High, "high"),
            (TaskPriority::Normal, "normal-2"),
        ] {
            let o = Arc::clone(&order);
            pool.submit(priority, move || o.lock().push(tag)).unwrap();
        }
        barrier.wait();
        pool.drain();
        assert_eq!(*order.lock(), vec!["high", "normal-1", "normal-2", "low"]);
        pool.shutdown();
    }

    #[test]
    fn test_backpressure_spares_admitted_work() {
        let pool = WorkerPool::new(1, 2).unwrap();
        let barrier = blocked(&pool);
        pool.submit(TaskPriority::Normal, || {}).unwrap();
        pool.submit(TaskPriority::Normal, || {}).unwrap();
        assert!(matches!(
            pool.submit(TaskPriority::Normal, || {}),
            Err(Error::Backpressure)
        ));
        assert!(pool.spawn(TaskPriority::Normal, || {}).is_ok());
        assert!(pool
            .enqueue(TaskPriority::High, Admission::Admitted, || {})
            .is_ok());
        barrier.wait();
        pool.drain();
        assert_eq!(pool.stats().tasks_completed, 5);
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_runs_queued_jobs_then_rejects() {
        let pool = WorkerPool::new(1, 1024).unwrap();
        let barrier = blocked(&pool);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            pool.submit(TaskPriority::Normal, move || {
                c.fetch_add(1, AtomicOrdering::Relaxed);
            })
            .unwrap();
        }
        barrier.wait();
        pool.shutdown();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 5);
        assert!(matches!(pool.spawn(TaskPriority::High, || {}), Err(Error::Interrupted)));
        pool.shutdown();
    }

    #[test]
    fn test_panicking_job_does_not_hang_drain() {
        let pool = WorkerPool::new(2, 1024).unwrap();
        pool.submit(TaskPriority::Normal, || panic!("intentional test panic"))
            .unwrap();
        pool.submit(TaskPriority::Normal, || {}).unwrap();
        pool.drain();
        let stats = pool.stats();
        assert_eq!(stats.tasks_completed, 2);
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.worker_count, 2);
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_from_worker_does_not_self_join() {
        let pool = Arc::new(WorkerPool::new(2, 1024).unwrap());
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let p = Arc::clone(&pool);
        pool.submit(TaskPriority::Normal, move || {
            p.shutdown();
            done_tx.send(()).unwrap();
        })
        .unwrap();
        done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        assert!(pool.is_shutdown());
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(WorkerPool::new(0, 16).is_err());
    }
}
