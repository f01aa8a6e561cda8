//! Rate-limited maintenance piggybacked on regular traffic
//!
//! A `CleanupManager` never owns a thread. Whoever executes an operation calls
//! `trigger`, and when the interval has elapsed and no run is queued the
//! manager hands a job to the supplied scheduler: the shared pool for
//! store-wide work, a shard executor for work that needs the shard's key slot.
//!
//! - At most one run is queued or running at any time
//! - A run starts at most once per interval
//! - The `finalized` hook fires after every run, including runs whose job was
//!   dropped unexecuted

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::Result;
use tracing::{debug, warn};

use crate::pool::Job;

const NEVER_RAN: u64 = u64::MAX;

type Action = Box<dyn Fn() -> Result<()> + Send + Sync>;
type Hook = Arc<dyn Fn() + Send + Sync>;

/// Interval-gated maintenance task.
pub struct CleanupManager {
    name: String,
    interval: Duration,
    epoch: Instant,
    last_run_millis: AtomicU64,
    queued: AtomicBool,
    gate: Mutex<()>,
    action: Action,
    finalized: Mutex<Option<Hook>>,
    runs: AtomicU64,
    failures: AtomicU64,
}

impl CleanupManager {
    /// Manager running `action` at most once per `interval`.
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        action: impl Fn() -> Result<()> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            interval,
            epoch: Instant::now(),
            last_run_millis: AtomicU64::new(NEVER_RAN),
            queued: AtomicBool::new(false),
            gate: Mutex::new(()),
            action: Box::new(action),
            finalized: Mutex::new(None),
            runs: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    /// Install the hook fired after each run
    pub fn set_finalized(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.finalized.lock() = Some(Arc::new(hook));
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a run is queued or in progress
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    /// Completed runs, failed ones included
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Runs whose action returned an error
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn elapsed_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Whether a trigger now would schedule a run
    pub fn is_due(&self) -> bool {
        if self.is_queued() {
            return false;
        }
        match self.last_run_millis.load(Ordering::Acquire) {
            NEVER_RAN => true,
            last => self.elapsed_millis().saturating_sub(last) >= self.interval.as_millis() as u64,
        }
    }

    /// Schedule a run through `schedule` if one is due.
    ///
    /// Returns whether a run was handed to the scheduler.
    pub fn trigger(self: &Arc<Self>, schedule: impl FnOnce(Job) -> Result<()>) -> bool {
        if !self.is_due() {
            return false;
        }
        let _gate = self.gate.lock();
        if !self.is_due() {
            return false;
        }
        self.queued.store(true, Ordering::Release);
        let pending = PendingRun {
            manager: Arc::clone(self),
        };
        match schedule(Box::new(move || {
            let pending = pending;
            pending.manager.execute();
        })) {
            Ok(()) => true,
            Err(e) => {
                // the rejected job was dropped, which already reset `queued`
                debug!(cleanup = %self.name, error = %e, "maintenance run not scheduled");
                false
            }
        }
    }

    fn execute(&self) {
        let started = Instant::now();
        match (self.action)() {
            Ok(()) => debug!(
                cleanup = %self.name,
                elapsed_us = started.elapsed().as_micros() as u64,
                "maintenance run finished"
            ),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(cleanup = %self.name, error = %e, "maintenance run failed");
            }
        }
    }

    fn finish_run(&self) {
        self.last_run_millis
            .store(self.elapsed_millis(), Ordering::Release);
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.queued.store(false, Ordering::Release);
        let hook = self.finalized.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Marks the end of a run when the scheduled job finishes or is dropped.
struct PendingRun {
    manager: Arc<CleanupManager>,
}

impl Drop for PendingRun {
    fn drop(&mut self) {
        self.manager.finish_run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tessera_core::Error;

    fn counting(interval: Duration) -> (Arc<CleanupManager>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let manager = CleanupManager::new("test", interval, move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (manager, count)
    }

    #[test]
    fn test_runs_at_most_once_per_interval() {
        let (manager, count) = counting(Duration::from_secs(3600));
        assert!(manager.trigger(|job| {
            job();
            Ok(())
        }));
        assert!(!manager.trigger(|job| {
            job();
            Ok(())
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(manager.runs(), 1);
    }

    #[test]
    fn test_no_overlap_while_queued() {
        let (manager, count) = counting(Duration::ZERO);
        let mut parked = Vec::new();
        assert!(manager.trigger(|job| {
            parked.push(job);
            Ok(())
        }));
        assert!(manager.is_queued());
        assert!(!manager.trigger(|_| Ok(())));

        for job in parked.drain(..) {
            job();
        }
        assert!(!manager.is_queued());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(manager.trigger(|job| {
            job();
            Ok(())
        }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rejected_schedule_resets_queue_flag() {
        let (manager, count) = counting(Duration::ZERO);
        assert!(!manager.trigger(|_job| Err(Error::Interrupted)));
        assert!(!manager.is_queued());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_finalized_hook_and_failures() {
        let manager = CleanupManager::new("failing", Duration::ZERO, || {
            Err(Error::corruption("sweep found a broken block"))
        });
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        manager.set_finalized(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        manager.trigger(|job| {
            job();
            Ok(())
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.failures(), 1);
    }
}
