//! Multi-threaded tests for shard admission
//!
//! These tests hammer one executor from several threads and check the
//! admission invariants from inside the operations themselves:
//!
//! 1. **Exclusive key writes** - no write overlaps any other key operation
//! 2. **Deferred deletes** - no value is freed while a reader is inside it
//! 3. **Clean shutdown** - every admitted operation completes exactly once

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tessera_concurrency::{ContainerShardExecutor, KeyOperationKind, ValueOperation, WorkerPool};
use tessera_core::Error;

// ============================================================================
// Test Helpers
// ============================================================================

fn setup(threads: usize) -> (Arc<WorkerPool>, Arc<ContainerShardExecutor>) {
    let pool = Arc::new(WorkerPool::new(threads, 1 << 16).unwrap());
    let executor = ContainerShardExecutor::new("stress", Arc::clone(&pool), Vec::new());
    (pool, executor)
}

#[derive(Default)]
struct KeyProbe {
    readers: AtomicUsize,
    writers: AtomicUsize,
    violations: AtomicUsize,
}

impl KeyProbe {
    fn enter(&self, exclusive: bool) {
        if exclusive {
            let writers = self.writers.fetch_add(1, Ordering::SeqCst);
            if writers > 0 || self.readers.load(Ordering::SeqCst) > 0 {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
        } else {
            self.readers.fetch_add(1, Ordering::SeqCst);
            if self.writers.load(Ordering::SeqCst) > 0 {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn leave(&self, exclusive: bool) {
        if exclusive {
            self.writers.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.readers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// Key admission
// ============================================================================

#[test]
fn test_random_key_traffic_keeps_writes_exclusive() {
    let (pool, executor) = setup(8);
    let probe = Arc::new(KeyProbe::default());

    let handles: Vec<_> = (0..4u64)
        .map(|seed| {
            let executor = Arc::clone(&executor);
            let probe = Arc::clone(&probe);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut pending = Vec::new();
                for _ in 0..200 {
                    let kind = match rng.gen_range(0..3) {
                        0 => KeyOperationKind::Write,
                        1 => KeyOperationKind::Delete,
                        _ => KeyOperationKind::Read,
                    };
                    let exclusive = kind != KeyOperationKind::Read;
                    let probe = Arc::clone(&probe);
                    pending.push(executor.submit_key(kind, true, move || {
                        probe.enter(exclusive);
                        thread::sleep(Duration::from_micros(50));
                        probe.leave(exclusive);
                        Ok(())
                    }));
                }
                for handle in pending {
                    handle.wait().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(probe.violations.load(Ordering::SeqCst), 0);
    executor.shutdown();
    executor.wait_for_shutdown();
    pool.shutdown();
}

// ============================================================================
// Value admission
// ============================================================================

#[test]
fn test_deletes_never_free_values_under_readers() {
    let (pool, executor) = setup(8);
    let live: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new((0..16).collect()));
    let readers: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(vec![0; 16]));
    let violations = Arc::new(AtomicUsize::new(0));

    let mut pending = Vec::new();
    let mut rng = StdRng::seed_from_u64(42);
    let mut deleted = HashSet::new();
    for _ in 0..400 {
        let id = rng.gen_range(0..16u64);
        if rng.gen_bool(0.1) && deleted.insert(id) {
            let (live, readers, violations) = (Arc::clone(&live), Arc::clone(&readers), Arc::clone(&violations));
            pending.push(executor.submit_value(ValueOperation::Delete(id), true, move || {
                if readers.lock()[id as usize] > 0 {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                live.lock().remove(&id);
                Ok(())
            }));
        } else if !deleted.contains(&id) {
            // reads are only issued for values not yet handed to a delete
            let (live, readers, violations) = (Arc::clone(&live), Arc::clone(&readers), Arc::clone(&violations));
            pending.push(executor.submit_value(ValueOperation::Read(id), true, move || {
                readers.lock()[id as usize] += 1;
                if !live.lock().contains(&id) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_micros(100));
                readers.lock()[id as usize] -= 1;
                Ok(())
            }));
        }
    }

    for handle in pending {
        match handle.wait() {
            Ok(()) | Err(Error::Cancelled) => {}
            Err(e) => panic!("unexpected failure: {}", e),
        }
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    for id in &deleted {
        assert!(!live.lock().contains(id));
    }
    executor.shutdown();
    executor.wait_for_shutdown();
    assert!(executor.is_idle());
    pool.shutdown();
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn test_shutdown_under_load_completes_every_operation_once() {
    let (pool, executor) = setup(4);
    let completed = Arc::new(AtomicUsize::new(0));

    let mut pending = Vec::new();
    for i in 0..500 {
        let completed = Arc::clone(&completed);
        let kind = if i % 3 == 0 {
            KeyOperationKind::Write
        } else {
            KeyOperationKind::Read
        };
        pending.push(executor.submit_key(kind, true, move || {
            completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        if i == 250 {
            executor.shutdown();
        }
    }

    let mut interrupted = 0;
    for handle in pending {
        match handle.wait() {
            Ok(()) => {}
            Err(Error::Interrupted) => interrupted += 1,
            Err(e) => panic!("unexpected failure: {}", e),
        }
    }
    executor.wait_for_shutdown();
    assert_eq!(interrupted, 249);
    assert_eq!(completed.load(Ordering::SeqCst), 251);
    pool.shutdown();
}
