//! Promise / handle pairs for pooled operations
//!
//! The producing side owns a `Promise` and completes it exactly once; the
//! caller waits on the matching `OperationHandle`. A promise dropped without
//! completing resolves its handle to `Interrupted`, so a job lost to a panic
//! or a shut-down pool never leaves a waiter hanging.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{Error, Result};

enum SlotState<T> {
    Pending,
    Done(Result<T>),
    Taken,
}

struct Slot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn fill(&self, result: Result<T>) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Pending) {
            *state = SlotState::Done(result);
            self.ready.notify_all();
        }
    }
}

/// Create a connected promise and handle.
pub fn promise<T>() -> (Promise<T>, OperationHandle<T>) {
    let slot = Arc::new(Slot {
        state: Mutex::new(SlotState::Pending),
        ready: Condvar::new(),
    });
    (
        Promise {
            slot: Some(Arc::clone(&slot)),
        },
        OperationHandle { slot },
    )
}

/// Producing side of an operation.
pub struct Promise<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> Promise<T> {
    /// Deliver the outcome.
    pub fn complete(mut self, result: Result<T>) {
        if let Some(slot) = self.slot.take() {
            slot.fill(result);
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.fill(Err(Error::Interrupted));
        }
    }
}

/// Waiting side of an operation.
pub struct OperationHandle<T> {
    slot: Arc<Slot<T>>,
}

impl<T> OperationHandle<T> {
    /// Handle that is already resolved with `result`
    pub fn resolved(result: Result<T>) -> Self {
        let (producer, handle) = promise();
        producer.complete(result);
        handle
    }

    /// Handle that is already failed with `error`
    pub fn failed(error: Error) -> Self {
        Self::resolved(Err(error))
    }

    /// Whether the outcome is available
    pub fn is_done(&self) -> bool {
        !matches!(*self.slot.state.lock(), SlotState::Pending)
    }

    /// Block until the operation completes.
    pub fn wait(self) -> Result<T> {
        let mut state = self.slot.state.lock();
        while matches!(*state, SlotState::Pending) {
            self.slot.ready.wait(&mut state);
        }
        take(&mut state)
    }

    /// Block for at most `timeout`; fails with `Timeout` if the operation is
    /// still running. The operation itself keeps going either way.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        while matches!(*state, SlotState::Pending) {
            if self.slot.ready.wait_until(&mut state, deadline).timed_out()
                && matches!(*state, SlotState::Pending)
            {
                return Err(Error::Timeout);
            }
        }
        take(&mut state)
    }
}

fn take<T>(state: &mut SlotState<T>) -> Result<T> {
    match std::mem::replace(state, SlotState::Taken) {
        SlotState::Done(result) => result,
        SlotState::Pending | SlotState::Taken => {
            Err(Error::corruption("operation outcome taken twice"))
        }
    }
}

impl<T> std::fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_complete_from_other_thread() {
        let (producer, handle) = promise::<u32>();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.complete(Ok(7));
        });
        assert_eq!(handle.wait().unwrap(), 7);
        worker.join().unwrap();
    }

    #[test]
    fn test_dropped_promise_interrupts() {
        let (producer, handle) = promise::<u32>();
        drop(producer);
        assert!(handle.is_done());
        assert!(matches!(handle.wait(), Err(Error::Interrupted)));
    }

    #[test]
    fn test_wait_timeout() {
        let (producer, handle) = promise::<u32>();
        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(20)),
            Err(Error::Timeout)
        ));
        producer.complete(Ok(1));

        let (producer, handle) = promise::<u32>();
        producer.complete(Ok(2));
        assert_eq!(handle.wait_timeout(Duration::from_secs(1)).unwrap(), 2);
    }

    #[test]
    fn test_failed_handle() {
        let handle = OperationHandle::<()>::failed(Error::Interrupted);
        assert!(handle.is_done());
        assert!(handle.wait().unwrap_err().is_interruption());
    }
}
