//! Optimistic read-modify-write
//!
//! `update_with_retry` reads a key, computes the new value, and writes it
//! back conditioned on the version it read. A concurrent writer makes the
//! conditional put fail with a conflict; the update then waits a random
//! jittered delay and starts over from a fresh read.

use rand::Rng;
use std::time::Duration;
use tessera_core::{Error, PutOptions, Record, Result};
use tracing::debug;

use crate::async_container::{AsyncContainer, ValueLookup};

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry behavior of `update_with_retry`.
///
/// # Example
/// ```ignore
/// let retry = RetryConfig::new().with_max_retries(10).with_max_delay_ms(50);
/// update_with_retry(&container, b"counter", &retry, |old| increment(old))?;
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after the first conflicting one, 0 to fail on the first conflict
    pub max_retries: usize,
    /// Jitter bound of the first retry in milliseconds; doubles per retry
    pub base_delay_ms: u64,
    /// Cap on the jitter bound in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 2,
            max_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Five retries, jitter bound from 2ms doubling up to 100ms
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail on the first conflict
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set the retry count
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the first jitter bound
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set the jitter bound cap
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Upper bound of the delay before retry `attempt`
    pub(crate) fn calculate_delay(&self, attempt: usize) -> Duration {
        let shift = attempt.min(63);
        let multiplier = 1u64 << shift;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    /// Random delay in `[0, calculate_delay(attempt)]`
    fn jittered_delay(&self, attempt: usize) -> Duration {
        let bound = self.calculate_delay(attempt).as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
    }
}

/// Whether a failed conditional put lost a race with another writer.
fn is_conflict(error: &Error) -> bool {
    error.is_retryable() || matches!(error, Error::OptionMismatch(_))
}

/// Replace the value of `key` with `update(current)`.
///
/// `update` receives the current value, `None` if the key is absent. The
/// write only succeeds if no other writer changed the key in between;
/// otherwise the whole read-modify-write is retried per `retry`. Returns the
/// stored record.
///
/// # Errors
///
/// The last conflict once retries are exhausted, or any non-conflict failure
/// right away.
pub fn update_with_retry<F>(
    container: &AsyncContainer,
    key: &[u8],
    retry: &RetryConfig,
    mut update: F,
) -> Result<Record>
where
    F: FnMut(Option<&[u8]>) -> Vec<u8>,
{
    let mut attempt = 0;
    loop {
        let current = container.get(key).wait()?;
        let value = update(current.value());
        let options = match current {
            ValueLookup::NotFound => PutOptions::new().only_insert(),
            found => PutOptions::new().with_version(found.version().unwrap_or_default()),
        };
        match container.put(key, &value, options).wait() {
            Ok(record) => return Ok(record),
            Err(e) if is_conflict(&e) && attempt < retry.max_retries => {
                let delay = retry.jittered_delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "update conflicted, retrying");
                attempt += 1;
                std::thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}
