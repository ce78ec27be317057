//! Retry policy for store reads.

use std::time::Duration;

use crate::error::Result;

/// Default extra attempts after the first failed read.
pub const DEFAULT_READ_RETRIES: u32 = 2;

/// Default pause between read attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Retries reads that fail with a retryable error.
///
/// Only for reads. Store writes are not idempotent and must never go
/// through this.
#[derive(Clone, Copy, Debug)]
pub struct ReadRetry {
    pub retries: u32,
    pub backoff: Duration,
}

impl ReadRetry {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    /// Run `read`, retrying up to `retries` more times on retryable errors.
    pub fn run<T, F>(&self, what: &str, mut read: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match read() {
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(
                        read = what,
                        attempt,
                        error = %e,
                        "store read failed, retrying"
                    );
                    if !self.backoff.is_zero() {
                        std::thread::sleep(self.backoff);
                    }
                }
                other => return other,
            }
        }
    }
}

impl Default for ReadRetry {
    fn default() -> Self {
        Self::new(DEFAULT_READ_RETRIES, DEFAULT_RETRY_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use std::cell::Cell;

    #[test]
    fn test_retries_transient_failures() {
        let calls = Cell::new(0);
        let retry = ReadRetry::new(2, Duration::ZERO);

        let value = retry
            .run("test", || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(BrokerError::StoreUnavailable("flaky".into()))
                } else {
                    Ok(7)
                }
            })
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_budget() {
        let calls = Cell::new(0);
        let retry = ReadRetry::new(1, Duration::ZERO);

        let result: Result<()> = retry.run("test", || {
            calls.set(calls.get() + 1);
            Err(BrokerError::StoreUnavailable("down".into()))
        });

        assert!(matches!(result, Err(BrokerError::StoreUnavailable(_))));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_non_retryable_fails_fast() {
        let calls = Cell::new(0);
        let retry = ReadRetry::new(5, Duration::ZERO);

        let result: Result<()> = retry.run("test", || {
            calls.set(calls.get() + 1);
            Err(BrokerError::NotFound)
        });

        assert!(matches!(result, Err(BrokerError::NotFound)));
        assert_eq!(calls.get(), 1);
    }
}
