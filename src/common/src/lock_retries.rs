//! Retrying lock-requiring transactions with an escalating lock timeout.
//!
//! Each attempt runs the whole transaction with `SET LOCAL lock_timeout`. When a
//! lock cannot be acquired in time the transaction is rolled back, the runner
//! sleeps and the next attempt uses the next (lock_timeout, sleep) pair. The
//! sleep of the last pair is never taken.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::LockRetriesConfig;
use crate::database::{Connection, DatabaseError, Transaction};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRetryTiming {
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// Pause before the next attempt after a lock timeout
    #[serde(with = "humantime_serde")]
    pub sleep: Duration,
}

const fn timing(lock_timeout_ms: u64, sleep_ms: u64) -> LockRetryTiming {
    LockRetryTiming {
        lock_timeout: Duration::from_millis(lock_timeout_ms),
        sleep: Duration::from_millis(sleep_ms),
    }
}

/// Short timeouts first, escalating when the table looks busy.
pub const DEFAULT_TIMING_CONFIGURATION: [LockRetryTiming; 20] = [
    timing(100, 50),
    timing(100, 50),
    timing(200, 50),
    timing(300, 100),
    timing(400, 150),
    timing(500, 2_000),
    timing(500, 2_000),
    timing(500, 2_000),
    timing(500, 2_000),
    timing(1_000, 5_000),
    timing(1_000, 60_000),
    timing(100, 50),
    timing(100, 50),
    timing(200, 50),
    timing(300, 100),
    timing(400, 150),
    timing(500, 2_000),
    timing(500, 2_000),
    timing(500, 2_000),
    timing(3_000, 180_000),
];

/// Partition maintenance touches hot parent tables, so every pair of the
/// default schedule is doubled.
pub fn partition_manager_timing_configuration() -> Vec<LockRetryTiming> {
    DEFAULT_TIMING_CONFIGURATION
        .iter()
        .map(|t| LockRetryTiming {
            lock_timeout: t.lock_timeout * 2,
            sleep: t.sleep * 2,
        })
        .collect()
}

/// Errors that can tell whether they were caused by a lock timeout.
pub trait RetryableError: From<DatabaseError> {
    fn is_lock_timeout(&self) -> bool;
}

impl RetryableError for DatabaseError {
    fn is_lock_timeout(&self) -> bool {
        DatabaseError::is_lock_timeout(self)
    }
}

#[derive(Clone, Debug)]
pub struct WithLockRetries {
    timing: Vec<LockRetryTiming>,
    enabled: bool,
    raise_on_exhaustion: bool,
}

impl WithLockRetries {
    pub fn new(timing: Vec<LockRetryTiming>) -> Self {
        Self {
            timing,
            enabled: true,
            raise_on_exhaustion: false,
        }
    }

    pub fn from_config(config: &LockRetriesConfig) -> Self {
        Self {
            timing: config.timing.clone(),
            enabled: config.enabled,
            raise_on_exhaustion: false,
        }
    }

    /// Fail with [`DatabaseError::LockRetriesExhausted`] instead of making a
    /// final attempt without a lock timeout.
    pub fn raise_on_exhaustion(mut self, raise: bool) -> Self {
        self.raise_on_exhaustion = raise;
        self
    }

    /// Run `body` until it succeeds, fails with something other than a lock
    /// timeout, or the schedule is exhausted.
    ///
    /// `body` receives the lock timeout of the attempt and is expected to open
    /// its own transaction with [`begin_with_lock_timeout`].
    pub async fn run<T, E, F, Fut>(&self, mut body: F) -> Result<T, E>
    where
        E: RetryableError + std::fmt::Display,
        F: FnMut(Option<Duration>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.enabled {
            return body(None).await;
        }

        let last = self.timing.len().saturating_sub(1);
        for (iteration, timing) in self.timing.iter().enumerate() {
            match body(Some(timing.lock_timeout)).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_lock_timeout() && iteration == last => {
                    tracing::warn!(
                        iteration = iteration + 1,
                        lock_timeout_ms = timing.lock_timeout.as_millis() as u64,
                        "Lock timeout on the last iteration"
                    );
                }
                Err(e) if e.is_lock_timeout() => {
                    tracing::warn!(
                        iteration = iteration + 1,
                        lock_timeout_ms = timing.lock_timeout.as_millis() as u64,
                        sleep_ms = timing.sleep.as_millis() as u64,
                        "Lock timeout, retrying after sleep"
                    );
                    tokio::time::sleep(timing.sleep).await;
                }
                Err(e) => return Err(e),
            }
        }

        if self.raise_on_exhaustion {
            return Err(DatabaseError::LockRetriesExhausted {
                attempts: self.timing.len(),
            }
            .into());
        }

        tracing::warn!(
            attempts = self.timing.len(),
            "Lock retries exhausted, running without lock timeout"
        );
        body(None).await
    }
}

/// Open a transaction on `connection` and bound its lock waits.
pub async fn begin_with_lock_timeout<C>(
    connection: &C,
    lock_timeout: Option<Duration>,
) -> Result<Box<dyn Transaction>, DatabaseError>
where
    C: Connection + ?Sized,
{
    let tx = connection.begin().await?;
    if let Some(timeout) = lock_timeout {
        tx.execute(&format!(
            "SET LOCAL lock_timeout TO '{}ms'",
            timeout.as_millis()
        ))
        .await?;
    }
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn short_timing(n: usize) -> Vec<LockRetryTiming> {
        (0..n).map(|_| timing(10, 1)).collect()
    }

    #[test]
    fn test_partition_manager_timing_is_doubled() {
        let doubled = partition_manager_timing_configuration();
        assert_eq!(doubled.len(), DEFAULT_TIMING_CONFIGURATION.len());
        assert_eq!(doubled[0].lock_timeout, Duration::from_millis(200));
        assert_eq!(doubled[0].sleep, Duration::from_millis(100));
        assert_eq!(doubled[19].sleep, Duration::from_secs(360));
    }

    #[tokio::test]
    async fn test_succeeds_after_lock_timeouts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retries = WithLockRetries::new(short_timing(5));

        let result: Result<usize, DatabaseError> = retries
            .run(|lock_timeout| {
                let calls = calls.clone();
                async move {
                    assert!(lock_timeout.is_some());
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(DatabaseError::LockTimeout)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retries = WithLockRetries::new(short_timing(5));

        let result: Result<(), DatabaseError> = retries
            .run(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(DatabaseError::Other("boom".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(DatabaseError::Other(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_raise_on_exhaustion() {
        let calls = Arc::new(AtomicUsize::new(0));
        let retries = WithLockRetries::new(short_timing(3)).raise_on_exhaustion(true);

        let result: Result<(), DatabaseError> = retries
            .run(|_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(DatabaseError::LockTimeout)
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(DatabaseError::LockRetriesExhausted { attempts: 3 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sleep_after_last_iteration() {
        let retries = WithLockRetries::new(vec![
            timing(10, 100_000),
            timing(10, 100_000),
        ])
        .raise_on_exhaustion(true);
        let started = tokio::time::Instant::now();

        let result: Result<(), DatabaseError> = retries
            .run(|_| async { Err(DatabaseError::LockTimeout) })
            .await;

        assert!(matches!(
            result,
            Err(DatabaseError::LockRetriesExhausted { attempts: 2 })
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(100));
    }

    #[tokio::test]
    async fn test_final_attempt_without_lock_timeout() {
        let retries = WithLockRetries::new(short_timing(2));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let result: Result<(), DatabaseError> = retries
            .run(|lock_timeout| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(lock_timeout);
                    match lock_timeout {
                        Some(_) => Err(DatabaseError::LockTimeout),
                        None => Ok(()),
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], None);
    }

    #[tokio::test]
    async fn test_disabled_runs_once_without_timeout() {
        let config = LockRetriesConfig {
            enabled: false,
            timing: short_timing(4),
        };
        let retries = WithLockRetries::from_config(&config);

        let result: Result<Option<Duration>, DatabaseError> =
            retries.run(|lock_timeout| async move { Ok(lock_timeout) }).await;

        assert_eq!(result.unwrap(), None);
    }
}
