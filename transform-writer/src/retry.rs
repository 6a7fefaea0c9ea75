use std::future::Future;
use std::iter::Take;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backoff::retry::Retry;
use backoff::strategy::uniform::Uniform;
use tracing::{error, warn};

use crate::Result;
use crate::error::Error;

pub const DEFAULT_MAX_RETRY: usize = 3;
pub const DEFAULT_RANDOM_MIN_SLEEP: Duration = Duration::from_secs(1);
pub const DEFAULT_RANDOM_MAX_SLEEP: Duration = Duration::from_secs(3);

/// How often, and how patiently, a sink write is retried after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retry: usize,
    pub random_min_sleep: Duration,
    pub random_max_sleep: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
            random_min_sleep: DEFAULT_RANDOM_MIN_SLEEP,
            random_max_sleep: DEFAULT_RANDOM_MAX_SLEEP,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retry: usize, random_min_sleep: Duration, random_max_sleep: Duration) -> Self {
        Self {
            max_retry,
            random_min_sleep,
            random_max_sleep,
        }
    }

    /// The delays slept between attempts, one per retry.
    pub fn delays(&self) -> Take<Uniform> {
        Uniform::new(self.random_min_sleep, self.random_max_sleep).take(self.max_retry)
    }

    /// Runs `operation` up to `max_retry + 1` times, sleeping a random delay between attempts.
    /// Only transient errors are retried; any other error is returned as soon as it happens.
    /// When the last attempt fails with a transient error the result is
    /// [`Error::RetryExhausted`].
    pub async fn attempt<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = AtomicUsize::new(0);
        let result = Retry::new(
            self.delays(),
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                operation()
            },
            |e: &Error| {
                let retry = e.is_transient();
                let attempt = attempts.load(Ordering::Relaxed);
                // the last failed attempt is reported as exhaustion below
                if retry && attempt <= self.max_retry {
                    warn!(?e, attempt, max_retry = self.max_retry, "Transient failure, retrying");
                }
                retry
            },
        )
        .await;
        let attempts = attempts.into_inner();

        match result {
            Ok(item) => Ok(item),
            Err(e) if e.is_transient() => {
                error!(?e, attempts, "Giving up after retries");
                Err(Error::RetryExhausted {
                    attempts,
                    source: Box::new(e),
                })
            }
            Err(e) => Err(e),
        }
    }
}
