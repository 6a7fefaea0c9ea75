use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};
use tracing::debug;

use crate::{Condition, Operation};

/// A retry is either waiting on an attempt or waiting out a backoff delay.
/// ```no_rust
///                  (Ok) --------------------------------> [Ready(Ok)]
///                 /
/// Running(attempt)        (not retryable) --------------> [Ready(Err)]
///                 \      /
///                  (Err)        (no delay left) --------> [Ready(Err)]
///                        \     /
///                       (retryable)
///                              \
///                               (delay) -> Sleeping -> Running(attempt + 1)
/// ```
#[pin_project(project = RetryStateProj)]
enum RetryState<O>
where
    O: Operation,
{
    Running(#[pin] O::Future),
    Sleeping(#[pin] Sleep),
}

/// Future that runs an [`Operation`] until it succeeds, the [`Condition`] rejects the error, or
/// the backoff iterator is exhausted. The first run is not a retry, so an iterator yielding `n`
/// delays allows at most `n + 1` attempts.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    state: RetryState<O>,
    backoff: I,
    operation: O,
    condition: C,
    attempt: usize,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II: IntoIterator<IntoIter = I, Item = I::Item>>(
        backoff: II,
        mut operation: O,
        condition: C,
    ) -> Self {
        Self {
            state: RetryState::Running(operation.run()),
            backoff: backoff.into_iter(),
            operation,
            condition,
            attempt: 1,
        }
    }

    /// Moves into the sleeping state for the next backoff delay. Hands the error back when there
    /// is no delay left.
    fn schedule_retry(self: Pin<&mut Self>, err: O::Error) -> Result<(), O::Error> {
        let mut this = self.project();
        let Some(delay) = this.backoff.next() else {
            return Err(err);
        };
        debug!(attempt = *this.attempt, ?delay, "attempt failed, backing off");
        this.state
            .set(RetryState::Sleeping(sleep_until(Instant::now() + delay)));
        Ok(())
    }

    /// Starts the next attempt.
    fn start_attempt(self: Pin<&mut Self>) {
        let mut this = self.project();
        *this.attempt += 1;
        let next = this.operation.run();
        this.state.set(RetryState::Running(next));
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project().state.project() {
                RetryStateProj::Running(attempt) => {
                    let err = match attempt.poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(item)) => return Poll::Ready(Ok(item)),
                        Poll::Ready(Err(err)) => err,
                    };
                    if !self.condition.can_retry(&err) {
                        return Poll::Ready(Err(err));
                    }
                    if let Err(err) = self.as_mut().schedule_retry(err) {
                        return Poll::Ready(Err(err));
                    }
                }
                RetryStateProj::Sleeping(sleep) => {
                    if sleep.poll(cx).is_pending() {
                        return Poll::Pending;
                    }
                    self.as_mut().start_attempt();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::strategy::uniform::Uniform;

    fn counting_failure(counter: Arc<AtomicUsize>) -> impl FnMut() -> future::Ready<Result<(), usize>> {
        move || {
            let previous = counter.fetch_add(1, Ordering::SeqCst);
            future::ready(Err(previous + 1))
        }
    }

    #[tokio::test]
    async fn first_attempt_succeeds() {
        let result = Retry::new(
            Uniform::from_millis(1, 1),
            || future::ready(Ok::<u64, ()>(42)),
            |_: &()| true,
        )
        .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let result = Retry::new(
            Uniform::from_millis(1, 1),
            counting_failure(Arc::clone(&counter)),
            |_: &usize| false,
        )
        .await;
        assert_eq!(result, Err(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stops_when_condition_rejects() {
        let counter = Arc::new(AtomicUsize::new(0));
        let result = Retry::new(
            Uniform::from_millis(1, 2).take(10),
            counting_failure(Arc::clone(&counter)),
            |e: &usize| *e < 3,
        )
        .await;
        assert_eq!(result, Err(3));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_max_retries_plus_one_attempts() {
        let max_retry = 3;
        let counter = Arc::new(AtomicUsize::new(0));
        let result = Retry::new(
            Uniform::from_millis(1, 1).take(max_retry),
            counting_failure(Arc::clone(&counter)),
            |_: &usize| true,
        )
        .await;
        assert_eq!(result, Err(max_retry + 1));
        assert_eq!(counter.load(Ordering::SeqCst), max_retry + 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::clone(&counter);
        let result = Retry::new(
            Uniform::from_millis(1, 1).take(5),
            move || {
                let attempt = cloned.fetch_add(1, Ordering::SeqCst) + 1;
                future::ready(if attempt < 3 { Err("down") } else { Ok(attempt) })
            },
            |_: &&str| true,
        )
        .await;
        assert_eq!(result, Ok(3));
    }
}
