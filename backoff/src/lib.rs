//! Retry an async operation with backoff.
//!
//! An [`Operation`] produces a fresh Future every time it is run. When the Future resolves to an
//! error, [`retry::Retry`] consults the [`Condition`] to decide whether the error is worth another
//! attempt, and if it is, sleeps for the next duration handed out by the backoff [`strategy`].
//! The retry stops as soon as the operation succeeds, the condition rejects the error, or the
//! strategy runs out of durations.
//!
//! ```rust
//! use backoff::retry::Retry;
//! use backoff::strategy::uniform::Uniform;
//!
//! async fn push() -> Result<u64, ()> {
//!     Ok(42)
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let backoff = Uniform::from_millis(1, 5).take(3);
//!     let result = Retry::new(backoff, push, |_: &()| true).await;
//!     assert_eq!(result, Ok(42));
//! }
//! ```

use std::future::Future;

/// Backoff strategies. Every strategy is an `Iterator<Item = Duration>`; the number of retries is
/// bounded with [`take`](https://doc.rust-lang.org/std/iter/struct.Take.html).
pub mod strategy;

/// Conditional retry till we run out of backoff.
pub mod retry;

/// Decides whether an error is retryable. Returning `false` ends the retry immediately and the
/// error is handed back to the caller as is.
pub trait Condition<E> {
    fn can_retry(&self, error: &E) -> bool;
}

/// Any `Fn(&E) -> bool` is a [`Condition`].
impl<E, F> Condition<E> for F
where
    F: Fn(&E) -> bool,
{
    fn can_retry(&self, error: &E) -> bool {
        self(error)
    }
}

/// An `Operation` creates a new Future on every run. Each run is one attempt.
pub trait Operation {
    type Item;
    type Error;
    /// The [`Future`] returned when the Operation is run.
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    #[must_use = "futures do nothing unless you `.await` or poll them"]
    fn run(&mut self) -> Self::Future;
}

/// Any [`FnMut`] returning a Future whose output is a [`Result`] is an [`Operation`].
impl<T, E, R, F> Operation for F
where
    R: Future<Output = Result<T, E>>,
    F: FnMut() -> R,
{
    type Item = T;
    type Error = E;
    type Future = R;

    fn run(&mut self) -> Self::Future {
        self()
    }
}
