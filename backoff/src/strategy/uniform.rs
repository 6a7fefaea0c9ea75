use std::time::Duration;

use rand::Rng;

/// A backoff strategy that sleeps a random duration drawn uniformly from `[min, max]` before every
/// retry. Writers that fail together do not retry together.
///
/// The iterator never ends on its own, bound it with `take(max_retry)`.
///
/// # Example
/// ```
/// use backoff::strategy::uniform::Uniform;
/// use std::time::Duration;
///
/// let mut backoff = Uniform::new(Duration::from_millis(100), Duration::from_millis(300)).take(2);
///
/// let delay = backoff.next().unwrap();
/// assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(300));
/// assert!(backoff.next().is_some());
/// assert_eq!(backoff.next(), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Uniform {
    min: Duration,
    max: Duration,
}

impl Uniform {
    /// Creates the strategy. If `max` is below `min` the two are swapped.
    pub fn new(min: Duration, max: Duration) -> Self {
        if max < min {
            Self { min: max, max: min }
        } else {
            Self { min, max }
        }
    }

    pub fn from_millis(min_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(min_ms), Duration::from_millis(max_ms))
    }

    /// Builds the strategy from fractional seconds. Negative and non-finite values count as zero.
    pub fn from_secs_f64(min_secs: f64, max_secs: f64) -> Self {
        Self::new(secs_to_duration(min_secs), secs_to_duration(max_secs))
    }

    pub fn min_delay(&self) -> Duration {
        self.min
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

impl Iterator for Uniform {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        // degenerate range, nothing to draw from
        if self.min == self.max {
            return Some(self.min);
        }
        let nanos = rand::rng().random_range(self.min.as_nanos()..=self.max.as_nanos());
        Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }
}
