//! Retry pacing strategies for failed jobs.
//!
//! The original queue retried failed jobs on the next poll tick; that
//! behavior is the default ([`BackoffStrategy::constant`] of one poll
//! period), but an exponential strategy can be configured for deployments
//! where the carrier penalizes rapid retries. Both can be modified with a
//! random jitter. All constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! use datashare::backoff::{BackoffStrategy, Strategy};
//! use chrono::TimeDelta;
//!
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2))
//!     .with_max(TimeDelta::seconds(30));
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
//! assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
//! assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given a job attempt as a number returns the [`TimeDelta`] to wait
    /// before the job should be retried.
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// Constant backoff strategy.
///
/// Always returns the same value no matter what the attempt is. Constructed
/// via [`BackoffStrategy::constant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u16) -> TimeDelta {
        self.delay
    }
}

/// Exponential backoff strategy.
///
/// Grows exponentially with each attempt; constructed via
/// [`BackoffStrategy::exponential`], advisably clamped with
/// [`BackoffStrategy::with_max`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut seconds = self
            .base
            .num_seconds()
            .checked_pow(attempt.into())
            .unwrap_or(i64::MAX);
        if let Some(max) = self.max {
            seconds = seconds.min(max.num_seconds());
        }
        TimeDelta::seconds(seconds)
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter added to the backoff in the range `-delta <= jitter <= delta`.
    Absolute(TimeDelta),
    /// A random jitter added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        };
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter)
    }
}

/// A backoff strategy optionally modified by a [`Jitter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
}

impl BackoffStrategy<Constant> {
    /// Creates a [`BackoffStrategy`] with a constant backoff strategy.
    ///
    /// # Example
    ///
    /// ```
    /// # use datashare::backoff::{BackoffStrategy, Strategy};
    /// # use chrono::TimeDelta;
    /// let strategy = BackoffStrategy::constant(TimeDelta::seconds(10));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(10));
    /// assert_eq!(strategy.backoff(3), TimeDelta::seconds(10));
    /// ```
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] with an exponential backoff strategy.
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`].
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
        }
    }

    /// Applies a [`Jitter`] to the computed backoff.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let backoff = self.strategy.backoff(attempt);
        match self.jitter {
            Some(jitter) => jitter.apply_jitter(backoff).max(TimeDelta::zero()),
            None => backoff,
        }
    }
}
