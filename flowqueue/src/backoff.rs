//! Backoff strategies used to schedule the next attempt of a failed job.
//!
//! Two strategies are provided:
//!
//! 1. Constant
//! 2. Exponential
//!
//! each of which can optionally have a maximum and a random jitter applied.
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use flowqueue::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::minutes(1))
//!     .with_max(TimeDelta::minutes(10))
//!     .with_jitter(Jitter::Absolute(TimeDelta::seconds(5)));
//!
//! assert!(strategy.backoff(1) >= TimeDelta::seconds(55));
//! assert!(strategy.backoff(1) <= TimeDelta::seconds(65));
//! // Note the max here is the max plus max jitter
//! assert!(strategy.backoff(8) <= TimeDelta::seconds(605));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// The backoff applied to jobs unless configured otherwise: 1, 2, 4, 8, ... minutes.
pub const DEFAULT_BACKOFF: BackoffStrategy<Exponential> =
    BackoffStrategy::exponential(TimeDelta::minutes(1));

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the retry number (starting at 1) returns the [`TimeDelta`] to wait before the job
    /// should be attempted again.
    fn backoff(&self, attempt: u32) -> TimeDelta;
}

/// Constant backoff strategy.
///
/// __Note:__ This type cannot be constructed directly, instead [`BackoffStrategy::constant`]
/// should be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u32) -> TimeDelta {
        self.delay
    }
}

/// Exponential backoff strategy.
///
/// The first retry waits `base`, and every subsequent retry waits twice as long as the previous
/// one.
///
/// __Note:__ This type cannot be constructed directly, instead [`BackoffStrategy::exponential`]
/// should be used.
///
/// # Example
///
/// ```
/// # use flowqueue::prelude::*;
/// # use chrono::TimeDelta;
///
/// let strategy =
///     BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(30));
///
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
/// assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
/// assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
/// assert_eq!(strategy.backoff(4), TimeDelta::seconds(16));
/// assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let factor = 1i64
            .checked_shl(attempt.saturating_sub(1))
            .filter(|factor| *factor > 0)
            .unwrap_or(i64::MAX);
        let mut milliseconds = self
            .base
            .num_milliseconds()
            .checked_mul(factor)
            .unwrap_or(i64::MAX);
        if let Some(max) = self.max {
            milliseconds = milliseconds.min(max.num_milliseconds());
        }
        TimeDelta::try_milliseconds(milliseconds).unwrap_or(TimeDelta::MAX)
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the backoff in the range `-delta =< jitter =< delta`.
    Absolute(TimeDelta),
    /// A random jitter to be added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        }
        .abs();
        if milliseconds == 0 {
            return value;
        }
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value
            .checked_add(&TimeDelta::milliseconds(jitter))
            .unwrap_or(value)
    }
}

/// A [`Strategy`] with an optional jitter and a lower bound.
///
/// # Example
///
/// ```
/// # use flowqueue::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy = BackoffStrategy::constant(TimeDelta::seconds(10));
///
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(10));
/// assert_eq!(strategy.backoff(7), TimeDelta::seconds(10));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Constant> {
    /// Creates a [`BackoffStrategy`] that always waits `delay`.
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] that waits `base`, then doubles on every retry.
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Caps the backoff at `max` (before jitter is applied).
    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.strategy.max = Some(max);
        self
    }
}

impl<T: Strategy> BackoffStrategy<T> {
    const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Applies a random jitter to every computed backoff.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// The smallest backoff that will ever be returned, including after jitter.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T: Strategy> Strategy for BackoffStrategy<T> {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let backoff = self.strategy.backoff(attempt);
        let backoff = match self.jitter {
            Some(jitter) => jitter.apply_jitter(backoff),
            None => backoff,
        };
        backoff.max(self.min)
    }
}
