//! # Exponential backoff with jitter.
//!
//! [`Backoff`] computes the wait before the next retry attempt:
//!
//! 1. A `429`/`503` response carrying a valid `Retry-After` is honored verbatim.
//! 2. Otherwise the exponential base is `min(max, min × 2^attempt)`.
//! 3. The base is randomized according to the [`Jitter`] strategy.
//! 4. The result is clamped into `[min, max]`.
//!
//! Strategies follow <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter>.
//!
//! ## Concurrency
//! An engine mutates its random source (and, for [`Jitter::Decorrelated`],
//! the previous wait) on every call, which is why [`Backoff::next_wait`]
//! takes `&mut self`. Give each in-flight call its own engine; one engine is
//! reused only by calls made one after another.

use std::time::{Duration, SystemTime};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};

/// Used when a zero minimum wait is supplied.
pub const DEFAULT_MIN_WAIT: Duration = Duration::from_millis(100);
/// Used when a zero maximum wait is supplied.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(20_000);

/// Randomization applied to the exponential base.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Jitter {
    /// Plain exponential backoff.
    #[default]
    None,
    /// `random[0, exponential)`.
    Full,
    /// `exponential/2 + random[0, exponential/2)`.
    Equal,
    /// `min + random[0, max(3 × previous, min) − min)`, capped at `max`.
    /// Stateful: each wait depends on the previous one.
    Decorrelated,
}

/// Backoff engine. See the [module docs](self).
#[derive(Clone, Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    previous: Duration,
    strategy: Jitter,
    rng: StdRng,
}

impl Backoff {
    /// Creates an engine seeded from the thread-local generator.
    ///
    /// Zero bounds fall back to [`DEFAULT_MIN_WAIT`]/[`DEFAULT_MAX_WAIT`];
    /// a `max` below `min` is raised to `min`.
    pub fn new(min: Duration, max: Duration, strategy: Jitter) -> Self {
        Self::with_rng(min, max, strategy, StdRng::from_rng(&mut rand::rng()))
    }

    /// Creates an engine with a fixed seed, producing a reproducible sequence.
    pub fn with_seed(min: Duration, max: Duration, strategy: Jitter, seed: u64) -> Self {
        Self::with_rng(min, max, strategy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(min: Duration, max: Duration, strategy: Jitter, rng: StdRng) -> Self {
        let min = if min.is_zero() { DEFAULT_MIN_WAIT } else { min };
        let max = if max.is_zero() { DEFAULT_MAX_WAIT } else { max };
        Self {
            min,
            max: max.max(min),
            previous: Duration::ZERO,
            strategy,
            rng,
        }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn strategy(&self) -> Jitter {
        self.strategy
    }

    /// Wait before retry `attempt` (1-indexed), given the rejected response if any.
    pub fn next_wait(&mut self, response: Option<&Response>, attempt: u32) -> Duration {
        self.next_wait_for(
            response.map(|response| (response.status(), response.headers())),
            attempt,
        )
    }

    /// Same as [`Backoff::next_wait`], from a status code and headers.
    pub fn next_wait_for(
        &mut self,
        response: Option<(StatusCode, &HeaderMap)>,
        attempt: u32,
    ) -> Duration {
        if let Some((status, headers)) = response {
            if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
            {
                let hint = headers
                    .get(RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(parse_retry_after);
                if let Some(delay) = hint {
                    return delay;
                }
            }
        }

        let exponential = self.exponential(attempt);
        let jittered = self.jitter(exponential);
        self.clamp(jittered)
    }

    /// `min(max, min × 2^attempt)`, saturating at `max`.
    fn exponential(&self, attempt: u32) -> Duration {
        match 1u32
            .checked_shl(attempt)
            .and_then(|factor| self.min.checked_mul(factor))
        {
            Some(exponential) if exponential < self.max => exponential,
            _ => self.max,
        }
    }

    fn jitter(&mut self, exponential: Duration) -> Duration {
        if exponential.is_zero() {
            return Duration::from_nanos(1);
        }

        match self.strategy {
            Jitter::None => exponential,
            Jitter::Full => self.random_below(exponential),
            Jitter::Equal => {
                let half = exponential / 2;
                half + self.random_below(half)
            }
            Jitter::Decorrelated => {
                if self.previous.is_zero() {
                    self.previous = self.min;
                }
                let range = self.previous.saturating_mul(3).max(self.min);
                let next = (self.min + self.random_below(range - self.min)).min(self.max);
                self.previous = next;
                next
            }
        }
    }

    /// Uniform in `[0, bound)`, or zero for an empty range.
    fn random_below(&mut self, bound: Duration) -> Duration {
        let nanos = u64::try_from(bound.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.rng.random_range(0..nanos))
    }

    /// Zero or above `max` becomes `max`; below `min` becomes `min`.
    fn clamp(&self, delay: Duration) -> Duration {
        if delay.is_zero() || delay > self.max {
            return self.max;
        }
        if delay < self.min {
            return self.min;
        }
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_WAIT, DEFAULT_MAX_WAIT, Jitter::None)
    }
}

/// Parses a `Retry-After` header value.
///
/// Supports delay-seconds (`"120"`) and HTTP-dates
/// (`"Fri, 31 Dec 1999 23:59:59 GMT"`). Negative seconds and unparseable
/// values yield `None`; a date in the past yields `Some(Duration::ZERO)`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(seconds) = trimmed.parse::<i64>() {
        return u64::try_from(seconds).ok().map(Duration::from_secs);
    }

    let at = httpdate::parse_http_date(trimmed).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
}
