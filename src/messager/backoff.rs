//! Backoff policies: retry spacing for redelivery and for storage failures.

use std::time::Duration;

use rand::Rng;

use crate::config::MessagerConfig;

/// First retry delay after a failed poll.
const POLL_RETRY_INITIAL: Duration = Duration::from_millis(100);
/// Spread applied to each poll retry, as a fraction of the delay.
const POLL_RETRY_JITTER: f64 = 0.1;

/// Retry spacing for the poller after storage errors.
///
/// Doubles from 100ms up to the poller interval. Jitter is applied to each
/// returned delay but not to the progression, so the sequence keeps growing
/// until it hits the cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    cap: Duration,
    current: Option<Duration>,
}

impl ExponentialBackoff {
    pub fn for_poller(poller_interval: Duration) -> Self {
        Self {
            cap: poller_interval.max(POLL_RETRY_INITIAL),
            current: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = match self.current {
            None => POLL_RETRY_INITIAL,
            Some(previous) => previous.saturating_mul(2).min(self.cap),
        };
        self.current = Some(base);

        let spread = base.as_secs_f64() * POLL_RETRY_JITTER;
        let jittered = base.as_secs_f64() + rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64(jittered.max(0.001)).min(self.cap)
    }

    /// Start over after a successful poll.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Redelivery delay as a function of a message's epoch.
///
/// `delay(epoch) = min * multiplier^epoch`, capped at `max`. Jitter only ever
/// stretches a delay upwards and is bounded so that `delay(epoch + 1)` can
/// never come out shorter than `delay(epoch)`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    min_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(min: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        let min_ms = min.as_millis() as u64;
        let max_ms = (max.as_millis() as u64).max(min_ms);
        let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.0
        };
        // (1 + jitter) * base(e) must stay <= base(e + 1)
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, multiplier - 1.0)
        } else {
            0.0
        };
        Self {
            min_ms,
            max_ms,
            multiplier,
            jitter,
        }
    }

    /// Builds the policy for one table from its resolved bounds and the
    /// global growth settings.
    pub fn for_table(min: Duration, max: Duration, config: &MessagerConfig) -> Self {
        Self::new(min, max, config.backoff_multiplier, config.backoff_jitter)
    }

    fn base_ms(&self, epoch: i64) -> f64 {
        let exp = epoch.clamp(0, 64) as i32;
        (self.min_ms as f64 * self.multiplier.powi(exp)).min(self.max_ms as f64)
    }

    /// Delay without jitter.
    pub fn base_delay(&self, epoch: i64) -> Duration {
        Duration::from_millis(self.base_ms(epoch) as u64)
    }

    pub fn delay(&self, epoch: i64) -> Duration {
        let base = self.base_ms(epoch);
        let stretched = if self.jitter > 0.0 && base > 0.0 {
            base * (1.0 + rand::rng().random_range(0.0..self.jitter))
        } else {
            base
        };
        Duration::from_millis(stretched.min(self.max_ms as f64) as u64)
    }
}
