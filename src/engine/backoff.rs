//! Randomized exponential backoff for store contention.
//!
//! Each worker owns one of these; nothing is shared between loops.

use std::time::Duration;

/// Exponent cap. Far beyond any useful ceiling, keeps `exp` finite.
const MAX_EXPONENT: u32 = 32;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    consecutive: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            consecutive: 0,
        }
    }

    /// Consecutive contention errors since the last reset.
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Forget past contention. Called on any non-contention outcome.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Record one more contention error and draw a delay uniformly from
    /// `[0, base * e^n)`, clamped to `max`.
    pub fn next_delay(&mut self) -> Duration {
        self.consecutive = self.consecutive.saturating_add(1);
        self.ceiling().mul_f64(fastrand::f64())
    }

    fn ceiling(&self) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }
        let n = self.consecutive.min(MAX_EXPONENT);
        let secs = self.base.as_secs_f64() * f64::from(n).exp();
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }
}
