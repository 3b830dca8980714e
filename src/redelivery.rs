//! Redelivery backoff, applied to messages a transaction rolls back.
//!
//! Modelled as a plain configuration struct rather than a closure, the way
//! `ActiveMqConfig`-style consumer configs elsewhere in the ecosystem drive
//! consumer behaviour through typed fields instead of callbacks.

use std::time::Duration;

/// Backoff schedule applied by a transacted consumer each time it rolls a
/// message back, until `maximum_redeliveries` is hit and the message is
/// poison-acked instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedeliveryPolicy {
    pub initial_redelivery_delay: Duration,
    pub back_off_multiplier:      f64,
    pub use_exponential_back_off: bool,
    pub maximum_redelivery_delay: Option<Duration>,
    pub maximum_redeliveries:     u32,
    /// Percentage (0.0–1.0) of the computed delay added or subtracted at
    /// random to avoid every consumer on a destination retrying in lockstep.
    pub collision_avoidance_percent: f64,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            initial_redelivery_delay: Duration::from_millis(1000),
            back_off_multiplier: 5.0,
            use_exponential_back_off: false,
            maximum_redelivery_delay: None,
            maximum_redeliveries: 6,
            collision_avoidance_percent: 0.0,
        }
    }
}

impl RedeliveryPolicy {
    /// No redeliveries at all: the first rollback poison-acks.
    pub fn no_redelivery() -> Self { Self { maximum_redeliveries: 0, ..Self::default() } }

    /// The delay to wait before redispatching a message that has already
    /// been redelivered `redelivery_count` times.
    ///
    /// `redelivery_count` is 1 on the first rollback. Jitter is applied
    /// deterministically via `jitter_seed` so tests can assert exact values;
    /// callers that don't care can pass any value, it only affects the sign
    /// and magnitude of the collision-avoidance term.
    pub fn redelivery_delay(&self, redelivery_count: u32, jitter_seed: u64) -> Duration {
        let base = if self.use_exponential_back_off {
            let factor = self.back_off_multiplier.powi(redelivery_count.saturating_sub(1) as i32);
            self.initial_redelivery_delay.mul_f64(factor.max(1.0))
        } else {
            self.initial_redelivery_delay
        };
        let base = match self.maximum_redelivery_delay {
            Some(max) if base > max => max,
            _ => base,
        };
        if self.collision_avoidance_percent <= 0.0 {
            return base;
        }
        // A cheap linear-congruential jitter, avoided `rand` since the only
        // thing that matters here is "not exactly in lockstep", not
        // cryptographic quality.
        let spread = (jitter_seed.wrapping_mul(2862933555777941757).wrapping_add(3037000493)
            % 2000) as f64
            / 1000.0
            - 1.0; // in [-1.0, 1.0)
        let factor = 1.0 + spread * self.collision_avoidance_percent;
        base.mul_f64(factor.max(0.0))
    }

    pub fn is_exhausted(&self, redelivery_count: u32) -> bool {
        redelivery_count > self.maximum_redeliveries
    }
}
