//! Per-identity admission control.
//!
//! One token bucket per device id: configured capacity and refill rate.
//! Denials are silent to the vehicle (no NACK); the record is simply not
//! admitted. Buckets of vehicles that went quiet are evicted periodically.

use std::num::NonZeroU32;

use config::RateLimitConfig;
use governor::{DefaultKeyedRateLimiter, Quota};

/// Keyed token-bucket over inbound record rate.
pub struct IngressLimiter {
    limiter: Option<DefaultKeyedRateLimiter<String>>,
}

impl IngressLimiter {
    /// Builds the limiter; a disabled configuration admits everything.
    pub fn new(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self { limiter: None };
        }
        let rate = NonZeroU32::new(config.records_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rate).allow_burst(burst);
        Self {
            limiter: Some(DefaultKeyedRateLimiter::keyed(quota)),
        }
    }

    /// Admits or drops one record for the identity.
    pub fn try_admit(&self, device_id: &str) -> bool {
        match &self.limiter {
            None => true,
            Some(limiter) => limiter.check_key(&device_id.to_string()).is_ok(),
        }
    }

    /// Evicts buckets that have been idle long enough to be full again.
    /// Called periodically; bounds the table to recently active vehicles.
    pub fn sweep(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
        }
    }

    /// Number of tracked buckets.
    pub fn tracked(&self) -> usize {
        self.limiter.as_ref().map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use config::RateLimitConfig;

    use crate::limiter::IngressLimiter;

    #[test]
    fn burst_is_admitted_then_excess_is_dropped() {
        let limiter = IngressLimiter::new(&RateLimitConfig {
            enabled: true,
            records_per_second: 10,
            burst: 10,
        });

        let admitted = (0..20).filter(|_| limiter.try_admit("X")).count();
        assert_eq!(admitted, 10);
    }

    #[test]
    fn buckets_are_per_identity() {
        let limiter = IngressLimiter::new(&RateLimitConfig {
            enabled: true,
            records_per_second: 1,
            burst: 1,
        });

        assert!(limiter.try_admit("X"));
        assert!(!limiter.try_admit("X"));
        assert!(limiter.try_admit("Y"));
        assert_eq!(limiter.tracked(), 2);
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let limiter = IngressLimiter::new(&RateLimitConfig {
            enabled: false,
            records_per_second: 1,
            burst: 1,
        });

        assert!((0..100).all(|_| limiter.try_admit("X")));
        assert_eq!(limiter.tracked(), 0);
    }
}
