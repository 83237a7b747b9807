//! Per-connection sliding-window rate limiter (spec §4.3.1 "rendezvous
//! side rate limiter"): default 100 requests/second with a burst of 150,
//! blocking the connection for 5 seconds once the burst is exhausted.

use std::time::{Duration, Instant};

/// Default sustained rate, in requests per second.
pub const DEFAULT_RATE_PER_SEC: u32 = 100;
/// Default burst capacity above the sustained rate.
pub const DEFAULT_BURST: u32 = 150;
/// How long a connection is blocked once it exceeds its burst.
pub const BLOCK_DURATION: Duration = Duration::from_secs(5);

/// A token-bucket limiter scoped to one rendezvous connection.
///
/// Tokens refill continuously at `rate_per_sec`, capped at `burst`.
/// Once the bucket is empty, the limiter reports blocked for
/// [`BLOCK_DURATION`] regardless of how many tokens would otherwise
/// have refilled in that window — this turns a burst into a clean
/// cooldown instead of a slow trickle back to available.
pub struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        Self {
            rate_per_sec: f64::from(rate_per_sec),
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last_refill: Instant::now(),
            blocked_until: None,
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_RATE_PER_SEC, DEFAULT_BURST)
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst);
        self.last_refill = now;
    }

    /// Record one request attempt. Returns `Ok(())` if it's allowed, or
    /// `Err(retry_after)` if the connection is currently blocked.
    pub fn check(&mut self) -> Result<(), Duration> {
        let now = Instant::now();

        if let Some(until) = self.blocked_until {
            if now < until {
                return Err(until - now);
            }
            self.blocked_until = None;
        }

        self.refill(now);

        if self.tokens < 1.0 {
            self.blocked_until = Some(now + BLOCK_DURATION);
            return Err(BLOCK_DURATION);
        }

        self.tokens -= 1.0;
        Ok(())
    }
}
