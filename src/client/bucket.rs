//! Per-provider token bucket with lazy refill.
//!
//! All arithmetic runs on a caller-supplied monotonic `Instant`; the
//! bucket never reads the wall clock. The bucket is single-writer: the
//! provider client serializes every access.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    /// Tokens restored over one full interval.
    refill_per_interval: f64,
    interval: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket of `max_tokens` refilling completely every
    /// `interval`.
    pub fn new(max_tokens: u32, interval: Duration, now: Instant) -> Self {
        let max = f64::from(max_tokens.max(1));
        Self {
            tokens: max,
            max_tokens: max,
            refill_per_interval: max,
            interval,
            last_refill: now,
        }
    }

    /// Take one token if available. Returns false (without further
    /// mutation of the count) when the bucket is empty.
    pub fn acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Refill-then-peek without taking a token.
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed >= self.interval {
            self.tokens = self.max_tokens;
        } else if !self.interval.is_zero() {
            let fraction = elapsed.as_secs_f64() / self.interval.as_secs_f64();
            self.tokens = (self.tokens + fraction * self.refill_per_interval).min(self.max_tokens);
        }
        self.last_refill = now;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
