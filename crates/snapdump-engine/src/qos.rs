//! QoS: token bucket limiting how fast image bytes are pulled.
//!
//! Tokens are bytes: capacity and fill rate share the unit of whatever is
//! consumed. Refill is lazy, computed from the monotonic clock on each
//! access; there is no background timer. A request takes all of its
//! tokens or none.
//!
//! The bucket itself is not synchronised. Transfers that share one bucket
//! go through [`SharedBucket`].

use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    fill_rate: f64,
    last_refill: Instant,
}

/// A bucket several producers may draw from.
pub type SharedBucket = Arc<Mutex<TokenBucket>>;

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    #[error("bucket capacity must be positive and finite, got {0}")]
    Capacity(f64),

    #[error("fill rate must be positive and finite, got {0}")]
    FillRate(f64),
}

fn is_valid_param(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

fn clamp_param(v: f64) -> f64 {
    if is_valid_param(v) {
        v
    } else {
        0.0
    }
}

impl TokenBucket {
    /// A full bucket. Non-positive or non-finite parameters are clamped to
    /// zero: a zero-capacity bucket refuses every non-empty request.
    pub fn new(capacity: f64, fill_rate: f64) -> Self {
        let clamped = (clamp_param(capacity), clamp_param(fill_rate));
        if !is_valid_param(capacity) || !is_valid_param(fill_rate) {
            tracing::warn!(capacity, fill_rate, "token bucket parameters clamped to zero");
        }
        Self::starting_at(clamped.0, clamped.1, Instant::now())
    }

    /// Like [`TokenBucket::new`] but rejects parameters that would clamp.
    pub fn try_new(capacity: f64, fill_rate: f64) -> Result<Self, RateLimitError> {
        if !is_valid_param(capacity) {
            return Err(RateLimitError::Capacity(capacity));
        }
        if !is_valid_param(fill_rate) {
            return Err(RateLimitError::FillRate(fill_rate));
        }
        Ok(Self::starting_at(capacity, fill_rate, Instant::now()))
    }

    fn starting_at(capacity: f64, fill_rate: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            fill_rate,
            last_refill: now,
        }
    }

    pub fn shared(self) -> SharedBucket {
        Arc::new(Mutex::new(self))
    }

    /// Take `tokens` if that many are available. Returns false and leaves
    /// the level untouched otherwise.
    pub fn consume(&mut self, tokens: f64) -> bool {
        self.consume_at(tokens, Instant::now())
    }

    /// [`TokenBucket::consume`] against an explicit clock reading.
    pub fn consume_at(&mut self, tokens: f64, now: Instant) -> bool {
        // Zero, negative and NaN requests take nothing and touch nothing.
        if !(tokens > 0.0) {
            return true;
        }

        self.refill(now);

        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.fill_rate).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Level as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.tokens.min(self.capacity)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn fill_rate(&self) -> f64 {
        self.fill_rate
    }
}
