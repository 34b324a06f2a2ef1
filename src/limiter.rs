//! Token-bucket rate limiter bounding outbound upstream calls.
//!
//! Tokens refill continuously at `refill_per_second` up to `capacity`.
//! Acquiring never borrows against future refill (no negative balances),
//! and all bucket mutation happens under a single mutex so concurrent
//! callers cannot lose updates.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

// =============================================================================
// Bucket State
// =============================================================================

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Credit tokens for the time elapsed since the last refill, capped at
    /// capacity. Invariant: `0 <= tokens <= capacity`.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_second)
            .min(self.capacity);
        self.last_refill = now;
    }

    /// Time until at least one token is available, `None` if one already is.
    fn time_to_next_token(&self) -> Option<Duration> {
        if self.tokens >= 1.0 {
            return None;
        }
        let deficit = 1.0 - self.tokens;
        Some(Duration::from_secs_f64(deficit / self.refill_per_second))
    }
}

/// Snapshot of the bucket for the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub tokens: f64,
    pub capacity: u32,
    pub refill_per_second: f64,
}

// =============================================================================
// Rate Limiter
// =============================================================================

/// Token-bucket limiter shared by all dispatcher workers.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter starting with a full bucket.
    pub fn new(refill_per_second: f64, capacity: u32) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: capacity as f64,
                capacity: capacity as f64,
                refill_per_second,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available right now. Non-blocking.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Suspend until a token is available or `cancel` fires.
    ///
    /// Cancellation is surfaced as `Error::Cancelled`, distinct from
    /// backpressure (which is never an error, only a wait), so the
    /// dispatcher can tell shutdown apart from a slow refill.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                bucket.refill(Instant::now());
                match bucket.time_to_next_token() {
                    None => {
                        bucket.tokens -= 1.0;
                        return Ok(());
                    }
                    Some(wait) => wait,
                }
            };

            // Another caller may win the token while we sleep; loop and
            // re-check rather than assuming the wait was sufficient.
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    /// Current bucket contents for `stats()`.
    pub fn stats(&self) -> RateLimiterStats {
        let mut bucket = self.bucket.lock();
        bucket.refill(Instant::now());
        RateLimiterStats {
            tokens: bucket.tokens,
            capacity: bucket.capacity as u32,
            refill_per_second: bucket.refill_per_second,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
