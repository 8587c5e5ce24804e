//! Token-bucket limiter shared by the workers of one scan job.

use crate::error::{Error, Result};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct RateLimiter {
    /// Tokens per second; 0 disables limiting.
    rate: u32,
    state: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Bucket starts full with capacity equal to the per-second rate.
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            state: Mutex::new(Bucket { tokens: rate as f64, last_refill: Instant::now() }),
        }
    }

    /// Take one token, sleeping until the refill when the bucket is dry.
    /// Cancellation interrupts the wait; a cancelled acquire consumes nothing.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        if self.rate == 0 {
            return Ok(());
        }
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let wait = {
                let mut bucket = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens =
                    (bucket.tokens + elapsed * self.rate as f64).min(self.rate as f64);
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate as f64))
                }
            };
            match wait {
                None => return Ok(()),
                Some(delay) => tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                },
            }
        }
    }
}
