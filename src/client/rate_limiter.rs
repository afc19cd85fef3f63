//! Token bucket limiting requests to TradingView

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Token bucket refilled continuously at `requests_per_minute / 60` per second
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum tokens (burst size)
    capacity: f64,
    /// Tokens currently available
    tokens: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Last time tokens were added
    last_refill: Instant,
}

impl TokenBucket {
    /// Full bucket allowing `requests_per_minute`, at least one
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let capacity = requests_per_minute.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_rate: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    /// Add tokens for the time elapsed since the last refill
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token if one is available
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token is available
    pub fn time_until_available(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }
}

/// Shared limiter; callers wait for a token before each request
#[derive(Debug)]
pub struct RateLimiter {
    /// Bucket shared by every request from one client
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Create a limiter allowing `requests_per_minute`
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::per_minute(requests_per_minute)),
        }
    }

    /// Take a token without waiting
    pub fn try_acquire(&self) -> bool {
        self.bucket.lock().try_acquire()
    }

    /// Wait until a token is available and take it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                if bucket.try_acquire() {
                    return;
                }
                bucket.time_until_available()
            };
            debug!("Rate limited, waiting {:.2}s", wait.as_secs_f64());
            tokio::time::sleep(wait).await;
        }
    }
}
