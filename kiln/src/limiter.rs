//! Token bucket pacing API submissions.
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Acquisition was interrupted by job cancellation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("rate limiter cancelled")]
pub struct Cancelled;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with a sustained rate and a burst capacity.
///
/// One limiter paces one job. The bucket starts full, so up to `burst`
/// requests go out immediately before the sustained rate takes over.
pub struct RateLimiter {
    qps: f64,
    burst: f64,
    bucket: tokio::sync::Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket refilling at `qps` tokens per second.
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps,
            burst,
            bucket: tokio::sync::Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available.
    ///
    /// Never fails except when `cancel` fires, in which case all waiters
    /// return [`Cancelled`] promptly.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.qps)
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
