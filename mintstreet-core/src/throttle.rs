// Process-wide request pacing shared by every outbound client. One instance
// guards the whole provider budget: a sliding window of recent call starts
// (max calls per window plus a minimum spacing) in front of a semaphore
// bounding in-flight requests. Waiters queue FIFO on the semaphore.

use crate::config::ThrottleConfig;
use crate::error::{IndexerError, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::time::Instant;

/// Backoff factor for the enhanced-transactions API path.
pub const INDEXER_BACKOFF_FACTOR: u32 = 2;
/// Backoff factor for the RPC path.
pub const RPC_BACKOFF_FACTOR: u32 = 3;

pub struct Throttle {
    min_spacing: Duration,
    window: Duration,
    max_calls_per_window: usize,
    permits: Semaphore,
    recent: Mutex<VecDeque<Instant>>,
}

/// Held for the duration of one outbound call; releases the in-flight slot
/// on drop.
pub struct ThrottlePermit<'a> {
    _permit: SemaphorePermit<'a>,
}

impl Throttle {
    pub fn new(cfg: &ThrottleConfig) -> Self {
        Self {
            min_spacing: Duration::from_millis(cfg.min_spacing_ms),
            window: Duration::from_millis(cfg.window_ms),
            max_calls_per_window: cfg.max_calls_per_window.max(1),
            permits: Semaphore::new(cfg.max_in_flight.max(1)),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until a call may start: an in-flight slot is free, the window
    /// has room, and the minimum spacing from the previous start has passed.
    pub async fn acquire(&self) -> Result<ThrottlePermit<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| IndexerError::Internal("throttle semaphore closed".to_string()))?;

        loop {
            let wait = {
                let mut recent = self.recent.lock().await;
                let now = Instant::now();
                while let Some(&front) = recent.front() {
                    if now.duration_since(front) >= self.window {
                        recent.pop_front();
                    } else {
                        break;
                    }
                }

                let mut wait = Duration::ZERO;
                if let Some(&last) = recent.back() {
                    let since = now.duration_since(last);
                    if since < self.min_spacing {
                        wait = self.min_spacing - since;
                    }
                }
                if recent.len() >= self.max_calls_per_window {
                    if let Some(&oldest) = recent.front() {
                        let until_free = self.window.saturating_sub(now.duration_since(oldest));
                        if until_free > wait {
                            wait = until_free;
                        }
                    }
                }

                if wait.is_zero() {
                    recent.push_back(now);
                    return Ok(ThrottlePermit { _permit: permit });
                }
                wait
            };
            tokio::time::sleep(wait).await;
        }
    }
}

pub fn backoff_delay(base: Duration, attempt: u32, factor: u32) -> Duration {
    base.saturating_mul(factor.saturating_pow(attempt))
}

/// Run `op` up to `max_retries + 1` times. Rate-limit responses with a
/// Retry-After hint sleep for exactly that long; other retryable failures
/// back off `base * factor^attempt`. The last error always reaches the
/// caller once attempts run out.
pub async fn retry_request<T, F, Fut>(
    max_retries: u32,
    base_delay: Duration,
    factor: u32,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries && e.is_retryable() => {
                let delay = match &e {
                    IndexerError::RateLimited {
                        retry_after_ms: Some(ms),
                    } => Duration::from_millis(*ms),
                    _ => backoff_delay(base_delay, attempt, factor),
                };
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "request failed, backing off: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt >= max_retries && e.is_retryable() {
                    tracing::warn!("giving up after {} attempts: {e}", attempt + 1);
                }
                return Err(e);
            }
        }
    }
}
