//! Rate-limited outbound HTTP plus the shared retry helper.
//!
//! The gate pairs a token bucket with a typed `reqwest` round-tripper. It
//! never retries on its own; consumers wrap calls in [`retry`] and decide
//! per endpoint which failures are worth another attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::error::{Error, Result};
use crate::monitor::Monitor;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket-gated HTTP client for one endpoint family.
pub struct RateLimitedHttp {
    client: Client,
    bucket: Mutex<Bucket>,
    rate: f64,
    burst: f64,
    /// Admission deadline applied by the typed round-trippers; `None`
    /// waits indefinitely.
    admission_deadline: Option<Duration>,
}

impl RateLimitedHttp {
    pub fn new(rate_per_second: f64, burst: u32, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to create HTTP client");
        Self {
            client,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
            rate: rate_per_second,
            burst: burst as f64,
            admission_deadline: None,
        }
    }

    pub fn with_admission_deadline(mut self, deadline: Duration) -> Self {
        self.admission_deadline = Some(deadline);
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Suspend until a token is available. With a deadline, admission that
    /// cannot happen in time fails with `RateLimited` instead of queuing
    /// unboundedly.
    pub async fn acquire(&self, deadline: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };
            if let Some(deadline) = deadline {
                if started.elapsed() + wait > deadline {
                    return Err(Error::RateLimited);
                }
            }
            sleep(wait).await;
        }
    }

    /// Gated GET returning a decoded JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.acquire(self.admission_deadline).await?;
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status(status.as_u16()));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::Decode(e.to_string()))
    }

    /// Gated POST of a JSON body returning a decoded JSON response.
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T> {
        self.acquire(self.admission_deadline).await?;
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status(status.as_u16()));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::Decode(e.to_string()))
    }
}

/// Exponential backoff parameters for one class of operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// `min(base·2^(n-1) + jitter, max_backoff)` for attempt `n` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << (attempt - 1).min(16));
        let jitter_ms = if self.jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter.as_millis() as u64)
        };
        (exp + Duration::from_millis(jitter_ms)).min(self.max_backoff)
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping between attempts.
/// Only errors the taxonomy classifies as retryable are tried again.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    monitor: &Monitor,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            // Malformed payloads get a single fresh read before surfacing.
            Err(e @ Error::Decode(_)) if attempt == 1 && policy.max_attempts > 1 => {
                let delay = policy.backoff(attempt);
                monitor.retry(&format!("{what} returned a malformed payload: {e}, retrying once"));
                sleep(delay).await;
            }
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                monitor.retry(&format!(
                    "{what} attempt {attempt}/{} failed: {e}, retrying in {delay:?}",
                    policy.max_attempts
                ));
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(4), Duration::from_secs(3));
        assert_eq!(policy.backoff(10), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_caps_admissions_per_window() {
        let http = RateLimitedHttp::new(5.0, 2, Duration::from_secs(10));
        let start = Instant::now();
        let mut completed = 0u32;
        while Instant::now().duration_since(start) < Duration::from_secs(1) {
            http.acquire(None).await.unwrap();
            completed += 1;
            if completed > 50 {
                break;
            }
        }
        // rate + burst over a one-second window
        assert!(completed <= 7, "admitted {completed} requests");
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_denies_under_deadline() {
        let http = RateLimitedHttp::new(1.0, 1, Duration::from_secs(10));
        http.acquire(None).await.unwrap();
        let denied = http.acquire(Some(Duration::from_millis(100))).await;
        assert!(matches!(denied, Err(Error::RateLimited)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_after_success() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            jitter: Duration::ZERO,
        };
        let calls = AtomicU32::new(0);
        let result = retry(&policy, &Monitor::new(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Status(503))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn decode_errors_are_retried_exactly_once() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            jitter: Duration::ZERO,
        };
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&policy, &Monitor::new(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Decode("truncated body".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(Error::Decode(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_surfaces_domain_errors_immediately() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&policy, &Monitor::new(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::SlippageExceeded) }
        })
        .await;
        assert!(matches!(result, Err(Error::SlippageExceeded)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
