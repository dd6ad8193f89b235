//! Per-client upload rate limiting, checked before any staging I/O.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::ApiError;

#[derive(Debug)]
struct Window {
    started: Instant,
    requests: u32,
}

/// Fixed-window request counter keyed by client IP.
///
/// Rejections happen before the request body is read, so an over-limit
/// client cannot consume staging disk space.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<HashMap<IpAddr, Window>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    /// Records one request for `ip`. Over-limit requests get the seconds
    /// remaining until the window resets.
    pub async fn check(&self, ip: IpAddr) -> Result<(), ApiError> {
        if self.max_requests == 0 {
            return Ok(());
        }

        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let entry = windows.entry(ip).or_insert(Window {
            started: now,
            requests: 0,
        });

        if now.duration_since(entry.started) > self.window {
            entry.started = now;
            entry.requests = 0;
        }

        if entry.requests >= self.max_requests {
            let elapsed = now.duration_since(entry.started);
            let retry_after = self.window.saturating_sub(elapsed).as_secs().max(1);
            return Err(ApiError::TooManyRequests { retry_after });
        }

        entry.requests += 1;
        Ok(())
    }

    /// Drops windows that have lapsed, keeping the map bounded.
    pub async fn prune(&self) {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        windows.retain(|_, entry| now.duration_since(entry.started) <= self.window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().expect("ip")
    }

    #[tokio::test]
    async fn allows_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check(localhost()).await.is_ok());
        assert!(limiter.check(localhost()).await.is_ok());
        let result = limiter.check(localhost()).await;
        assert!(matches!(result, Err(ApiError::TooManyRequests { .. })));
    }

    #[tokio::test]
    async fn zero_limit_disables_checks() {
        let limiter = RateLimiter::new(0, Duration::from_secs(60));
        for _ in 0..100 {
            assert!(limiter.check(localhost()).await.is_ok());
        }
    }

    #[tokio::test]
    async fn clients_are_limited_independently() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let other: IpAddr = "10.0.0.2".parse().expect("ip");
        assert!(limiter.check(localhost()).await.is_ok());
        assert!(limiter.check(other).await.is_ok());
        assert!(limiter.check(localhost()).await.is_err());
    }

    #[tokio::test]
    async fn prune_drops_lapsed_windows() {
        let limiter = RateLimiter::new(1, Duration::ZERO);
        let _ = limiter.check(localhost()).await;
        limiter.prune().await;
        assert!(limiter.windows.lock().await.is_empty());
    }
}
