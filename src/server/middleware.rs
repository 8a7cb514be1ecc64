// Middleware for authentication and rate limiting

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::AppState;

/// API key check against the configured key set. Disabled when auth is off.
/// Missing key -> 401, wrong key -> 403. The health endpoint is exempt and
/// mounted outside this layer.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if !state.auth_enabled {
        return Ok(next.run(request).await);
    }

    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());

    match presented {
        None => Err(StatusCode::UNAUTHORIZED),
        Some(key) if state.api_keys.iter().any(|k| k == key) => Ok(next.run(request).await),
        Some(_) => Err(StatusCode::FORBIDDEN),
    }
}

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter, one bucket per client IP. Cloning shares the
/// underlying table, so the router layer and the purge task see one state.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    buckets: DashMap<IpAddr, Bucket>,
    /// Burst ceiling a fresh or long-idle bucket starts at.
    capacity: f64,
    /// Sustained tokens per second.
    refill_rate: f64,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64, burst: f64) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner {
                buckets: DashMap::new(),
                capacity: burst,
                refill_rate: requests_per_second,
            }),
        }
    }

    /// Take one token from `ip`'s bucket. `false` means the caller is over
    /// its budget and the request should be refused.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut bucket = self.inner.buckets.entry(ip).or_insert_with(|| Bucket {
            tokens: self.inner.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.inner.refill_rate).min(self.inner.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets idle longer than `idle_secs`. The serve loop calls this
    /// on a timer so the table stays bounded by the set of recent clients.
    pub fn purge_idle(&self, idle_secs: u64) {
        let cutoff = Duration::from_secs(idle_secs);
        let now = Instant::now();
        self.inner
            .buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < cutoff);
    }

    pub fn tracked_ips(&self) -> usize {
        self.inner.buckets.len()
    }
}

/// Axum middleware that enforces per-IP rate limiting.
///
/// Extracts the source IP from the `X-Forwarded-For` header (proxy-aware)
/// and falls back to localhost. Returns 429 Too Many Requests when the
/// bucket for that IP is exhausted.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let ip = extract_ip(&request).unwrap_or(IpAddr::from([127, 0, 0, 1]));

    if state.rate_limiter.check(ip) {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::TOO_MANY_REQUESTS)
    }
}

fn extract_ip(request: &Request<Body>) -> Option<IpAddr> {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_burst_then_exhaustion() {
        let limiter = RateLimiter::new(1.0, 3.0);
        assert!(limiter.check(ip(1)));
        assert!(limiter.check(ip(1)));
        assert!(limiter.check(ip(1)));
        assert!(!limiter.check(ip(1)));
    }

    #[test]
    fn test_buckets_are_per_ip() {
        let limiter = RateLimiter::new(1.0, 1.0);
        assert!(limiter.check(ip(1)));
        assert!(!limiter.check(ip(1)));
        assert!(limiter.check(ip(2)));
        assert_eq!(limiter.tracked_ips(), 2);
    }

    #[test]
    fn test_purge_idle_drops_stale_buckets() {
        let limiter = RateLimiter::new(1.0, 1.0);
        limiter.check(ip(1));
        limiter.purge_idle(0);
        assert_eq!(limiter.tracked_ips(), 0);
    }
}
