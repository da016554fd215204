/// Per-IP request-rate envelope.
///
/// Token bucket: `RATE_LIMIT_BURST` capacity refilled at `RATE_LIMIT_RPS`
/// tokens per second, tracked per client address in a DashMap with periodic
/// cleanup of idle entries. In-memory is the right scope for a single
/// instance; a shared store would be needed across replicas.

use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension,
};
use dashmap::DashMap;
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::sleep;

use crate::config::RateLimitConfig;
use crate::middleware::error_handling::GatewayError;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    requests_per_second: f64,
    burst: f64,
    buckets: Arc<DashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let limiter = Self {
            requests_per_second: f64::from(config.requests_per_second.max(1)),
            burst: f64::from(config.burst.max(1)),
            buckets: Arc::new(DashMap::new()),
        };

        // Idle buckets are full buckets; drop them after 10 minutes.
        let buckets = limiter.buckets.clone();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(300)).await;
                let now = Instant::now();
                buckets.retain(|_, bucket| {
                    now.duration_since(bucket.last_refill) < Duration::from_secs(600)
                });
                tracing::debug!("Rate limiter cleanup: {} tracked clients", buckets.len());
            }
        });

        limiter
    }

    /// Takes one token from the client's bucket; false = limited.
    pub fn try_acquire(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(client.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.requests_per_second).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub async fn rate_limit_middleware(
    Extension(limiter): Extension<Arc<RateLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let client = addr.ip().to_string();

    if !limiter.try_acquire(&client) {
        tracing::warn!("⛔ Rate limit exceeded for {}", client);
        return GatewayError::RateLimited.into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rps: u32, burst: u32) -> RateLimiter {
        RateLimiter {
            requests_per_second: f64::from(rps),
            burst: f64::from(burst),
            buckets: Arc::new(DashMap::new()),
        }
    }

    #[test]
    fn burst_allows_then_blocks() {
        let limiter = limiter(1, 3);
        assert!(limiter.try_acquire("1.2.3.4"));
        assert!(limiter.try_acquire("1.2.3.4"));
        assert!(limiter.try_acquire("1.2.3.4"));
        assert!(!limiter.try_acquire("1.2.3.4"));
        // A different client has its own bucket.
        assert!(limiter.try_acquire("5.6.7.8"));
    }
}
