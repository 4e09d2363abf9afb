//! Fixed-window request limits for the sync endpoints.
//!
//! Registration is unauthenticated, so it is counted per caller address; a
//! caller cycling through node codes still hits the same window. Exchanges are
//! counted per authenticated node.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use outpost_core::models::NodeId;
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;

/// What a window is counted against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RateKey {
    Register(IpAddr),
    Exchange(NodeId),
}

impl RateKey {
    const fn endpoint(self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::Exchange(_) => "exchange",
        }
    }
}

#[derive(Clone)]
pub struct SyncRateLimiter {
    windows: Arc<Mutex<HashMap<RateKey, RateWindow>>>,
    window: Duration,
    register_limit: u32,
    exchange_limit: u32,
    metrics: Arc<RateLimitMetrics>,
}

#[derive(Default)]
struct Counters {
    allowed: AtomicU64,
    limited: AtomicU64,
}

#[derive(Default)]
struct RateLimitMetrics {
    register: Counters,
    exchange: Counters,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub register_allowed: u64,
    pub register_limited: u64,
    pub exchange_allowed: u64,
    pub exchange_limited: u64,
    /// Open windows across all callers
    pub tracked: usize,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

impl SyncRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit_window,
            config.register_rate_limit_per_window,
            config.exchange_rate_limit_per_window,
        )
    }

    fn new(window: Duration, register_limit: u32, exchange_limit: u32) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            window,
            register_limit,
            exchange_limit,
            metrics: Arc::new(RateLimitMetrics::default()),
        }
    }

    /// Count one registration attempt from `address`.
    pub async fn check_register(&self, address: IpAddr) -> Result<(), AppError> {
        self.check(RateKey::Register(address), self.register_limit)
            .await
    }

    /// Count one packet exchange by `node`.
    pub async fn check_exchange(&self, node: NodeId) -> Result<(), AppError> {
        self.check(RateKey::Exchange(node), self.exchange_limit)
            .await
    }

    async fn check(&self, key: RateKey, limit: u32) -> Result<(), AppError> {
        let counters = self.counters(key);
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        windows.retain(|_, window| now.duration_since(window.started_at) < self.window);
        let entry = windows.entry(key).or_insert(RateWindow {
            started_at: now,
            count: 0,
        });

        if entry.count >= limit {
            let retry_after_secs = self
                .window
                .saturating_sub(now.duration_since(entry.started_at))
                .as_secs()
                .max(1);
            counters.limited.fetch_add(1, Ordering::Relaxed);
            match key {
                RateKey::Register(address) => tracing::warn!(
                    target: "outpost::security",
                    %address,
                    retry_after_secs,
                    "Registration rate limit exceeded"
                ),
                RateKey::Exchange(node_id) => tracing::warn!(
                    %node_id,
                    retry_after_secs,
                    "Exchange rate limit exceeded"
                ),
            }
            return Err(AppError::too_many_requests(
                format!("Rate limit exceeded for {}", key.endpoint()),
                retry_after_secs,
            ));
        }

        entry.count += 1;
        counters.allowed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn counters(&self, key: RateKey) -> &Counters {
        match key {
            RateKey::Register(_) => &self.metrics.register,
            RateKey::Exchange(_) => &self.metrics.exchange,
        }
    }

    pub async fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        let tracked = self.windows.lock().await.len();
        let RateLimitMetrics { register, exchange } = self.metrics.as_ref();
        RateLimitMetricsSnapshot {
            register_allowed: register.allowed.load(Ordering::Relaxed),
            register_limited: register.limited.load(Ordering::Relaxed),
            exchange_allowed: exchange.allowed.load(Ordering::Relaxed),
            exchange_limited: exchange.limited.load(Ordering::Relaxed),
            tracked,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const OFFICE: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
    const SITE: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8));

    #[tokio::test]
    async fn exchange_limit_applies_per_node() {
        let limiter = SyncRateLimiter::new(Duration::from_secs(60), 1, 2);
        let desk = NodeId::new();
        let laptop = NodeId::new();

        limiter.check_exchange(desk).await.unwrap();
        limiter.check_exchange(desk).await.unwrap();
        let err = limiter.check_exchange(desk).await.unwrap_err();
        assert!(matches!(err, AppError::TooManyRequests(_, _)));
        limiter.check_exchange(laptop).await.unwrap();

        let metrics = limiter.metrics_snapshot().await;
        assert_eq!(metrics.exchange_allowed, 3);
        assert_eq!(metrics.exchange_limited, 1);
        assert_eq!(metrics.register_allowed, 0);
        assert_eq!(metrics.tracked, 2);
    }

    #[tokio::test]
    async fn register_limit_applies_per_address() {
        let limiter = SyncRateLimiter::new(Duration::from_secs(60), 1, 1);

        limiter.check_register(OFFICE).await.unwrap();
        assert!(limiter.check_register(OFFICE).await.is_err());
        limiter.check_register(SITE).await.unwrap();

        let metrics = limiter.metrics_snapshot().await;
        assert_eq!(metrics.register_allowed, 2);
        assert_eq!(metrics.register_limited, 1);
    }

    #[tokio::test]
    async fn expired_windows_are_dropped() {
        let limiter = SyncRateLimiter::new(Duration::from_millis(20), 1, 1);

        limiter.check_register(OFFICE).await.unwrap();
        assert!(limiter.check_register(OFFICE).await.is_err());

        tokio::time::sleep(Duration::from_millis(40)).await;
        limiter.check_register(OFFICE).await.unwrap();
        assert_eq!(limiter.metrics_snapshot().await.tracked, 1);
    }
}
