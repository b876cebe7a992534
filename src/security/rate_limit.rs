//! Per-client rate limiting with temporary bans.
//!
//! Each source IP gets one token bucket per configured HTTP method. Emptying a
//! bucket bans the client for the method's ban duration; while banned every
//! request is rejected without touching the buckets. A background sweeper
//! forgets clients that have been idle longer than the retention window,
//! banned or not.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};

use crate::config::{MethodPolicyConfig, RateLimitConfig};
use crate::observability::metrics;

/// Limits applied to one HTTP method. Immutable after startup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MethodPolicy {
    pub rate_per_sec: f64,
    pub burst: u32,
    pub ban: Duration,
}

impl From<MethodPolicyConfig> for MethodPolicy {
    fn from(config: MethodPolicyConfig) -> Self {
        Self {
            rate_per_sec: config.rate_per_sec,
            burst: config.burst,
            ban: Duration::from_secs(config.ban_secs),
        }
    }
}

/// A simple token bucket rate limiter.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_update: now,
        }
    }

    fn try_acquire(&mut self, policy: &MethodPolicy, now: Instant) -> bool {
        let capacity = policy.burst as f64;
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();

        // Refill tokens
        self.tokens = (self.tokens + elapsed * policy.rate_per_sec).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rate state for a single source address.
#[derive(Debug)]
struct ClientState {
    buckets: HashMap<Method, TokenBucket>,
    banned_until: Option<Instant>,
    last_seen: Instant,
}

impl ClientState {
    fn new(policies: &HashMap<Method, MethodPolicy>, now: Instant) -> Self {
        let buckets = policies
            .iter()
            .map(|(method, policy)| (method.clone(), TokenBucket::new(policy.burst as f64, now)))
            .collect();
        Self {
            buckets,
            banned_until: None,
            last_seen: now,
        }
    }

    fn is_banned(&self, now: Instant) -> bool {
        self.banned_until.is_some_and(|until| now < until)
    }

    fn ban(&mut self, duration: Duration, now: Instant) {
        let until = now + duration;
        self.banned_until = Some(match self.banned_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }
}

/// Why a request was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("Invalid IP address")]
    MalformedAddress,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Too Many Requests (temp ban)")]
    Banned,

    #[error("Too Many Requests")]
    RateExceeded,
}

impl Denial {
    pub fn status(&self) -> StatusCode {
        match self {
            Denial::MalformedAddress => StatusCode::BAD_REQUEST,
            Denial::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Denial::Banned | Denial::RateExceeded => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Denial::MalformedAddress => "malformed_address",
            Denial::MethodNotAllowed => "method_not_allowed",
            Denial::Banned => "banned",
            Denial::RateExceeded => "rate_exceeded",
        }
    }
}

impl IntoResponse for Denial {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Shared limiter state. One instance per server, passed to the middleware via `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    clients: DashMap<String, ClientState>,
    policies: HashMap<Method, MethodPolicy>,
    retention: Duration,
    sweep_interval: Duration,
}

impl RateLimiter {
    pub fn new(
        policies: HashMap<Method, MethodPolicy>,
        retention: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            clients: DashMap::new(),
            policies,
            retention,
            sweep_interval,
        }
    }

    /// Build from configuration. Method names were checked by validation.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let policies = config
            .policies
            .iter()
            .filter_map(|(name, policy)| {
                Method::from_bytes(name.as_bytes())
                    .ok()
                    .map(|method| (method, MethodPolicy::from(*policy)))
            })
            .collect();
        Self::new(policies, config.retention(), config.sweep_interval())
    }

    /// Decide whether a request from `peer` (an `ip:port` string) may proceed.
    pub fn admit(&self, peer: &str, method: &Method) -> Result<(), Denial> {
        self.admit_at(peer, method, Instant::now())
    }

    fn admit_at(&self, peer: &str, method: &Method, now: Instant) -> Result<(), Denial> {
        let key = client_key(peer)?;

        let mut client = self
            .clients
            .entry(key)
            .or_insert_with(|| ClientState::new(&self.policies, now));
        client.last_seen = now;

        if client.is_banned(now) {
            return Err(Denial::Banned);
        }

        let policy = self.policies.get(method).ok_or(Denial::MethodNotAllowed)?;
        let bucket = client
            .buckets
            .entry(method.clone())
            .or_insert_with(|| TokenBucket::new(policy.burst as f64, now));

        if bucket.try_acquire(policy, now) {
            Ok(())
        } else {
            client.ban(policy.ban, now);
            Err(Denial::RateExceeded)
        }
    }

    /// Drop clients idle for longer than the retention window. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let before = self.clients.len();
        self.clients
            .retain(|_, client| now.saturating_duration_since(client.last_seen) <= self.retention);
        before.saturating_sub(self.clients.len())
    }

    /// Number of addresses currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    /// Whether `ip` is inside an active ban window.
    pub fn is_banned(&self, ip: &str) -> bool {
        let now = Instant::now();
        self.clients
            .get(ip)
            .is_some_and(|client| client.is_banned(now))
    }

    /// Periodic sweep until shutdown is signalled.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            interval_secs = self.sweep_interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            "Rate limit sweeper starting"
        );

        let mut ticker = time::interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        tracing::debug!(removed, remaining = self.tracked_clients(), "Swept idle clients");
                    }
                    metrics::record_tracked_clients(self.tracked_clients());
                }
                _ = shutdown.recv() => {
                    tracing::info!("Rate limit sweeper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

/// Client identity: the IP part of the transport peer address.
fn client_key(peer: &str) -> Result<String, Denial> {
    peer.parse::<SocketAddr>()
        .map(|addr| addr.ip().to_string())
        .map_err(|_| Denial::MalformedAddress)
}

/// Middleware function for per-client rate limiting.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    match limiter.admit(&peer, request.method()) {
        Ok(()) => next.run(request).await,
        Err(denial) => {
            tracing::warn!(
                client = %peer,
                method = %request.method(),
                reason = denial.label(),
                "Rate limit rejected request"
            );
            metrics::record_rate_limited(denial.label());
            denial.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: f64, burst: u32, ban_secs: u64) -> RateLimiter {
        let mut policies = HashMap::new();
        policies.insert(
            Method::GET,
            MethodPolicy {
                rate_per_sec: rate,
                burst,
                ban: Duration::from_secs(ban_secs),
            },
        );
        policies.insert(
            Method::POST,
            MethodPolicy {
                rate_per_sec: 1.0,
                burst: 1,
                ban: Duration::from_secs(30),
            },
        );
        RateLimiter::new(policies, Duration::from_secs(300), Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn test_allows_within_burst() {
        let limiter = limiter(5.0, 5, 1);
        for port in 0..5 {
            let peer = format!("10.0.0.1:{}", 12345 + port);
            assert_eq!(limiter.admit(&peer, &Method::GET), Ok(()));
        }
        assert_eq!(limiter.tracked_clients(), 1, "ports share one client");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sixth_request_bans_and_seventh_stays_banned() {
        let limiter = limiter(5.0, 5, 1);
        let peer = "10.0.0.2:54321";

        for _ in 0..5 {
            assert_eq!(limiter.admit(peer, &Method::GET), Ok(()));
        }
        assert_eq!(limiter.admit(peer, &Method::GET), Err(Denial::RateExceeded));
        assert!(limiter.is_banned("10.0.0.2"));

        time::advance(Duration::from_millis(1)).await;
        assert_eq!(limiter.admit(peer, &Method::GET), Err(Denial::Banned));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ban_lasts_exactly_ban_duration() {
        let limiter = limiter(5.0, 5, 2);
        let peer = "10.0.0.3:1000";

        for _ in 0..5 {
            limiter.admit(peer, &Method::GET).unwrap();
        }
        assert_eq!(limiter.admit(peer, &Method::GET), Err(Denial::RateExceeded));

        time::advance(Duration::from_millis(1999)).await;
        assert_eq!(limiter.admit(peer, &Method::GET), Err(Denial::Banned));

        time::advance(Duration::from_millis(1)).await;
        assert_eq!(limiter.admit(peer, &Method::GET), Ok(()));
        assert!(!limiter.is_banned("10.0.0.3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_banned_requests_do_not_consume_tokens() {
        let limiter = limiter(1.0, 2, 1);
        let peer = "10.0.0.4:1";

        limiter.admit(peer, &Method::GET).unwrap();
        limiter.admit(peer, &Method::GET).unwrap();
        assert_eq!(limiter.admit(peer, &Method::GET), Err(Denial::RateExceeded));

        // Hammer during the ban; the bucket keeps refilling underneath.
        for _ in 0..50 {
            assert_eq!(limiter.admit(peer, &Method::GET), Err(Denial::Banned));
        }

        time::advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.admit(peer, &Method::GET), Ok(()));
        assert_eq!(limiter.admit(peer, &Method::GET), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_rate_is_never_banned() {
        let limiter = limiter(5.0, 2, 10);
        let peer = "10.0.0.5:1";

        for _ in 0..100 {
            assert_eq!(limiter.admit(peer, &Method::GET), Ok(()));
            time::advance(Duration::from_millis(200)).await;
        }
        assert!(!limiter.is_banned("10.0.0.5"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_methods_have_separate_buckets() {
        let limiter = limiter(5.0, 5, 1);
        let peer = "10.0.0.6:1";

        assert_eq!(limiter.admit(peer, &Method::POST), Ok(()));
        // POST bucket is empty now, GET is untouched.
        assert_eq!(limiter.admit(peer, &Method::GET), Ok(()));
        assert_eq!(limiter.admit(peer, &Method::POST), Err(Denial::RateExceeded));
        // The ban covers every method.
        assert_eq!(limiter.admit(peer, &Method::GET), Err(Denial::Banned));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_method_and_bad_address() {
        let limiter = limiter(5.0, 5, 1);

        assert_eq!(
            limiter.admit("10.0.0.7:1", &Method::PUT),
            Err(Denial::MethodNotAllowed)
        );
        assert_eq!(
            limiter.admit("invalid", &Method::GET),
            Err(Denial::MalformedAddress)
        );
        assert_eq!(limiter.tracked_clients(), 1, "malformed peers are never tracked");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ban_checked_before_method_policy() {
        let limiter = limiter(1.0, 1, 5);
        let peer = "10.0.0.8:1";

        limiter.admit(peer, &Method::GET).unwrap();
        assert_eq!(limiter.admit(peer, &Method::GET), Err(Denial::RateExceeded));
        assert_eq!(limiter.admit(peer, &Method::PUT), Err(Denial::Banned));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ipv6_peer() {
        let limiter = limiter(5.0, 5, 1);
        assert_eq!(limiter.admit("[::1]:8080", &Method::GET), Ok(()));
        assert!(!limiter.is_banned("::1"));
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_idle_clients_even_when_banned() {
        let limiter = limiter(1.0, 1, 3600);

        limiter.admit("10.0.1.1:1", &Method::GET).unwrap();
        assert_eq!(limiter.admit("10.0.1.1:1", &Method::GET), Err(Denial::RateExceeded));

        time::advance(Duration::from_secs(200)).await;
        limiter.admit("10.0.1.2:1", &Method::GET).unwrap();

        time::advance(Duration::from_secs(101)).await;
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_clients(), 1);

        // The evicted client starts fresh.
        assert_eq!(limiter.admit("10.0.1.1:1", &Method::GET), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_instances_are_independent() {
        let a = limiter(1.0, 1, 10);
        let b = limiter(1.0, 1, 10);

        a.admit("10.0.2.1:1", &Method::GET).unwrap();
        assert_eq!(a.admit("10.0.2.1:1", &Method::GET), Err(Denial::RateExceeded));
        assert_eq!(b.admit("10.0.2.1:1", &Method::GET), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_runs_until_shutdown() {
        let limiter = Arc::new(limiter(5.0, 5, 1));
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(limiter.clone().run_sweeper(rx));

        limiter.admit("10.0.3.1:1", &Method::GET).unwrap();
        time::sleep(Duration::from_secs(400)).await;
        assert_eq!(limiter.tracked_clients(), 0);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_denial_status_mapping() {
        assert_eq!(Denial::MalformedAddress.status(), StatusCode::BAD_REQUEST);
        assert_eq!(Denial::MethodNotAllowed.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(Denial::Banned.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(Denial::RateExceeded.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(Denial::Banned.to_string(), "Too Many Requests (temp ban)");
    }
}
