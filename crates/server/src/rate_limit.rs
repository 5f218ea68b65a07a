//! Sliding-window rate limiting over two adjacent fixed windows.
//!
//! Counters live in a [`CounterStore`] under `ratelimit:{identity}:{window}`
//! with a TTL of two windows. A check increments the current window, reads
//! the previous one and weights it by how much of the current window is left.
//! [`RedisCounterStore`] shares the counters between instances;
//! [`MemoryCounterStore`] keeps them in-process.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tokio::task::JoinHandle;

use crate::{clock::Clock, error::ApiError, session::bearer_token, AppState};

pub const PURGE_INTERVAL: Duration = Duration::from_secs(60);

static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// TTL-bearing counters shared by every request path.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increments `key`, creating it with `ttl` when absent or expired.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64>;
    async fn get(&self, key: &str) -> Result<Option<i64>>;
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    value: i64,
    expires_at: DateTime<Utc>,
}

pub struct MemoryCounterStore {
    entries: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drops expired counters and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn start_purge_task(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let purged = self.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "purged expired rate-limit counters");
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64> {
        let now = self.clock.now();
        let expires_at = now + chrono::Duration::from_std(ttl)?;
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert(CounterEntry {
                value: 0,
                expires_at,
            });
        if entry.expires_at <= now {
            *entry = CounterEntry {
                value: 0,
                expires_at,
            };
        }
        entry.value += 1;
        Ok(entry.value)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value))
    }
}

/// Counters in Redis, shared by every server instance pointing at it.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
}

impl RedisCounterStore {
    pub async fn connect(redis_url: &str) -> redis::RedisResult<Self> {
        let client = Client::open(redis_url)?;
        let connection = client.get_connection_manager().await?;
        tracing::info!("established connection to the redis counter store");
        Ok(Self { connection })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut connection = self.connection.clone();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        // Keys are window-scoped, so refreshing the TTL only delays cleanup.
        let (value,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .pexpire(key, ttl_ms)
            .ignore()
            .query_async(&mut connection)
            .await?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let mut connection = self.connection.clone();
        let value: Option<i64> = connection.get(key).await?;
        Ok(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub limited: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_ms: u64,
    pub weighted: f64,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    window_ms: i64,
    limit: u64,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        window_ms: u64,
        limit: u64,
    ) -> Self {
        Self {
            store,
            clock,
            window_ms: i64::try_from(window_ms.max(1)).unwrap_or(i64::MAX),
            limit,
        }
    }

    /// Same window and quota, counted in `store`.
    pub fn with_store(&self, store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            clock: self.clock.clone(),
            window_ms: self.window_ms,
            limit: self.limit,
        }
    }

    /// Counts one request for `identity` and reports whether it is over quota.
    pub async fn check(&self, identity: &str) -> Result<RateDecision> {
        let now_ms = self.clock.now().timestamp_millis();
        let window = now_ms.div_euclid(self.window_ms);
        let elapsed = now_ms.rem_euclid(self.window_ms);
        let elapsed_ratio = elapsed as f64 / self.window_ms as f64;
        let ttl = Duration::from_millis(self.window_ms.unsigned_abs().saturating_mul(2));

        let current = self
            .store
            .increment(&counter_key(identity, window), ttl)
            .await?;
        let previous = self
            .store
            .get(&counter_key(identity, window - 1))
            .await?
            .unwrap_or(0);

        let weighted = previous as f64 * (1.0 - elapsed_ratio) + current as f64;
        let limit = self.limit as f64;

        Ok(RateDecision {
            limited: weighted > limit,
            limit: self.limit,
            remaining: (limit - weighted).floor().max(0.0) as u64,
            reset_ms: (self.window_ms - elapsed).unsigned_abs(),
            weighted,
        })
    }
}

fn counter_key(identity: &str, window: i64) -> String {
    format!("ratelimit:{identity}:{window}")
}

/// Client address with IPv4-mapped IPv6 folded to IPv4. The first
/// `x-forwarded-for` hop wins over the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|hop| hop.trim().parse::<IpAddr>().ok());

    forwarded
        .or_else(|| peer.map(|addr| addr.ip()))
        .map(|ip| match ip {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map_or(IpAddr::V6(v6), IpAddr::V4),
            v4 => v4,
        })
}

/// Applies the limiter to client REST routes. Authenticated callers are keyed
/// by user id and the resolved user is left in the request extensions.
pub async fn enforce(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let mut identity = None;
    if let Some(token) = bearer_token(request.headers()) {
        match state.sessions().authenticate(token).await {
            Ok(Some(user)) => {
                identity = Some(format!("user:{}", user.id));
                request.extensions_mut().insert(user);
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(?err, "session lookup failed during rate limiting"),
        }
    }
    let identity = identity.unwrap_or_else(|| {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        match client_ip(request.headers(), peer) {
            Some(ip) => format!("ip:{ip}"),
            None => "ip:unknown".to_string(),
        }
    });

    let decision = match state.rate_limiter().check(&identity).await {
        Ok(decision) => decision,
        Err(err) => {
            tracing::error!(?err, identity = %identity, "rate limiter unavailable; allowing request");
            return next.run(request).await;
        }
    };

    if decision.limited {
        tracing::warn!(identity = %identity, weighted = decision.weighted, "request rate limited");
        state.record_messaging_rejection("rate_limited");
        let mut response = ApiError::RateLimited.into_response();
        let retry_after = decision.reset_ms.div_ceil(1_000).max(1);
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        apply_headers(response.headers_mut(), &decision);
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &decision);
    response
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
    headers.insert(
        X_RATELIMIT_REMAINING.clone(),
        HeaderValue::from(decision.remaining),
    );
    headers.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(decision.reset_ms));
}
