// SPDX-License-Identifier: Apache-2.0

//! Credit-based sliding-window admission. Each request spends route-dependent
//! credits from a per-identity 60 second window; the check and the record are
//! one step, and a rejected request spends nothing.

use crate::config::RateLimitOptions;
use crate::redis_backend::RedisBackend;
use async_trait::async_trait;
use cloudspec_model::UserIdentity;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

pub const WINDOW_SECONDS: u64 = 60;
pub const DEFAULT_CREDITS_PER_MINUTE: u32 = 60;
pub const UNAUTHORIZED_PENALTY_CREDITS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u64,
}

impl RateDecision {
    #[must_use]
    pub fn headers(&self, limit: u32, cost: u32) -> RateLimitHeaders {
        RateLimitHeaders {
            limit,
            cost,
            remaining: self.remaining,
        }
    }
}

/// Values surfaced as `X-RateLimit-Limit`, `X-RateLimit-Cost` and
/// `X-RateLimit-Remaining` on limited responses, allowed or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub cost: u32,
    pub remaining: u64,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Admission check and record in one step. `credits_per_minute` overrides
    /// the instance default for identities carrying their own allowance.
    async fn is_allowed(
        &self,
        key: &str,
        credits_per_minute: Option<u32>,
        credit_cost: u32,
        request_id: Option<&str>,
    ) -> RateDecision;

    fn credits_per_minute(&self) -> u32;
}

/// Per-process window over `(instant, cost)` entries. Suitable for dev and
/// single-replica deployments, and as the degraded mode behind the shared
/// backend.
pub struct InMemoryRateLimiter {
    default_credits: u32,
    window: Duration,
    requests: Mutex<HashMap<String, Vec<(Instant, u32)>>>,
}

impl InMemoryRateLimiter {
    #[must_use]
    pub fn new(default_credits: u32) -> Self {
        Self {
            default_credits,
            window: Duration::from_secs(WINDOW_SECONDS),
            requests: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn is_allowed(
        &self,
        key: &str,
        credits_per_minute: Option<u32>,
        credit_cost: u32,
        _request_id: Option<&str>,
    ) -> RateDecision {
        let limit = u64::from(credits_per_minute.unwrap_or(self.default_credits));
        let cost = u64::from(credit_cost);
        let now = Instant::now();
        let mut requests = self.requests.lock().await;
        let entries = requests.entry(key.to_string()).or_default();
        entries.retain(|(at, _)| now.duration_since(*at) < self.window);
        let used: u64 = entries.iter().map(|(_, c)| u64::from(*c)).sum();
        if used + cost > limit {
            return RateDecision {
                allowed: false,
                remaining: limit.saturating_sub(used),
            };
        }
        entries.push((now, credit_cost));
        RateDecision {
            allowed: true,
            remaining: limit - used - cost,
        }
    }

    fn credits_per_minute(&self) -> u32 {
        self.default_credits
    }
}

/// Shared window in Redis so every replica spends from the same allowance.
/// When the shared store cannot answer within its budget, the decision comes
/// from a process-local window instead of failing the request.
pub struct RedisRateLimiter {
    backend: RedisBackend,
    default_credits: u32,
    window: Duration,
    fallback: InMemoryRateLimiter,
}

impl RedisRateLimiter {
    #[must_use]
    pub fn new(backend: RedisBackend, default_credits: u32) -> Self {
        Self {
            backend,
            default_credits,
            window: Duration::from_secs(WINDOW_SECONDS),
            fallback: InMemoryRateLimiter::new(default_credits),
        }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn is_allowed(
        &self,
        key: &str,
        credits_per_minute: Option<u32>,
        credit_cost: u32,
        request_id: Option<&str>,
    ) -> RateDecision {
        let limit = u64::from(credits_per_minute.unwrap_or(self.default_credits));
        let member = match request_id {
            Some(id) => format!("{id}:{credit_cost}"),
            None => format!("{}:{credit_cost}", Uuid::new_v4()),
        };
        match self
            .backend
            .window_reserve(key, limit, u64::from(credit_cost), &member, self.window)
            .await
        {
            Ok((allowed, remaining)) => RateDecision { allowed, remaining },
            Err(e) => {
                warn!(key, "shared rate limit unavailable, using local window: {e}");
                self.fallback
                    .is_allowed(key, credits_per_minute, credit_cost, request_id)
                    .await
            }
        }
    }

    fn credits_per_minute(&self) -> u32 {
        self.default_credits
    }
}

/// Ordered route-to-cost table. The first entry whose path prefixes the
/// request path wins; unmatched paths spend the default cost.
#[derive(Debug, Clone)]
pub struct RouteCostTable {
    costs: Vec<(String, u32)>,
    default_cost: u32,
}

impl RouteCostTable {
    #[must_use]
    pub fn new(costs: Vec<(String, u32)>, default_cost: u32) -> Self {
        Self {
            costs,
            default_cost,
        }
    }

    #[must_use]
    pub fn cost_for(&self, path: &str) -> u32 {
        for (route, cost) in &self.costs {
            if path.starts_with(route.as_str()) {
                return *cost;
            }
        }
        self.default_cost
    }
}

/// Authenticated callers are limited per user so the allowance follows them
/// across addresses; anonymous callers are limited per source address.
#[must_use]
pub fn rate_limit_key(identity: Option<&UserIdentity>, peer_addr: &str) -> String {
    match identity {
        Some(id) => format!("user:{}", id.user_id.as_str()),
        None => format!("ip:{peer_addr}"),
    }
}

/// Charges a missing or invalid credential against the caller's address.
/// The raised limit leaves headroom above the normal allowance so probing
/// cannot exhaust a window the same caller would get once authenticated.
pub async fn record_unauthorized_penalty(
    limiter: &dyn RateLimiter,
    peer_addr: &str,
) -> RateDecision {
    let key = format!("ip:{peer_addr}");
    let limit = limiter.credits_per_minute() + UNAUTHORIZED_PENALTY_CREDITS;
    limiter
        .is_allowed(&key, Some(limit), UNAUTHORIZED_PENALTY_CREDITS, None)
        .await
}

/// Wires the configured backend. Falls back to the per-process window when
/// the shared one is requested but not available, rather than refusing to
/// start.
#[must_use]
pub fn build_rate_limiter(
    options: &RateLimitOptions,
    backend: Option<RedisBackend>,
) -> Option<Arc<dyn RateLimiter>> {
    if !options.enabled {
        return None;
    }
    let credits = options.credits_per_minute;
    match (options.backend.as_str(), backend) {
        ("redis", Some(backend)) => Some(Arc::new(RedisRateLimiter::new(backend, credits))),
        ("redis", None) => {
            warn!("shared rate limit requested without a shared store, using local window");
            Some(Arc::new(InMemoryRateLimiter::new(credits)))
        }
        _ => Some(Arc::new(InMemoryRateLimiter::new(credits))),
    }
}
