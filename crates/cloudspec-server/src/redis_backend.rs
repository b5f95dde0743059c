use crate::auth::SharedTokenStore;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::timeout;

#[derive(Clone, Debug)]
pub struct RedisPolicy {
    /// Budget for one complete operation, connection setup included. There is
    /// no retry: callers fall back to their local tier on the first failure so
    /// request latency stays bounded.
    pub timeout: Duration,
    pub max_key_bytes: usize,
}

impl Default for RedisPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(250),
            max_key_bytes: 256,
        }
    }
}

#[derive(Default)]
pub(crate) struct RedisMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub read_fallbacks: AtomicU64,
    pub write_fallbacks: AtomicU64,
    pub rate_limit_fallbacks: AtomicU64,
    pub key_reject_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RedisMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub read_fallbacks: u64,
    pub write_fallbacks: u64,
    pub rate_limit_fallbacks: u64,
    pub key_reject_total: u64,
}

// Sliding-window admission over a sorted set: score = epoch seconds,
// member = "request_id:credit_cost". Runs server-side so the check and the
// record are one atomic step per key.
const WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local window_start = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local credit_cost = tonumber(ARGV[4])
local member_id = ARGV[5]
local window_seconds = tonumber(ARGV[6])

redis.call('ZREMRANGEBYSCORE', key, 0, window_start)

local entries = redis.call('ZRANGE', key, 0, -1)
local total_credits = 0
for _, entry in ipairs(entries) do
    local cost = tonumber(string.match(entry, ':(%d+)$')) or 0
    total_credits = total_credits + cost
end

if total_credits + credit_cost > limit then
    return {0, math.max(0, limit - total_credits)}
end

redis.call('ZADD', key, now, member_id)
redis.call('EXPIRE', key, window_seconds)
return {1, limit - total_credits - credit_cost}
"#;

/// Shared cross-process store. Every operation opens a multiplexed connection,
/// runs under the policy timeout, and reports failure to the caller instead of
/// retrying; the caller's local tier is the fallback.
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    prefix: String,
    policy: RedisPolicy,
    pub(crate) metrics: Arc<RedisMetrics>,
}

impl RedisBackend {
    pub fn new(url: &str, prefix: &str, policy: RedisPolicy) -> Result<Self, String> {
        let client = redis::Client::open(url).map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            policy,
            metrics: Arc::new(RedisMetrics::default()),
        })
    }

    async fn single_attempt<T, Fut, F>(&self, op: F) -> Result<T, String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        match timeout(self.policy.timeout, op()).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(e),
            Err(_) => Err("redis timeout".to_string()),
        }
    }

    pub async fn cache_get(&self, kind: &str, key: &str) -> Result<Option<String>, String> {
        let cache_key = format!("{}:{kind}:{key}", self.prefix);
        let this = self.clone();
        let result = self
            .single_attempt(move || async move {
                let mut conn = this
                    .client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| e.to_string())?;
                conn.get(cache_key).await.map_err(|e| e.to_string())
            })
            .await;
        match result {
            Ok(Some(v)) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(v))
            }
            Ok(None) => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => {
                self.metrics.read_fallbacks.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub async fn cache_set_ex(
        &self,
        kind: &str,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), String> {
        if key.len() > self.policy.max_key_bytes {
            self.metrics.key_reject_total.fetch_add(1, Ordering::Relaxed);
            return Err("redis key rejected by max key size policy".to_string());
        }
        let cache_key = format!("{}:{kind}:{key}", self.prefix);
        let payload = value.to_string();
        let this = self.clone();
        let result = self
            .single_attempt(move || async move {
                let mut conn = this
                    .client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| e.to_string())?;
                let _: () = conn
                    .set_ex(cache_key, payload, ttl_secs)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.metrics.write_fallbacks.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Atomic check-and-record against one identity's credit window. Returns
    /// `(allowed, remaining)` as computed server-side.
    pub async fn window_reserve(
        &self,
        key: &str,
        limit: u64,
        credit_cost: u64,
        member_id: &str,
        window: Duration,
    ) -> Result<(bool, u64), String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| e.to_string())?
            .as_secs_f64();
        let window_start = now - window.as_secs_f64();
        let window_key = format!("{}:ratelimit:{key}", self.prefix);
        let member = member_id.to_string();
        let window_secs = window.as_secs();
        let this = self.clone();
        let result = self
            .single_attempt(move || async move {
                let mut conn = this
                    .client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| e.to_string())?;
                let script = redis::Script::new(WINDOW_SCRIPT);
                let (allowed, remaining): (i64, i64) = script
                    .key(window_key)
                    .arg(window_start)
                    .arg(now)
                    .arg(limit)
                    .arg(credit_cost)
                    .arg(member)
                    .arg(window_secs)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok((allowed == 1, remaining.max(0) as u64))
            })
            .await;
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                self.metrics
                    .rate_limit_fallbacks
                    .fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> RedisMetricsSnapshot {
        RedisMetricsSnapshot {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            read_fallbacks: self.metrics.read_fallbacks.load(Ordering::Relaxed),
            write_fallbacks: self.metrics.write_fallbacks.load(Ordering::Relaxed),
            rate_limit_fallbacks: self.metrics.rate_limit_fallbacks.load(Ordering::Relaxed),
            key_reject_total: self.metrics.key_reject_total.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl SharedTokenStore for RedisBackend {
    async fn get(&self, digest: &str) -> Result<Option<String>, String> {
        self.cache_get("token", digest).await
    }

    async fn set_ex(&self, digest: &str, value: &str, ttl_secs: u64) -> Result<(), String> {
        self.cache_set_ex("token", digest, value, ttl_secs).await
    }
}
