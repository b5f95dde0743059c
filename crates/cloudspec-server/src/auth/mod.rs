// SPDX-License-Identifier: Apache-2.0

//! Token verification with a per-process tier over an optional shared tier.
//!
//! Tokens never appear in cache keys or logs; both tiers are addressed by a
//! salted digest. The shared tier stores identities as JSON and failed
//! validations as a literal `null`, the wire contract every process in the
//! fleet reads and writes.

mod provider;

pub use provider::{HttpIdentityProvider, IdentityProvider, StaticIdentityProvider};

use crate::config::TokenCacheOptions;
use async_trait::async_trait;
use cloudspec_core::salted_token_digest;
use cloudspec_model::UserIdentity;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const NEGATIVE_SENTINEL: &str = "null";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthError(pub String);

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for AuthError {}

/// Cross-process cache tier keyed by token digest. Errors are reported as
/// strings; callers degrade to their local tier and never propagate them.
#[async_trait]
pub trait SharedTokenStore: Send + Sync {
    async fn get(&self, digest: &str) -> Result<Option<String>, String>;
    async fn set_ex(&self, digest: &str, value: &str, ttl_secs: u64) -> Result<(), String>;
}

/// Cache answer. `Hit(None)` is a remembered failed validation and is as
/// authoritative as a remembered identity.
#[derive(Debug, Clone)]
pub enum Lookup {
    Hit(Option<UserIdentity>),
    Miss,
}

struct L1Entry {
    identity: Option<UserIdentity>,
    expires_at: Instant,
    last_used: Instant,
}

#[derive(Default)]
struct TokenCacheMetrics {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    negative_hits: AtomicU64,
    evictions: AtomicU64,
    l2_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCacheMetricsSnapshot {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub negative_hits: u64,
    pub evictions: u64,
    pub l2_errors: u64,
}

pub struct TokenCache {
    salt: String,
    l1_ttl: Duration,
    l1_max_size: usize,
    l2_ttl: Duration,
    cache_negatives: bool,
    l1: Mutex<HashMap<String, L1Entry>>,
    shared: Option<Arc<dyn SharedTokenStore>>,
    metrics: TokenCacheMetrics,
}

impl TokenCache {
    #[must_use]
    pub fn new(options: &TokenCacheOptions, shared: Option<Arc<dyn SharedTokenStore>>) -> Arc<Self> {
        Arc::new(Self {
            salt: options.salt.clone(),
            l1_ttl: options.l1_ttl,
            l1_max_size: options.l1_max_size.max(1),
            l2_ttl: options.l2_ttl,
            cache_negatives: options.cache_negatives,
            l1: Mutex::new(HashMap::new()),
            shared,
            metrics: TokenCacheMetrics::default(),
        })
    }

    fn digest(&self, token: &str) -> String {
        salted_token_digest(token, &self.salt)
    }

    /// L1 then L2. An L2 hit is copied into L1 so the next request on this
    /// process stays local.
    pub async fn lookup(&self, token: &str) -> Lookup {
        let digest = self.digest(token);
        let now = Instant::now();
        {
            let mut l1 = self.l1.lock().await;
            match l1.get_mut(&digest) {
                Some(entry) if entry.expires_at > now => {
                    entry.last_used = now;
                    self.metrics.l1_hits.fetch_add(1, Ordering::Relaxed);
                    if entry.identity.is_none() {
                        self.metrics.negative_hits.fetch_add(1, Ordering::Relaxed);
                    }
                    return Lookup::Hit(entry.identity.clone());
                }
                Some(_) => {
                    l1.remove(&digest);
                }
                None => {}
            }
        }
        if let Some(shared) = &self.shared {
            match shared.get(&digest).await {
                Ok(Some(raw)) => {
                    if raw == NEGATIVE_SENTINEL {
                        self.metrics.l2_hits.fetch_add(1, Ordering::Relaxed);
                        self.metrics.negative_hits.fetch_add(1, Ordering::Relaxed);
                        if self.cache_negatives {
                            self.remember_l1(&digest, None).await;
                        }
                        return Lookup::Hit(None);
                    }
                    match serde_json::from_str::<UserIdentity>(&raw) {
                        Ok(identity) => {
                            self.metrics.l2_hits.fetch_add(1, Ordering::Relaxed);
                            self.remember_l1(&digest, Some(identity.clone())).await;
                            return Lookup::Hit(Some(identity));
                        }
                        Err(e) => {
                            debug!("shared token entry parse failed: {e}");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.metrics.l2_errors.fetch_add(1, Ordering::Relaxed);
                    debug!("shared token read failed: {e}");
                }
            }
        }
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        Lookup::Miss
    }

    /// Remembers a verification outcome in both tiers. `None` is only written
    /// when negative caching is on; shared-tier failures are absorbed here.
    pub async fn store(&self, token: &str, identity: Option<&UserIdentity>) {
        if identity.is_none() && !self.cache_negatives {
            return;
        }
        let digest = self.digest(token);
        self.remember_l1(&digest, identity.cloned()).await;
        if let Some(shared) = &self.shared {
            let payload = match identity {
                Some(id) => match serde_json::to_string(id) {
                    Ok(json) => json,
                    Err(e) => {
                        debug!("token entry encode failed: {e}");
                        return;
                    }
                },
                None => NEGATIVE_SENTINEL.to_string(),
            };
            if let Err(e) = shared
                .set_ex(&digest, &payload, self.l2_ttl.as_secs())
                .await
            {
                self.metrics.l2_errors.fetch_add(1, Ordering::Relaxed);
                debug!("shared token write failed: {e}");
            }
        }
    }

    /// Cache-aside verification. Provider errors degrade to "unauthenticated"
    /// without caching, so an identity outage never poisons either tier.
    pub async fn verify_token(
        &self,
        token: &str,
        provider: &dyn IdentityProvider,
    ) -> Option<UserIdentity> {
        match self.lookup(token).await {
            Lookup::Hit(identity) => identity,
            Lookup::Miss => match provider.verify(token).await {
                Ok(identity) => {
                    self.store(token, identity.as_ref()).await;
                    identity
                }
                Err(e) => {
                    debug!("identity provider unavailable: {e}");
                    None
                }
            },
        }
    }

    async fn remember_l1(&self, digest: &str, identity: Option<UserIdentity>) {
        let now = Instant::now();
        let mut l1 = self.l1.lock().await;
        l1.retain(|_, entry| entry.expires_at > now);
        if l1.len() >= self.l1_max_size && !l1.contains_key(digest) {
            // Still full after dropping expired entries: evict the least
            // recently used one.
            let oldest = l1
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                l1.remove(&key);
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        l1.insert(
            digest.to_string(),
            L1Entry {
                identity,
                expires_at: now + self.l1_ttl,
                last_used: now,
            },
        );
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> TokenCacheMetricsSnapshot {
        TokenCacheMetricsSnapshot {
            l1_hits: self.metrics.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.metrics.l2_hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            negative_hits: self.metrics.negative_hits.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            l2_errors: self.metrics.l2_errors.load(Ordering::Relaxed),
        }
    }
}
