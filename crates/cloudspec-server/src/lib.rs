#![forbid(unsafe_code)]

mod auth;
mod config;
mod currency;
mod dataset;
mod rate_limit;
mod redis_backend;
mod refresh;

pub const CRATE_NAME: &str = "cloudspec-server";

pub use auth::{
    AuthError, HttpIdentityProvider, IdentityProvider, Lookup, StaticIdentityProvider,
    SharedTokenStore, TokenCache, TokenCacheMetricsSnapshot,
};
pub use config::{
    validate_startup_config_contract, DatasetOptions, RateLimitOptions, RatesOptions,
    SharedStoreOptions, TokenCacheOptions,
};
pub use currency::{
    CurrencyRateTable, EcbSource, ExchangeRateCache, FakeRatesSource, RatesError, RatesFetch,
    RatesSource, RatesStatus, RefreshMode, RefreshSchedule, BACKOFF_CEILING, BACKOFF_INITIAL,
    SCHEDULED_SLACK,
};
pub use dataset::{
    ArtifactSource, DatasetHealth, DatasetManager, FakeArtifactSource, FetchedArtifact,
    HttpArtifactSource, LocalFileSource, Snapshot, SnapshotError, SnapshotSession,
};
pub use rate_limit::{
    build_rate_limiter, rate_limit_key, record_unauthorized_penalty, InMemoryRateLimiter,
    RateDecision, RateLimitHeaders, RateLimiter, RedisRateLimiter, RouteCostTable,
    DEFAULT_CREDITS_PER_MINUTE, UNAUTHORIZED_PENALTY_CREDITS, WINDOW_SECONDS,
};
pub use redis_backend::{RedisBackend, RedisMetricsSnapshot, RedisPolicy};
pub use refresh::{Produce, Produced, RefreshError, RefreshableResource, ResourceStatus};


#[cfg(test)]
mod dataset_manager_tests;
