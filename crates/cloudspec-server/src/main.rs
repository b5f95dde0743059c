#![forbid(unsafe_code)]

use cloudspec_core::ExitCode;
use cloudspec_server::{
    build_rate_limiter, validate_startup_config_contract, ArtifactSource, DatasetManager,
    DatasetOptions, EcbSource, ExchangeRateCache, HttpArtifactSource, HttpIdentityProvider,
    LocalFileSource, RateLimitOptions, RatesOptions, RedisBackend, RedisPolicy, SharedStoreOptions,
    SharedTokenStore, TokenCache, TokenCacheOptions,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| match v.as_str() {
            "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
            "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_duration_ms(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_u64(name, default_ms))
}

fn env_duration_secs(name: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_u64(name, default_secs))
}

/// Ordered `path=cost` pairs; order matters because the first matching route
/// prefix wins.
fn env_cost_list(name: &str, default: &[(&str, u32)]) -> Vec<(String, u32)> {
    let raw = env::var(name).unwrap_or_default();
    if raw.trim().is_empty() {
        return default
            .iter()
            .map(|(path, cost)| ((*path).to_string(), *cost))
            .collect();
    }
    raw.split(',')
        .filter_map(|item| {
            let (path, cost) = item.split_once('=')?;
            let path = path.trim();
            let cost = cost.trim().parse::<u32>().ok()?;
            if path.is_empty() {
                return None;
            }
            Some((path.to_string(), cost))
        })
        .collect()
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(cloudspec_core::ENV_CLOUDSPEC_LOG_LEVEL)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    if env_bool("CLOUDSPEC_LOG_JSON", true) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    init_tracing();

    let dataset_opts = DatasetOptions {
        artifact_url: env::var("CLOUDSPEC_DATASET_URL").ok().filter(|v| !v.is_empty()),
        artifact_path: env::var("CLOUDSPEC_DATASET_PATH")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from),
        poll_interval: env_duration_secs("CLOUDSPEC_DATASET_POLL_SECONDS", 60),
        retention: env_usize("CLOUDSPEC_DATASET_RETENTION", 2),
        open_timeout: env_duration_ms("CLOUDSPEC_DATASET_OPEN_TIMEOUT_MS", 3000),
        fetch_timeout: env_duration_secs("CLOUDSPEC_DATASET_FETCH_TIMEOUT_SECONDS", 60),
        sqlite_pragma_cache_kib: env_u64("CLOUDSPEC_SQLITE_CACHE_KIB", 32 * 1024) as i64,
        sqlite_pragma_mmap_bytes: env_u64("CLOUDSPEC_SQLITE_MMAP_BYTES", 256 * 1024 * 1024) as i64,
        ..DatasetOptions::default()
    };
    let token_opts = TokenCacheOptions {
        salt: env::var("CLOUDSPEC_TOKEN_CACHE_SALT").unwrap_or_default(),
        l1_ttl: env_duration_secs("CLOUDSPEC_TOKEN_CACHE_L1_TTL_SECONDS", 60),
        l1_max_size: env_usize("CLOUDSPEC_TOKEN_CACHE_L1_MAX_SIZE", 1000),
        l2_ttl: env_duration_secs("CLOUDSPEC_TOKEN_CACHE_L2_TTL_SECONDS", 300),
        cache_negatives: env_bool("CLOUDSPEC_TOKEN_CACHE_NEGATIVE", true),
        identity_url: env::var("CLOUDSPEC_IDENTITY_URL").ok().filter(|v| !v.is_empty()),
        identity_timeout: env_duration_ms("CLOUDSPEC_IDENTITY_TIMEOUT_MS", 5000),
    };
    let rate_opts = RateLimitOptions {
        enabled: env_bool("CLOUDSPEC_RATE_LIMIT_ENABLED", false),
        backend: env::var("CLOUDSPEC_RATE_LIMIT_BACKEND").unwrap_or_else(|_| "memory".to_string()),
        credits_per_minute: env_u64("CLOUDSPEC_RATE_LIMIT_CREDITS_PER_MINUTE", 60) as u32,
        default_cost: env_u64("CLOUDSPEC_RATE_LIMIT_DEFAULT_COST", 1) as u32,
        route_costs: env_cost_list(
            "CLOUDSPEC_RATE_LIMIT_COSTS",
            &[("/servers", 3), ("/server_prices", 5)],
        ),
    };
    let shared_opts = SharedStoreOptions {
        url: env::var("CLOUDSPEC_REDIS_URL").ok().filter(|v| !v.is_empty()),
        prefix: env::var("CLOUDSPEC_REDIS_PREFIX").unwrap_or_else(|_| "cloudspec".to_string()),
        timeout: env_duration_ms("CLOUDSPEC_REDIS_TIMEOUT_MS", 250),
    };
    let rates_opts = RatesOptions {
        source_url: env::var("CLOUDSPEC_RATES_URL")
            .unwrap_or_else(|_| RatesOptions::default().source_url),
        download_timeout: env_duration_secs("CLOUDSPEC_RATES_DOWNLOAD_TIMEOUT_SECONDS", 60),
        head_timeout: env_duration_secs("CLOUDSPEC_RATES_HEAD_TIMEOUT_SECONDS", 10),
    };

    if let Err(e) = validate_startup_config_contract(
        &dataset_opts,
        &token_opts,
        &rate_opts,
        &shared_opts,
        &rates_opts,
    ) {
        error!("invalid configuration: {e}");
        std::process::exit(ExitCode::Validation as i32);
    }

    let redis = match &shared_opts.url {
        Some(url) => {
            let policy = RedisPolicy {
                timeout: shared_opts.timeout,
                ..RedisPolicy::default()
            };
            match RedisBackend::new(url, &shared_opts.prefix, policy) {
                Ok(backend) => Some(backend),
                Err(e) => {
                    warn!("shared store unavailable, continuing without it: {e}");
                    None
                }
            }
        }
        None => None,
    };

    let shared_store = redis
        .clone()
        .map(|backend| Arc::new(backend) as Arc<dyn SharedTokenStore>);
    let tokens = TokenCache::new(&token_opts, shared_store);
    let identity = token_opts
        .identity_url
        .as_ref()
        .map(|url| Arc::new(HttpIdentityProvider::new(url.clone(), token_opts.identity_timeout)));
    let limiter = build_rate_limiter(&rate_opts, redis.clone());

    let rates_source = Arc::new(EcbSource::new(
        rates_opts.source_url.clone(),
        rates_opts.download_timeout,
        rates_opts.head_timeout,
    ));
    let rates = match ExchangeRateCache::initial_load(rates_source).await {
        Ok(rates) => rates,
        Err(e) => {
            error!("exchange rates unavailable from every source: {e}");
            std::process::exit(ExitCode::DependencyFailure as i32);
        }
    };
    rates.spawn_updater().await;

    let dataset_source: Arc<dyn ArtifactSource> =
        if let Some(path) = dataset_opts.artifact_path.clone() {
            Arc::new(LocalFileSource::new(path))
        } else if let Some(url) = dataset_opts.artifact_url.clone() {
            Arc::new(HttpArtifactSource::new(url, dataset_opts.fetch_timeout))
        } else {
            error!("no dataset source configured");
            std::process::exit(ExitCode::Validation as i32);
        };
    let dataset = match DatasetManager::new(dataset_source, dataset_opts) {
        Ok(dataset) => dataset,
        Err(e) => {
            error!("dataset manager startup failed: {e}");
            std::process::exit(ExitCode::DependencyFailure as i32);
        }
    };
    if let Err(e) = dataset.load_initial().await {
        error!("initial dataset load failed: {e}");
        std::process::exit(ExitCode::DependencyFailure as i32);
    }
    dataset.spawn_updater().await;

    info!(
        shared_store = redis.is_some(),
        rate_limiter = limiter.is_some(),
        identity = identity.is_some(),
        "cloudspec-server configured"
    );

    let dataset_bg = dataset.clone();
    let rates_bg = rates.clone();
    let tokens_bg = tokens.clone();
    let redis_bg = redis.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let health = dataset_bg.health().await;
            let rates_status = rates_bg.status().await;
            let token_metrics = tokens_bg.metrics_snapshot();
            let shared_fallbacks = redis_bg
                .as_ref()
                .map(|b| {
                    let m = b.metrics_snapshot();
                    m.read_fallbacks + m.write_fallbacks + m.rate_limit_fallbacks
                })
                .unwrap_or(0);
            info!(
                dataset_ready = health.ready,
                dataset_version = health.version_hash.as_deref().unwrap_or("none"),
                rates_mode = ?rates_status.mode,
                rates_currencies = rates_status.currencies,
                token_l1_hits = token_metrics.l1_hits,
                token_misses = token_metrics.misses,
                shared_fallbacks,
                "heartbeat"
            );
        }
    });

    info!("cloudspec-server running");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    dataset.shutdown().await;
    rates.shutdown().await;
    info!("cloudspec-server stopped");
    Ok(())
}
