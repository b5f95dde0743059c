use std::path::PathBuf;
use std::time::Duration;

/// Where snapshot generations live and how often the upstream artifact is
/// polled for changes.
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub data_dir: PathBuf,
    pub artifact_url: Option<String>,
    pub artifact_path: Option<PathBuf>,
    pub poll_interval: Duration,
    pub retention: usize,
    pub open_timeout: Duration,
    pub fetch_timeout: Duration,
    pub sqlite_pragma_cache_kib: i64,
    pub sqlite_pragma_mmap_bytes: i64,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            data_dir: cloudspec_core::resolve_cloudspec_data_dir().join("snapshots"),
            artifact_url: None,
            artifact_path: None,
            poll_interval: Duration::from_secs(60),
            retention: 2,
            open_timeout: Duration::from_secs(3),
            fetch_timeout: Duration::from_secs(60),
            sqlite_pragma_cache_kib: 32 * 1024,
            sqlite_pragma_mmap_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenCacheOptions {
    pub salt: String,
    pub l1_ttl: Duration,
    pub l1_max_size: usize,
    pub l2_ttl: Duration,
    /// Cache failed validations as an explicit absent sentinel so a bad token
    /// does not hit the identity provider on every request.
    pub cache_negatives: bool,
    pub identity_url: Option<String>,
    pub identity_timeout: Duration,
}

impl Default for TokenCacheOptions {
    fn default() -> Self {
        Self {
            salt: String::new(),
            l1_ttl: Duration::from_secs(60),
            l1_max_size: 1000,
            l2_ttl: Duration::from_secs(300),
            cache_negatives: true,
            identity_url: None,
            identity_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitOptions {
    pub enabled: bool,
    /// "memory" or "redis".
    pub backend: String,
    pub credits_per_minute: u32,
    pub default_cost: u32,
    pub route_costs: Vec<(String, u32)>,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: "memory".to_string(),
            credits_per_minute: crate::rate_limit::DEFAULT_CREDITS_PER_MINUTE,
            default_cost: 1,
            route_costs: vec![
                ("/servers".to_string(), 3),
                ("/server_prices".to_string(), 5),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct SharedStoreOptions {
    pub url: Option<String>,
    pub prefix: String,
    pub timeout: Duration,
}

impl Default for SharedStoreOptions {
    fn default() -> Self {
        Self {
            url: None,
            prefix: "cloudspec".to_string(),
            timeout: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RatesOptions {
    pub source_url: String,
    pub download_timeout: Duration,
    pub head_timeout: Duration,
}

impl Default for RatesOptions {
    fn default() -> Self {
        Self {
            source_url: "https://www.ecb.europa.eu/stats/eurofxref/eurofxref.zip".to_string(),
            download_timeout: Duration::from_secs(60),
            head_timeout: Duration::from_secs(10),
        }
    }
}

pub fn validate_startup_config_contract(
    dataset: &DatasetOptions,
    tokens: &TokenCacheOptions,
    rate: &RateLimitOptions,
    shared: &SharedStoreOptions,
    rates: &RatesOptions,
) -> Result<(), String> {
    if dataset.poll_interval.is_zero() || dataset.open_timeout.is_zero() {
        return Err("dataset intervals and timeouts must be > 0".to_string());
    }
    if dataset.retention == 0 {
        return Err("dataset retention must keep at least 1 generation".to_string());
    }
    if dataset.artifact_url.is_none() && dataset.artifact_path.is_none() {
        return Err("dataset source requires an artifact url or path".to_string());
    }
    if tokens.l1_max_size == 0 {
        return Err("token cache l1_max_size must be > 0".to_string());
    }
    if tokens.l1_ttl.is_zero() || tokens.l2_ttl.is_zero() {
        return Err("token cache TTLs must be > 0".to_string());
    }
    if rate.enabled {
        if rate.credits_per_minute == 0 {
            return Err("rate limit credits_per_minute must be > 0".to_string());
        }
        if rate.default_cost == 0 || rate.route_costs.iter().any(|(_, c)| *c == 0) {
            return Err("rate limit credit costs must be > 0".to_string());
        }
        match rate.backend.as_str() {
            "memory" => {}
            "redis" => {
                if shared.url.is_none() {
                    return Err(
                        "rate limit backend redis requires a shared store url".to_string()
                    );
                }
            }
            other => return Err(format!("unknown rate limit backend: {other}")),
        }
    }
    if shared.url.is_some() && shared.timeout.is_zero() {
        return Err("shared store timeout must be > 0".to_string());
    }
    if rates.source_url.trim().is_empty() {
        return Err("rates source url must not be empty".to_string());
    }
    if rates.download_timeout.is_zero() || rates.head_timeout.is_zero() {
        return Err("rates timeouts must be > 0".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_dataset() -> DatasetOptions {
        DatasetOptions {
            artifact_path: Some(PathBuf::from("/tmp/specs.sqlite")),
            ..DatasetOptions::default()
        }
    }

    #[test]
    fn startup_config_validation_requires_an_artifact_source() {
        let err = validate_startup_config_contract(
            &DatasetOptions::default(),
            &TokenCacheOptions::default(),
            &RateLimitOptions::default(),
            &SharedStoreOptions::default(),
            &RatesOptions::default(),
        )
        .expect_err("missing source");
        assert!(err.contains("artifact url or path"));
    }

    #[test]
    fn startup_config_validation_rejects_zero_retention() {
        let dataset = DatasetOptions {
            retention: 0,
            ..valid_dataset()
        };
        let err = validate_startup_config_contract(
            &dataset,
            &TokenCacheOptions::default(),
            &RateLimitOptions::default(),
            &SharedStoreOptions::default(),
            &RatesOptions::default(),
        )
        .expect_err("zero retention");
        assert!(err.contains("retention"));
    }

    #[test]
    fn startup_config_validation_enforces_redis_backend_contract() {
        let rate = RateLimitOptions {
            enabled: true,
            backend: "redis".to_string(),
            ..RateLimitOptions::default()
        };
        let err = validate_startup_config_contract(
            &valid_dataset(),
            &TokenCacheOptions::default(),
            &rate,
            &SharedStoreOptions::default(),
            &RatesOptions::default(),
        )
        .expect_err("redis without url");
        assert!(err.contains("shared store url"));

        let shared = SharedStoreOptions {
            url: Some("redis://127.0.0.1:6379".to_string()),
            ..SharedStoreOptions::default()
        };
        validate_startup_config_contract(
            &valid_dataset(),
            &TokenCacheOptions::default(),
            &rate,
            &shared,
            &RatesOptions::default(),
        )
        .expect("redis with url");
    }

    #[test]
    fn startup_config_validation_rejects_unknown_backend_and_zero_costs() {
        let rate = RateLimitOptions {
            enabled: true,
            backend: "memcached".to_string(),
            ..RateLimitOptions::default()
        };
        let err = validate_startup_config_contract(
            &valid_dataset(),
            &TokenCacheOptions::default(),
            &rate,
            &SharedStoreOptions::default(),
            &RatesOptions::default(),
        )
        .expect_err("unknown backend");
        assert!(err.contains("unknown rate limit backend"));

        let rate = RateLimitOptions {
            enabled: true,
            route_costs: vec![("/free".to_string(), 0)],
            ..RateLimitOptions::default()
        };
        let err = validate_startup_config_contract(
            &valid_dataset(),
            &TokenCacheOptions::default(),
            &rate,
            &SharedStoreOptions::default(),
            &RatesOptions::default(),
        )
        .expect_err("zero cost");
        assert!(err.contains("costs must be > 0"));
    }
}
