#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};
use std::path::PathBuf;

pub const CRATE_NAME: &str = "cloudspec-core";

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    Usage = 2,
    Validation = 3,
    DependencyFailure = 4,
    Internal = 10,
}

pub const ENV_CLOUDSPEC_LOG_LEVEL: &str = "CLOUDSPEC_LOG_LEVEL";
pub const ENV_CLOUDSPEC_DATA_DIR: &str = "CLOUDSPEC_DATA_DIR";

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Digest used for cache keys derived from bearer tokens. The raw token is
/// never stored or logged; only this salted hash leaves the request path.
#[must_use]
pub fn salted_token_digest(token: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(salt.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[must_use]
pub fn resolve_cloudspec_data_dir() -> PathBuf {
    if let Ok(explicit) = std::env::var(ENV_CLOUDSPEC_DATA_DIR) {
        let trimmed = explicit.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    if let Ok(xdg_cache_home) = std::env::var("XDG_CACHE_HOME") {
        let trimmed = xdg_cache_home.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed).join("cloudspec");
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed).join(".cache").join("cloudspec");
        }
    }

    PathBuf::from(".cloudspec").join("cache")
}

#[cfg(test)]
mod tests {
    use super::{salted_token_digest, sha256_hex};

    #[test]
    fn sha256_matches_known_vectors() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn token_digests_are_salted_and_opaque() {
        let a = salted_token_digest("secret-token", "alpha");
        let b = salted_token_digest("secret-token", "beta");
        assert_ne!(a, b);
        assert_eq!(a, salted_token_digest("secret-token", "alpha"));
        assert!(!a.contains("secret-token"));
        assert_eq!(a.len(), 64);
    }
}
