use super::AuthError;
use async_trait::async_trait;
use cloudspec_model::{UserId, UserIdentity};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Upstream authority on token validity.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` is an authoritative "not a valid token" and may be cached.
    /// `Err` means the provider could not answer and nothing should be cached.
    async fn verify(&self, token: &str) -> Result<Option<UserIdentity>, AuthError>;
}

#[derive(Deserialize)]
struct IdentityEnvelope {
    #[serde(default)]
    user: IdentityUser,
}

#[derive(Deserialize, Default)]
struct IdentityUser {
    id: Option<String>,
    #[serde(default)]
    api_credits_per_minute: Option<u32>,
}

/// Bearer lookup against the identity endpoint. The token under test goes in
/// the `Authorization` header and the answer comes back as
/// `{"user": {"id", "api_credits_per_minute"}}`.
pub struct HttpIdentityProvider {
    url: String,
    timeout: Duration,
}

impl HttpIdentityProvider {
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn verify(&self, token: &str) -> Result<Option<UserIdentity>, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let resp = client
            .get(&self.url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AuthError(format!("identity request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(AuthError(format!(
                "identity endpoint answered status={}",
                resp.status()
            )));
        }
        let body: IdentityEnvelope = resp
            .json()
            .await
            .map_err(|e| AuthError(format!("identity response unreadable: {e}")))?;
        let user = body.user;
        let Some(id) = user.id else {
            warn!("identity response carried no user id");
            return Ok(None);
        };
        let user_id = match UserId::parse(&id) {
            Ok(id) => id,
            Err(e) => {
                debug!("identity response user id rejected: {e}");
                return Ok(None);
            }
        };
        Ok(Some(UserIdentity {
            user_id,
            api_credits_per_minute: user.api_credits_per_minute,
        }))
    }
}

/// Scripted provider for tests.
pub struct StaticIdentityProvider {
    identities: Mutex<HashMap<String, UserIdentity>>,
    fail: AtomicBool,
    pub verify_calls: AtomicU64,
}

impl StaticIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        Self {
            identities: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
            verify_calls: AtomicU64::new(0),
        }
    }

    pub async fn insert(&self, token: &str, identity: UserIdentity) {
        self.identities
            .lock()
            .await
            .insert(token.to_string(), identity);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

impl Default for StaticIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn verify(&self, token: &str) -> Result<Option<UserIdentity>, AuthError> {
        self.verify_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail.load(Ordering::Relaxed) {
            return Err(AuthError("scripted provider failure".to_string()));
        }
        Ok(self.identities.lock().await.get(token).cloned())
    }
}
