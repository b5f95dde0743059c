use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ValidationError {}

pub const USER_ID_MAX_LEN: usize = 128;

pub fn parse_user_id(input: &str) -> Result<UserId, ValidationError> {
    UserId::parse(input)
}

/// Identity-provider subject id. Opaque, but bounded and printable so it is
/// safe to embed in cache keys and log fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(ValidationError("user id must not be empty".to_string()));
        }
        if s.len() > USER_ID_MAX_LEN {
            return Err(ValidationError(format!(
                "user id exceeds max length {USER_ID_MAX_LEN}"
            )));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '@' || c == '.')
        {
            return Err(ValidationError(
                "user id must match [A-Za-z0-9-_@.]+".to_string(),
            ));
        }
        Ok(Self(s.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authenticated caller as resolved by the identity provider. The optional
/// per-minute credit override replaces the global default when present.
///
/// Field names are the shared-cache wire contract; other processes read the
/// same JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: UserId,
    #[serde(default)]
    pub api_credits_per_minute: Option<u32>,
}

impl UserIdentity {
    pub fn new(user_id: &str, api_credits_per_minute: Option<u32>) -> Result<Self, ValidationError> {
        Ok(Self {
            user_id: parse_user_id(user_id)?,
            api_credits_per_minute,
        })
    }
}
