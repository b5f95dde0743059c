use crate::identity::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub const CURRENCY_CODE_LEN: usize = 3;

pub fn parse_currency(input: &str) -> Result<CurrencyCode, ValidationError> {
    CurrencyCode::parse(input)
}

/// ISO 4217 alphabetic currency code. Input is case-normalized so lookups
/// against the rate table are exact-match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let s = input.trim();
        if s.len() != CURRENCY_CODE_LEN {
            return Err(ValidationError(format!(
                "currency code must be exactly {CURRENCY_CODE_LEN} letters"
            )));
        }
        if !s.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ValidationError(
                "currency code must be ASCII letters (e.g. USD)".to_string(),
            ));
        }
        Ok(Self(s.to_ascii_uppercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }

    #[must_use]
    pub fn is_euro(&self) -> bool {
        self.0 == "EUR"
    }
}

impl Display for CurrencyCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
