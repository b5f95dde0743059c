#![forbid(unsafe_code)]
//! Cloudspec domain model SSOT.

mod currency;
mod identity;

pub use currency::{parse_currency, CurrencyCode, CURRENCY_CODE_LEN};
pub use identity::{parse_user_id, UserIdentity, UserId, ValidationError, USER_ID_MAX_LEN};

pub const CRATE_NAME: &str = "cloudspec-model";
