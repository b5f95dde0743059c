// SPDX-License-Identifier: Apache-2.0

use cloudspec_model::{parse_currency, parse_user_id, CurrencyCode, UserIdentity};

#[test]
fn currency_code_normalizes_case() {
    let usd = parse_currency("usd").expect("currency");
    assert_eq!(usd.as_str(), "USD");
    assert_eq!(usd, CurrencyCode::parse(" USD ").expect("currency"));
    assert!(usd.to_string() == "USD");
}

#[test]
fn currency_code_rejects_wrong_shape() {
    assert!(parse_currency("").is_err());
    assert!(parse_currency("EU").is_err());
    assert!(parse_currency("EURO").is_err());
    assert!(parse_currency("E1R").is_err());
    assert!(parse_currency("€UR").is_err());
}

#[test]
fn euro_is_the_base_currency() {
    assert!(parse_currency("eur").expect("currency").is_euro());
    assert!(!parse_currency("USD").expect("currency").is_euro());
}

#[test]
fn user_id_accepts_provider_subject_shapes() {
    for ok in ["273224278829040898", "svc-keeper_01", "user@example.com"] {
        assert!(parse_user_id(ok).is_ok(), "rejected: {ok}");
    }
}

#[test]
fn user_id_rejects_empty_and_unprintable() {
    assert!(parse_user_id("").is_err());
    assert!(parse_user_id("   ").is_err());
    assert!(parse_user_id("a b").is_err());
    assert!(parse_user_id(&"x".repeat(200)).is_err());
}

#[test]
fn identity_shared_cache_wire_contract_is_stable() {
    let identity = UserIdentity::new("273224278829040898", Some(120)).expect("identity");
    let json = serde_json::to_string(&identity).expect("serialize");
    assert_eq!(
        json,
        r#"{"user_id":"273224278829040898","api_credits_per_minute":120}"#
    );

    let parsed: UserIdentity = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(parsed, identity);
}

#[test]
fn identity_credits_field_is_optional_on_the_wire() {
    let parsed: UserIdentity =
        serde_json::from_str(r#"{"user_id":"abc"}"#).expect("deserialize");
    assert_eq!(parsed.api_credits_per_minute, None);
}
