// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use cloudspec_server::{
    record_unauthorized_penalty, InMemoryRateLimiter, RateLimiter, RouteCostTable,
};

#[tokio::test(start_paused = true)]
async fn concurrent_requests_admit_exactly_the_budget() {
    let limiter = Arc::new(InMemoryRateLimiter::new(10));
    let mut handles = Vec::new();
    for _ in 0..30 {
        let limiter = Arc::clone(&limiter);
        handles.push(tokio::spawn(async move {
            limiter.is_allowed("user:alice", None, 1, None).await.allowed
        }));
    }
    let mut admitted = 0;
    for handle in handles {
        if handle.await.expect("admission task") {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

#[tokio::test(start_paused = true)]
async fn a_unit_cost_walk_counts_down_and_renews() {
    let limiter = InMemoryRateLimiter::new(10);
    for expected_remaining in (0..10).rev() {
        let decision = limiter.is_allowed("user:alice", None, 1, None).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, expected_remaining);
    }
    let eleventh = limiter.is_allowed("user:alice", None, 1, None).await;
    assert!(!eleventh.allowed);
    assert_eq!(eleventh.remaining, 0);

    tokio::time::advance(Duration::from_secs(61)).await;
    let renewed = limiter.is_allowed("user:alice", None, 1, None).await;
    assert!(renewed.allowed);
    assert_eq!(renewed.remaining, 9);
}

#[tokio::test(start_paused = true)]
async fn a_window_admits_until_the_credits_run_out() {
    let limiter = InMemoryRateLimiter::new(60);
    for _ in 0..20 {
        let decision = limiter.is_allowed("user:alice", None, 3, None).await;
        assert!(decision.allowed);
    }
    let over = limiter.is_allowed("user:alice", None, 3, None).await;
    assert!(!over.allowed);
    assert_eq!(over.remaining, 0);
}

#[tokio::test(start_paused = true)]
async fn remaining_counts_down_by_route_cost() {
    let limiter = InMemoryRateLimiter::new(60);
    let table = RouteCostTable::new(
        vec![("/servers".to_string(), 3), ("/server_prices".to_string(), 5)],
        1,
    );

    let first = limiter
        .is_allowed("user:alice", None, table.cost_for("/servers"), None)
        .await;
    assert_eq!(first.remaining, 57);
    let second = limiter
        .is_allowed("user:alice", None, table.cost_for("/server_prices"), None)
        .await;
    assert_eq!(second.remaining, 52);
    let third = limiter
        .is_allowed("user:alice", None, table.cost_for("/servers/aws/m5.large"), None)
        .await;
    assert_eq!(third.remaining, 49);
}

#[tokio::test(start_paused = true)]
async fn a_rejected_request_spends_nothing() {
    let limiter = InMemoryRateLimiter::new(10);
    let first = limiter.is_allowed("ip:10.0.0.9", None, 8, None).await;
    assert!(first.allowed);
    assert_eq!(first.remaining, 2);

    let rejected = limiter.is_allowed("ip:10.0.0.9", None, 4, None).await;
    assert!(!rejected.allowed);
    assert_eq!(rejected.remaining, 2);

    // The rejected request left the window untouched, so a smaller one
    // still fits.
    let fits = limiter.is_allowed("ip:10.0.0.9", None, 2, None).await;
    assert!(fits.allowed);
    assert_eq!(fits.remaining, 0);
}

#[tokio::test(start_paused = true)]
async fn credits_replenish_once_the_window_slides_past() {
    let limiter = InMemoryRateLimiter::new(60);
    assert!(limiter.is_allowed("user:alice", None, 60, None).await.allowed);
    assert!(!limiter.is_allowed("user:alice", None, 1, None).await.allowed);

    tokio::time::advance(Duration::from_secs(61)).await;
    let fresh = limiter.is_allowed("user:alice", None, 1, None).await;
    assert!(fresh.allowed);
    assert_eq!(fresh.remaining, 59);
}

#[tokio::test(start_paused = true)]
async fn the_window_slides_instead_of_resetting() {
    let limiter = InMemoryRateLimiter::new(60);
    assert!(limiter.is_allowed("user:alice", None, 30, None).await.allowed);

    tokio::time::advance(Duration::from_secs(30)).await;
    let mid = limiter.is_allowed("user:alice", None, 30, None).await;
    assert!(mid.allowed);
    assert_eq!(mid.remaining, 0);

    // 31 more seconds: the first spend has aged out, the second has not.
    tokio::time::advance(Duration::from_secs(31)).await;
    let later = limiter.is_allowed("user:alice", None, 30, None).await;
    assert!(later.allowed);
    assert_eq!(later.remaining, 0);
}

#[tokio::test(start_paused = true)]
async fn an_identity_override_replaces_the_default_allowance() {
    let limiter = InMemoryRateLimiter::new(60);
    let generous = limiter.is_allowed("user:pro", Some(120), 100, None).await;
    assert!(generous.allowed);
    assert_eq!(generous.remaining, 20);

    let over = limiter.is_allowed("user:pro", Some(120), 30, None).await;
    assert!(!over.allowed);
    assert_eq!(over.remaining, 20);
}

#[tokio::test(start_paused = true)]
async fn windows_are_tracked_per_key() {
    let limiter = InMemoryRateLimiter::new(10);
    assert!(limiter.is_allowed("user:alice", None, 10, None).await.allowed);
    assert!(!limiter.is_allowed("user:alice", None, 1, None).await.allowed);

    let other = limiter.is_allowed("user:bob", None, 1, None).await;
    assert!(other.allowed);
    assert_eq!(other.remaining, 9);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_probes_burn_a_raised_allowance() {
    let limiter = InMemoryRateLimiter::new(60);
    // 70 penalty credits at 10 per probe: seven failures fit, the eighth
    // does not.
    for _ in 0..7 {
        let decision = record_unauthorized_penalty(&limiter, "10.0.0.9").await;
        assert!(decision.allowed);
    }
    let exhausted = record_unauthorized_penalty(&limiter, "10.0.0.9").await;
    assert!(!exhausted.allowed);
    assert_eq!(exhausted.remaining, 0);
}

#[tokio::test(start_paused = true)]
async fn penalties_and_normal_spending_share_the_address_window() {
    let limiter = InMemoryRateLimiter::new(60);
    let penalty = record_unauthorized_penalty(&limiter, "10.0.0.9").await;
    assert!(penalty.allowed);

    // The failed probe already spent 10 credits out of the same ip window.
    let normal = limiter.is_allowed("ip:10.0.0.9", None, 1, None).await;
    assert!(normal.allowed);
    assert_eq!(normal.remaining, 49);
}
