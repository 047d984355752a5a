//! Billing-service connection lifecycle

mod common;

use checkstand::{ConnectionState, ProductKind};
use common::*;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn connect_retries_until_platform_reports_ready() {
    let harness = setup(HarnessOptions::default());
    harness.billing.connect_failures.store(2, Ordering::SeqCst);
    seed_product(&harness, "premium", ProductKind::Subscription);

    harness.sdk.load_catalog().await.unwrap();

    // Two failed starts, then the one that stuck.
    assert_eq!(harness.billing.connect_calls.load(Ordering::SeqCst), 3);
    assert_eq!(harness.sdk.connector().state(), ConnectionState::Connected);
}

#[tokio::test]
async fn connection_is_lazy_and_reused() {
    let harness = setup(HarnessOptions::default());
    seed_product(&harness, "premium", ProductKind::Subscription);

    // Nothing connects at construction time.
    assert_eq!(harness.billing.connect_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.sdk.connector().state(), ConnectionState::Disconnected);

    harness.sdk.load_catalog().await.unwrap();
    let after_first = harness.billing.connect_calls.load(Ordering::SeqCst);
    assert_eq!(after_first, 1);

    // Subsequent calls reuse the live connection.
    harness.sdk.load_catalog().await.unwrap();
    harness.sdk.restore_purchases().await.unwrap();
    assert_eq!(harness.billing.connect_calls.load(Ordering::SeqCst), after_first);
}

#[tokio::test]
async fn service_loss_reconnects_on_next_use() {
    let harness = setup(HarnessOptions::default());
    seed_product(&harness, "premium", ProductKind::Subscription);
    harness.sdk.load_catalog().await.unwrap();
    assert_eq!(harness.billing.connect_calls.load(Ordering::SeqCst), 1);

    harness.sdk.connector().on_service_disconnected();
    assert_eq!(harness.sdk.connector().state(), ConnectionState::Disconnected);

    harness.sdk.load_catalog().await.unwrap();
    assert_eq!(harness.billing.connect_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_callers_share_one_service_start() {
    let harness = setup(HarnessOptions::default());
    seed_product(&harness, "premium", ProductKind::Subscription);

    let connector = harness.sdk.connector();
    let (a, b, c) = tokio::join!(connector.connect(), connector.connect(), connector.connect());
    a.unwrap();
    b.unwrap();
    c.unwrap();

    // The connect mutex collapsed the three callers onto one service start.
    assert_eq!(harness.billing.connect_calls.load(Ordering::SeqCst), 1);
}
