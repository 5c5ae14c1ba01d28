use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use subscription_sync::billing::{
    BillingError, ChangeEvent, ChangeKind, InMemoryChangeFeed, InMemorySubscriptionStore,
    MockBillingProvider, PlanRegistry, ProviderSnapshot, RealtimeInvalidator, ReconciliationService,
    SessionContext, StatusLabel, SubscriptionCache, SubscriptionReader, SubscriptionRecord,
    SubscriptionStatus, UNDEFINED_PLAN_LABEL, is_entitled_at,
};
use subscription_sync::{CacheConfig, PlanCatalogConfig, PriceIds, ReconcileConfig};

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

fn catalog() -> PlanCatalogConfig {
    PlanCatalogConfig {
        pro_monthly: PriceIds::new(Some("price_pro_live"), Some("price_pro_test")),
        ..Default::default()
    }
}

#[test]
fn test_canceled_subscription_grace_window() {
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

    let in_grace = SubscriptionRecord::new("rec_1", "user_1", SubscriptionStatus::Canceled)
        .with_period_end(Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap());
    assert!(is_entitled_at(Some(&in_grace), now));

    let lapsed = SubscriptionRecord::new("rec_1", "user_1", SubscriptionStatus::Canceled)
        .with_period_end(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
    assert!(!is_entitled_at(Some(&lapsed), now));
}

#[test]
fn test_registry_from_catalog() {
    let registry = PlanRegistry::from_catalog(&catalog());

    assert_eq!(registry.resolve_display_name(None), UNDEFINED_PLAN_LABEL);
    assert_eq!(registry.resolve_display_name(Some("price_unknown")), UNDEFINED_PLAN_LABEL);
    assert_eq!(registry.resolve_display_name(Some("price_pro_live")), "Pro");
    assert_eq!(registry.resolve_display_name(Some("price_pro_test")), "Pro (Test)");
    // unconfigured plans are skipped, not fatal
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_unreachable_provider_leaves_cache_untouched() {
    let store = InMemorySubscriptionStore::new();
    store.insert(
        SubscriptionRecord::new("rec_1", "user_1", SubscriptionStatus::Active)
            .with_external_subscription_id("sub_1"),
    );
    let provider = MockBillingProvider::new();
    provider.set_unreachable(true);

    let cache = SubscriptionCache::new(Arc::new(store.clone()), &CacheConfig::default());
    let before = cache.load("user_1").await;

    let service = ReconciliationService::new(
        Arc::new(store.clone()),
        Arc::new(provider.clone()),
        ReconcileConfig::default(),
    );
    let err = service.reconcile("sub_1", Some("rec_1")).await.unwrap_err();
    assert!(matches!(err, BillingError::ProviderUnreachable { .. }));

    let after = cache.peek("user_1").await.unwrap();
    assert_eq!(after.data, before.data);
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn test_change_event_overrides_staleness_window() {
    let store = InMemorySubscriptionStore::new();
    store.insert(
        SubscriptionRecord::new("rec_1", "user_1", SubscriptionStatus::Active)
            .with_external_subscription_id("sub_1")
            .with_price_id("price_pro_live"),
    );
    let feed = InMemoryChangeFeed::new();
    let cache = SubscriptionCache::new(
        Arc::new(store.clone()),
        &CacheConfig {
            staleness_window_secs: 3600,
            ..CacheConfig::default()
        },
    );
    let session = SessionContext::for_user("user_1");
    let registry = Arc::new(PlanRegistry::from_catalog(&catalog()));
    let reader = SubscriptionReader::new(session.clone(), cache.clone(), registry);

    let status = reader.refetch().await;
    assert!(status.is_active);
    assert_eq!(status.plan_name, "Pro");

    let handle = RealtimeInvalidator::spawn(session, Arc::new(feed.clone()), cache.clone());
    wait_until(|| feed.subscriber_count_for("user_1") == 1).await;

    // writer cancels the subscription and the feed announces it
    store.insert(
        SubscriptionRecord::new("rec_1", "user_1", SubscriptionStatus::Canceled)
            .with_external_subscription_id("sub_1")
            .with_price_id("price_pro_live"),
    );
    let reads_before = store.reads();
    assert_eq!(feed.publish(ChangeEvent::new(ChangeKind::Update, "user_1").with_record_id("rec_1")), 1);
    wait_until(|| store.reads() > reads_before).await;

    let status = reader.refetch().await;
    assert!(!status.is_active);
    assert_eq!(status.status_label, StatusLabel::Canceled);

    handle.shutdown().await;
    assert_eq!(feed.subscriber_count(), 0);
}

#[tokio::test]
async fn test_session_switch_follows_new_user() {
    let store = InMemorySubscriptionStore::new();
    store.insert(SubscriptionRecord::new("rec_1", "user_1", SubscriptionStatus::Active));
    store.insert(SubscriptionRecord::new("rec_2", "user_2", SubscriptionStatus::PastDue));

    let feed = InMemoryChangeFeed::new();
    let cache = SubscriptionCache::new(Arc::new(store.clone()), &CacheConfig::default());
    let session = SessionContext::new();
    let reader = SubscriptionReader::new(
        session.clone(),
        cache.clone(),
        Arc::new(PlanRegistry::from_catalog(&catalog())),
    );
    let handle = RealtimeInvalidator::spawn(session.clone(), Arc::new(feed.clone()), cache);

    assert!(!reader.status().await.loading);

    session.login("user_1");
    wait_until(|| feed.subscriber_count_for("user_1") == 1).await;
    assert!(reader.refetch().await.is_active);

    session.login("user_2");
    wait_until(|| feed.subscriber_count_for("user_2") == 1).await;
    assert_eq!(feed.subscriber_count(), 1);
    let status = reader.refetch().await;
    assert!(!status.is_active);
    assert_eq!(status.status_label, StatusLabel::PastDue);

    session.logout();
    wait_until(|| feed.subscriber_count() == 0).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn test_reconcile_then_refetch_reflects_provider() {
    let store = InMemorySubscriptionStore::new();
    store.insert(
        SubscriptionRecord::new("rec_1", "user_1", SubscriptionStatus::Active)
            .with_external_subscription_id("sub_1"),
    );
    let provider = MockBillingProvider::new();
    provider.set_subscription(ProviderSnapshot {
        external_subscription_id: "sub_1".to_string(),
        status: SubscriptionStatus::Canceled,
        current_period_end: None,
        cancel_at_period_end: false,
        price_id: None,
    });

    let cache = SubscriptionCache::new(Arc::new(store.clone()), &CacheConfig::default());
    assert!(cache.load("user_1").await.data.is_some());

    let service = ReconciliationService::new(
        Arc::new(store.clone()),
        Arc::new(provider),
        ReconcileConfig::default(),
    );
    let result = service.reconcile_owner("user_1").await.unwrap().unwrap();
    assert!(result.repaired);

    // reconciliation does not touch the cache on its own
    let cached = cache.peek("user_1").await.unwrap();
    assert_eq!(cached.data.unwrap().status, SubscriptionStatus::Active);

    let view = cache.refetch("user_1").await;
    assert_eq!(view.data.unwrap().status, SubscriptionStatus::Canceled);
}
