//! Consumer-facing read hook.
//!
//! Combines the session, the cache and the plan registry into the single
//! status shape UIs and route handlers render.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::cache::{CacheView, SubscriptionCache};
use super::entitlements::{EntitlementState, StatusLabel, is_real_subscription};
use super::plans::PlanRegistry;
use super::session::SessionContext;
use super::storage::SubscriptionRecord;

/// Everything a consumer needs to render a user's billing state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BillingStatus {
    pub subscription: Option<SubscriptionRecord>,
    pub is_active: bool,
    pub status_label: StatusLabel,
    pub plan_name: String,
    pub is_real_subscription: bool,
    pub loading: bool,
    /// The user's record has been read at least once. Until then the status is
    /// [`StatusLabel::Unknown`] and `is_active: false` does not mean locked out.
    pub loaded: bool,
    pub error: Option<String>,
}

impl BillingStatus {
    /// Status of nobody: not loading, not entitled.
    #[must_use]
    pub fn empty(registry: &PlanRegistry) -> Self {
        Self {
            subscription: None,
            is_active: false,
            status_label: StatusLabel::NoSubscription,
            plan_name: registry.resolve_display_name(None),
            is_real_subscription: false,
            loading: false,
            loaded: false,
            error: None,
        }
    }

    /// Derive a status from a cache view at `now`.
    #[must_use]
    pub fn from_view(view: CacheView, registry: &PlanRegistry, now: DateTime<Utc>) -> Self {
        let record = view.data.as_ref();
        let state = EntitlementState::resolve_at(record, now);
        // an unread record is not a missing one
        let status_label = if view.loaded {
            state.label()
        } else {
            StatusLabel::Unknown
        };

        Self {
            is_active: state.is_entitled(),
            status_label,
            plan_name: registry.resolve_display_name(record.and_then(|r| r.external_price_id.as_deref())),
            is_real_subscription: is_real_subscription(record),
            loading: view.loading,
            loaded: view.loaded,
            error: view.error.map(|e| e.to_string()),
            subscription: view.data,
        }
    }
}

/// Reads the session user's billing status.
#[derive(Clone)]
pub struct SubscriptionReader {
    session: SessionContext,
    cache: SubscriptionCache,
    registry: Arc<PlanRegistry>,
}

impl SubscriptionReader {
    pub fn new(session: SessionContext, cache: SubscriptionCache, registry: Arc<PlanRegistry>) -> Self {
        Self {
            session,
            cache,
            registry,
        }
    }

    /// Current status. Never waits for the store; the first read for a user
    /// reports `loading`.
    pub async fn status(&self) -> BillingStatus {
        let Some(user_id) = self.session.current_user() else {
            return BillingStatus::empty(&self.registry);
        };
        let view = self.cache.get(&user_id).await;
        BillingStatus::from_view(view, &self.registry, Utc::now())
    }

    /// Force a refetch for the session user and return the result.
    pub async fn refetch(&self) -> BillingStatus {
        let Some(user_id) = self.session.current_user() else {
            return BillingStatus::empty(&self.registry);
        };
        let view = self.cache.refetch(&user_id).await;
        BillingStatus::from_view(view, &self.registry, Utc::now())
    }

    #[must_use]
    pub fn registry(&self) -> &PlanRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::plans::UNDEFINED_PLAN_LABEL;
    use crate::billing::storage::SubscriptionStatus;
    use crate::billing::storage::test::InMemorySubscriptionStore;
    use crate::config::CacheConfig;

    fn registry() -> Arc<PlanRegistry> {
        let registry = PlanRegistry::builder()
            .plan("pro_monthly")
            .display_name("Pro")
            .price(7900)
            .live_price("price_pro_live")
            .test_price("price_pro_test")
            .done()
            .build()
            .unwrap();
        Arc::new(registry)
    }

    fn create_test_reader(session: SessionContext) -> (SubscriptionReader, InMemorySubscriptionStore) {
        let store = InMemorySubscriptionStore::new();
        store.insert(
            SubscriptionRecord::new("rec_1", "user_1", SubscriptionStatus::Active)
                .with_external_subscription_id("sub_123")
                .with_price_id("price_pro_test"),
        );
        let cache = SubscriptionCache::new(Arc::new(store.clone()), &CacheConfig::default());
        (SubscriptionReader::new(session, cache, registry()), store)
    }

    #[tokio::test]
    async fn test_no_session_user_is_empty() {
        let (reader, store) = create_test_reader(SessionContext::new());
        let status = reader.status().await;

        assert!(!status.loading);
        assert!(!status.is_active);
        assert_eq!(status.status_label, StatusLabel::NoSubscription);
        assert_eq!(status.plan_name, UNDEFINED_PLAN_LABEL);
        assert_eq!(reader.refetch().await, status);
        assert_eq!(store.reads(), 0);
    }

    #[tokio::test]
    async fn test_first_read_is_loading_then_resolves() {
        let (reader, _) = create_test_reader(SessionContext::for_user("user_1"));

        let status = reader.status().await;
        assert!(status.loading);
        assert!(status.subscription.is_none());

        let status = reader.refetch().await;
        assert!(!status.loading);
        assert!(status.is_active);
        assert!(status.is_real_subscription);
        assert_eq!(status.status_label, StatusLabel::Active);
        assert_eq!(status.plan_name, "Pro (Test)");
    }

    #[tokio::test]
    async fn test_user_without_record() {
        let (reader, _) = create_test_reader(SessionContext::for_user("user_2"));
        let status = reader.refetch().await;

        assert!(!status.loading);
        assert!(!status.is_active);
        assert!(!status.is_real_subscription);
        assert!(status.loaded);
        assert_eq!(status.status_label, StatusLabel::NoSubscription);
    }

    #[tokio::test]
    async fn test_store_outage_is_not_reported_as_no_subscription() {
        let (reader, store) = create_test_reader(SessionContext::for_user("user_1"));
        store.fail_next_reads(2);

        let status = reader.refetch().await;
        assert!(status.error.is_some());
        assert!(!status.loaded);
        assert_eq!(status.status_label, StatusLabel::Unknown);
        assert_eq!(store.reads(), 2);

        // the failure is not cached for the staleness window
        let status = reader.status().await;
        assert!(status.loading);
        assert_eq!(status.status_label, StatusLabel::Unknown);
        let status = reader.refetch().await;
        assert!(status.loaded);
        assert!(status.is_active);
        assert_eq!(status.status_label, StatusLabel::Active);
        assert!(status.error.is_none());
        assert!(store.reads() >= 3);
    }

    #[tokio::test]
    async fn test_error_after_load_keeps_last_known_status() {
        let (reader, store) = create_test_reader(SessionContext::for_user("user_1"));
        assert!(reader.refetch().await.is_active);

        store.fail_next_reads(2);
        let status = reader.refetch().await;
        assert!(status.error.is_some());
        assert!(status.loaded);
        assert!(status.is_active);
        assert_eq!(status.status_label, StatusLabel::Active);
    }

    #[test]
    fn test_grace_window_renders_active() {
        let now = Utc::now();
        let view = CacheView {
            data: Some(
                SubscriptionRecord::new("rec_1", "user_1", SubscriptionStatus::Canceled)
                    .with_external_subscription_id("manual_grant")
                    .with_period_end(now + chrono::Duration::days(3)),
            ),
            loading: false,
            loaded: true,
            refreshing: false,
            error: None,
            stale: false,
        };

        let status = BillingStatus::from_view(view, &registry(), now);
        assert!(status.is_active);
        assert_eq!(status.status_label, StatusLabel::Active);
        assert_eq!(status.plan_name, UNDEFINED_PLAN_LABEL);
    }
}
