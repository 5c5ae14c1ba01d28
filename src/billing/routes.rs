//! HTTP routes for reading and refreshing billing status.
//!
//! Mount the router under whatever prefix the host application uses;
//! authorization of `user_id` is the host's concern.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use super::cache::SubscriptionCache;
use super::plans::PlanRegistry;
use super::reader::BillingStatus;
use super::reconcile::{Reconciliation, ReconciliationService};
use crate::error::{Result, SyncError};

/// Shared state for the billing routes.
#[derive(Clone)]
pub struct BillingRoutes {
    cache: SubscriptionCache,
    reconciler: Arc<ReconciliationService>,
    registry: Arc<PlanRegistry>,
}

/// Body returned by the refresh route.
#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub reconciliation: Reconciliation,
    pub status: BillingStatus,
}

impl BillingRoutes {
    pub fn new(
        cache: SubscriptionCache,
        reconciler: Arc<ReconciliationService>,
        registry: Arc<PlanRegistry>,
    ) -> Self {
        Self {
            cache,
            reconciler,
            registry,
        }
    }

    /// Build the router with its state applied.
    ///
    /// - `GET /billing/subscriptions/:user_id`
    /// - `POST /billing/subscriptions/:user_id/refresh`
    pub fn router(self) -> Router {
        Router::new()
            .route("/billing/subscriptions/:user_id", get(get_status))
            .route("/billing/subscriptions/:user_id/refresh", post(refresh))
            .with_state(self)
    }
}

async fn get_status(
    State(routes): State<BillingRoutes>,
    Path(user_id): Path<String>,
) -> Result<Json<BillingStatus>> {
    let view = routes.cache.load(&user_id).await;

    // Never answered for this user: report the failure instead of a status
    // that would read as "no subscription". After a load, errors ride along.
    if !view.loaded {
        if let Some(err) = view.error.clone() {
            return Err(err.into());
        }
    }

    Ok(Json(BillingStatus::from_view(view, &routes.registry, Utc::now())))
}

async fn refresh(
    State(routes): State<BillingRoutes>,
    Path(user_id): Path<String>,
) -> Result<Json<RefreshResponse>> {
    let reconciliation = routes
        .reconciler
        .reconcile_owner(&user_id)
        .await?
        .ok_or_else(|| SyncError::not_found(format!("provider subscription for user {}", user_id)))?;

    let view = routes.cache.refetch(&user_id).await;
    tracing::info!(
        target: "subscription_sync::billing",
        user_id = %user_id,
        repaired = reconciliation.repaired,
        drift = reconciliation.drift.len(),
        "Subscription refreshed"
    );

    Ok(Json(RefreshResponse {
        reconciliation,
        status: BillingStatus::from_view(view, &routes.registry, Utc::now()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::provider::ProviderSnapshot;
    use crate::billing::provider::test::MockBillingProvider;
    use crate::billing::storage::test::InMemorySubscriptionStore;
    use crate::billing::storage::{SubscriptionRecord, SubscriptionStatus};
    use crate::config::{CacheConfig, ReconcileConfig};
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    struct Fixture {
        store: InMemorySubscriptionStore,
        cache: SubscriptionCache,
        provider: MockBillingProvider,
        router: Router,
    }

    fn create_test_router() -> Fixture {
        let store = InMemorySubscriptionStore::new();
        store.insert(
            SubscriptionRecord::new("rec_1", "user_1", SubscriptionStatus::Active)
                .with_external_subscription_id("sub_1")
                .with_price_id("price_pro"),
        );
        store.insert(
            SubscriptionRecord::new("rec_2", "user_2", SubscriptionStatus::Active)
                .with_external_subscription_id("manual_comp"),
        );

        let provider = MockBillingProvider::new();
        provider.set_subscription(ProviderSnapshot {
            external_subscription_id: "sub_1".to_string(),
            status: SubscriptionStatus::Active,
            current_period_end: None,
            cancel_at_period_end: false,
            price_id: Some("price_pro".to_string()),
        });

        let registry = PlanRegistry::builder()
            .plan("pro_monthly")
            .display_name("Pro")
            .live_price("price_pro")
            .done()
            .build()
            .unwrap();

        let cache = SubscriptionCache::new(Arc::new(store.clone()), &CacheConfig::default());
        let reconciler = ReconciliationService::new(
            Arc::new(store.clone()),
            Arc::new(provider.clone()),
            ReconcileConfig::default(),
        );
        let router = BillingRoutes::new(cache.clone(), Arc::new(reconciler), Arc::new(registry)).router();

        Fixture {
            store,
            cache,
            provider,
            router,
        }
    }

    async fn send(router: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_get_status() {
        let fx = create_test_router();
        let (status, body) = send(&fx.router, "GET", "/billing/subscriptions/user_1").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_active"], true);
        assert_eq!(body["status_label"], "active");
        assert_eq!(body["plan_name"], "Pro");
        assert_eq!(body["loading"], false);
    }

    #[tokio::test]
    async fn test_get_status_without_record() {
        let fx = create_test_router();
        let (status, body) = send(&fx.router, "GET", "/billing/subscriptions/user_9").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_active"], false);
        assert_eq!(body["status_label"], "no_subscription");
        assert_eq!(body["loaded"], true);
        assert!(body["subscription"].is_null());
    }

    #[tokio::test]
    async fn test_get_status_store_outage_is_503() {
        let fx = create_test_router();
        fx.store.fail_next_reads(2);

        let (status, body) = send(&fx.router, "GET", "/billing/subscriptions/user_1").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["retryable"], true);

        // the next request retries instead of serving the cached failure
        let (status, body) = send(&fx.router, "GET", "/billing/subscriptions/user_1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_active"], true);
    }

    #[tokio::test]
    async fn test_get_status_outage_after_load_serves_last_known() {
        let fx = create_test_router();
        let (status, _) = send(&fx.router, "GET", "/billing/subscriptions/user_9").await;
        assert_eq!(status, StatusCode::OK);

        fx.store.fail_next_reads(2);
        let view = fx.cache.refetch("user_9").await;
        assert!(view.error.is_some());
        assert!(view.data.is_none());

        // user_9 was loaded and has no record: still 200, not an outage
        let (status, body) = send(&fx.router, "GET", "/billing/subscriptions/user_9").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["loaded"], true);
        assert_eq!(body["status_label"], "no_subscription");
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_refresh_repairs_canceled_subscription() {
        let fx = create_test_router();
        fx.provider.set_subscription(ProviderSnapshot {
            external_subscription_id: "sub_1".to_string(),
            status: SubscriptionStatus::Canceled,
            current_period_end: None,
            cancel_at_period_end: false,
            price_id: Some("price_pro".to_string()),
        });

        let (status, body) = send(&fx.router, "POST", "/billing/subscriptions/user_1/refresh").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reconciliation"]["repaired"], true);
        assert_eq!(body["status"]["is_active"], false);
        assert_eq!(body["status"]["status_label"], "canceled");
        assert_eq!(fx.store.writes(), 1);
    }

    #[tokio::test]
    async fn test_refresh_provider_unreachable_is_503() {
        let fx = create_test_router();
        fx.provider.set_unreachable(true);

        let (status, _) = send(&fx.router, "POST", "/billing/subscriptions/user_1/refresh").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(fx.store.writes(), 0);

        // last known status is still served
        let (status, body) = send(&fx.router, "GET", "/billing/subscriptions/user_1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_active"], true);
    }

    #[tokio::test]
    async fn test_refresh_without_provider_subscription_is_404() {
        let fx = create_test_router();

        let (status, _) = send(&fx.router, "POST", "/billing/subscriptions/user_9/refresh").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&fx.router, "POST", "/billing/subscriptions/user_2/refresh").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(fx.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_refresh_unknown_external_id_is_404() {
        let fx = create_test_router();
        fx.store.insert(
            SubscriptionRecord::new("rec_3", "user_3", SubscriptionStatus::Active)
                .with_external_subscription_id("sub_gone"),
        );

        let (status, _) = send(&fx.router, "POST", "/billing/subscriptions/user_3/refresh").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(fx.store.writes(), 0);
    }
}
