//! Reconciliation against the billing provider.
//!
//! `reconcile` asks the provider for the authoritative state of one
//! subscription and repairs the local record when it disagrees. The only
//! repair it performs is moving a record the provider reports as canceled to
//! `canceled`; other drift is reported and left for webhook ingestion. It
//! never refetches the cache; callers do that after a successful run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::backoff::backoff_delay;
use super::cache::SubscriptionCache;
use super::entitlements::is_provider_subscription_id;
use super::error::{BillingError, BillingResult};
use super::provider::{BillingProvider, ProviderSnapshot};
use super::session::SessionContext;
use super::storage::{SubscriptionRecord, SubscriptionStatus, SubscriptionStore};
use crate::config::ReconcileConfig;

/// Outcome of a successful reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[must_use]
pub struct Reconciliation {
    /// What the provider reported.
    pub snapshot: ProviderSnapshot,
    /// Differences between the local record and the provider, before repair.
    pub drift: Vec<Drift>,
    /// Whether the local record was written.
    pub repaired: bool,
}

impl Reconciliation {
    /// True when no local record was compared or nothing differed.
    #[must_use]
    pub fn is_in_sync(&self) -> bool {
        self.drift.is_empty()
    }
}

/// A field on which the local record and the provider disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum Drift {
    /// The record points at a different provider subscription.
    SubscriptionId { local: Option<String>, remote: String },
    Status { local: SubscriptionStatus, remote: SubscriptionStatus },
    PeriodEnd { local: Option<DateTime<Utc>>, remote: Option<DateTime<Utc>> },
    CancelAtPeriodEnd { local: bool, remote: bool },
    Price { local: Option<String>, remote: Option<String> },
}

/// Repairs local subscription records from the billing provider.
pub struct ReconciliationService {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn BillingProvider>,
    config: ReconcileConfig,
}

impl ReconciliationService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn BillingProvider>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Reconcile one provider subscription, optionally against a local record.
    ///
    /// # Errors
    ///
    /// - [`BillingError::ProviderUnreachable`]: retryable, nothing was written
    /// - [`BillingError::ProviderPermanentFailure`]: the provider does not know
    ///   the id, nothing was written
    /// - [`BillingError::RecordNotFound`]: `local_record_id` does not exist
    /// - store errors from reading or repairing the record
    pub async fn reconcile(
        &self,
        external_subscription_id: &str,
        local_record_id: Option<&str>,
    ) -> BillingResult<Reconciliation> {
        let snapshot = match self.provider.fetch_subscription(external_subscription_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    target: "subscription_sync::reconcile",
                    subscription_id = external_subscription_id,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Provider lookup failed"
                );
                return Err(e);
            }
        };

        let Some(record_id) = local_record_id else {
            return Ok(Reconciliation {
                snapshot,
                drift: Vec::new(),
                repaired: false,
            });
        };

        let record = self
            .store
            .find_by_id(record_id)
            .await?
            .ok_or_else(|| BillingError::RecordNotFound {
                record_id: record_id.to_string(),
            })?;

        let drift = compare(&record, &snapshot);
        if drift.is_empty() {
            tracing::debug!(
                target: "subscription_sync::reconcile",
                record_id = record_id,
                "Subscription in sync"
            );
            return Ok(Reconciliation {
                snapshot,
                drift,
                repaired: false,
            });
        }

        let needs_repair = snapshot.status == SubscriptionStatus::Canceled
            && record.status != SubscriptionStatus::Canceled;

        if needs_repair {
            self.store
                .update_status(record_id, SubscriptionStatus::Canceled)
                .await?;
            tracing::info!(
                target: "subscription_sync::reconcile",
                record_id = record_id,
                subscription_id = external_subscription_id,
                previous_status = %record.status,
                "Repaired local subscription status to canceled"
            );
        }
        let repaired = needs_repair;

        tracing::info!(
            target: "subscription_sync::reconcile",
            record_id = record_id,
            drift = drift.len(),
            repaired = repaired,
            "Subscription drift detected"
        );

        Ok(Reconciliation {
            snapshot,
            drift,
            repaired,
        })
    }

    /// [`reconcile`](Self::reconcile), retrying unreachable-provider failures
    /// with exponential backoff up to `max_retries` times.
    ///
    /// Permanent failures return immediately.
    pub async fn reconcile_with_backoff(
        &self,
        external_subscription_id: &str,
        local_record_id: Option<&str>,
    ) -> BillingResult<Reconciliation> {
        let mut attempts = 0;
        loop {
            match self.reconcile(external_subscription_id, local_record_id).await {
                Err(e) if e.is_retryable() && attempts < self.config.max_retries => {
                    let delay = backoff_delay(
                        attempts,
                        self.config.base_delay_ms,
                        self.config.max_delay_ms,
                    );
                    tracing::warn!(
                        target: "subscription_sync::reconcile",
                        subscription_id = external_subscription_id,
                        attempt = attempts + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying reconciliation after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempts += 1;
                }
                result => return result,
            }
        }
    }

    /// Reconcile whatever record `owner_user_id` has.
    ///
    /// Returns `Ok(None)` when the user has no record, or a record that is not
    /// backed by a provider subscription (manual grants are never reconciled).
    pub async fn reconcile_owner(&self, owner_user_id: &str) -> BillingResult<Option<Reconciliation>> {
        let Some(record) = self.store.find_by_owner(owner_user_id).await? else {
            return Ok(None);
        };
        let Some(external_id) = record
            .external_subscription_id
            .as_deref()
            .filter(|id| is_provider_subscription_id(id))
        else {
            return Ok(None);
        };

        self.reconcile(external_id, Some(&record.id)).await.map(Some)
    }

    #[must_use]
    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }
}

fn compare(record: &SubscriptionRecord, snapshot: &ProviderSnapshot) -> Vec<Drift> {
    let mut drift = Vec::new();

    if record.external_subscription_id.as_deref() != Some(snapshot.external_subscription_id.as_str()) {
        drift.push(Drift::SubscriptionId {
            local: record.external_subscription_id.clone(),
            remote: snapshot.external_subscription_id.clone(),
        });
    }
    if record.status != snapshot.status {
        drift.push(Drift::Status {
            local: record.status,
            remote: snapshot.status,
        });
    }
    if record.current_period_end != snapshot.current_period_end {
        drift.push(Drift::PeriodEnd {
            local: record.current_period_end,
            remote: snapshot.current_period_end,
        });
    }
    if record.cancel_at_period_end != snapshot.cancel_at_period_end {
        drift.push(Drift::CancelAtPeriodEnd {
            local: record.cancel_at_period_end,
            remote: snapshot.cancel_at_period_end,
        });
    }
    if record.external_price_id != snapshot.price_id {
        drift.push(Drift::Price {
            local: record.external_price_id.clone(),
            remote: snapshot.price_id.clone(),
        });
    }

    drift
}

/// Periodically reconciles the session user's subscription.
///
/// A safety net for missed webhooks: on each tick the current user's record
/// is reconciled and, on success, the cache is refetched.
pub struct ReconcilePoller {
    service: Arc<ReconciliationService>,
    session: SessionContext,
    cache: SubscriptionCache,
}

impl ReconcilePoller {
    /// Start polling at `service.config().poll_interval()`.
    pub fn spawn(
        service: Arc<ReconciliationService>,
        session: SessionContext,
        cache: SubscriptionCache,
    ) -> PollerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let poller = Self {
            service,
            session,
            cache,
        };
        let task = tokio::spawn(poller.run(shutdown_rx));
        PollerHandle { shutdown_tx, task }
    }

    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let period = self.service.config().poll_interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            target: "subscription_sync::reconcile",
            interval_secs = period.as_secs(),
            "Reconcile poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => self.tick().await,
            }
        }

        tracing::info!(target: "subscription_sync::reconcile", "Reconcile poller stopped");
    }

    async fn tick(&self) {
        let Some(user_id) = self.session.current_user() else {
            return;
        };

        match self.service.reconcile_owner(&user_id).await {
            Ok(Some(_)) => {
                self.cache.refetch(&user_id).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    target: "subscription_sync::reconcile",
                    user_id = %user_id,
                    error = %e,
                    "Periodic reconciliation failed"
                );
            }
        }
    }
}

/// Handle to a running poller. Dropping it stops the poller.
pub struct PollerHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Stop the poller and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            tracing::error!(target: "subscription_sync::reconcile", error = %e, "Poller task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::provider::test::MockBillingProvider;
    use crate::billing::storage::test::InMemorySubscriptionStore;
    use chrono::TimeZone;

    fn period_end() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap()
    }

    fn create_test_service() -> (ReconciliationService, InMemorySubscriptionStore, MockBillingProvider) {
        let store = InMemorySubscriptionStore::new();
        store.insert(
            SubscriptionRecord::new("rec_1", "user_1", SubscriptionStatus::Active)
                .with_external_subscription_id("sub_1")
                .with_price_id("price_pro")
                .with_period_end(period_end()),
        );

        let provider = MockBillingProvider::new();
        provider.set_subscription(snapshot(SubscriptionStatus::Active));

        let service = ReconciliationService::new(
            Arc::new(store.clone()),
            Arc::new(provider.clone()),
            ReconcileConfig::default(),
        );
        (service, store, provider)
    }

    fn snapshot(status: SubscriptionStatus) -> ProviderSnapshot {
        ProviderSnapshot {
            external_subscription_id: "sub_1".to_string(),
            status,
            current_period_end: Some(period_end()),
            cancel_at_period_end: false,
            price_id: Some("price_pro".to_string()),
        }
    }

    #[tokio::test]
    async fn test_in_sync_performs_no_write() {
        let (service, store, _) = create_test_service();
        let result = service.reconcile("sub_1", Some("rec_1")).await.unwrap();
        assert!(result.is_in_sync());
        assert!(!result.repaired);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_canceled_upstream_repairs_status_only() {
        let (service, store, provider) = create_test_service();
        let mut remote = snapshot(SubscriptionStatus::Canceled);
        remote.cancel_at_period_end = true;
        provider.set_subscription(remote);

        let result = service.reconcile("sub_1", Some("rec_1")).await.unwrap();
        assert!(result.repaired);
        assert!(result.drift.contains(&Drift::Status {
            local: SubscriptionStatus::Active,
            remote: SubscriptionStatus::Canceled,
        }));
        assert!(result.drift.contains(&Drift::CancelAtPeriodEnd { local: false, remote: true }));

        let record = store.get("rec_1").unwrap();
        assert_eq!(record.status, SubscriptionStatus::Canceled);
        // other drifted fields are reported, not written
        assert!(!record.cancel_at_period_end);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let (service, store, provider) = create_test_service();
        provider.set_subscription(snapshot(SubscriptionStatus::Canceled));

        let first = service.reconcile("sub_1", Some("rec_1")).await.unwrap();
        let second = service.reconcile("sub_1", Some("rec_1")).await.unwrap();

        assert!(first.repaired);
        assert!(!second.repaired);
        assert!(second.is_in_sync());
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_provider_unreachable_is_retryable_and_writes_nothing() {
        let (service, store, provider) = create_test_service();
        provider.set_unreachable(true);

        let err = service.reconcile("sub_1", Some("rec_1")).await.unwrap_err();
        assert!(matches!(err, BillingError::ProviderUnreachable { .. }));
        assert!(err.is_retryable());
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_unknown_subscription_is_permanent() {
        let (service, store, _) = create_test_service();

        let err = service.reconcile("sub_unknown", Some("rec_1")).await.unwrap_err();
        assert!(matches!(err, BillingError::ProviderPermanentFailure { .. }));
        assert!(!err.is_retryable());
        assert_eq!(store.get("rec_1").unwrap().status, SubscriptionStatus::Active);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_without_local_record_returns_snapshot() {
        let (service, store, provider) = create_test_service();
        provider.set_subscription(snapshot(SubscriptionStatus::Canceled));

        let result = service.reconcile("sub_1", None).await.unwrap();
        assert_eq!(result.snapshot.status, SubscriptionStatus::Canceled);
        assert!(!result.repaired);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_missing_local_record() {
        let (service, _, _) = create_test_service();
        let err = service.reconcile("sub_1", Some("rec_404")).await.unwrap_err();
        assert!(matches!(err, BillingError::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn test_repairs_record_without_linked_subscription() {
        let (service, store, provider) = create_test_service();
        store.insert(SubscriptionRecord::new("rec_2", "user_2", SubscriptionStatus::Active));
        provider.set_subscription(snapshot(SubscriptionStatus::Canceled));

        let result = service.reconcile("sub_1", Some("rec_2")).await.unwrap();
        assert!(result.repaired);
        assert!(result.drift.contains(&Drift::SubscriptionId {
            local: None,
            remote: "sub_1".to_string(),
        }));
        assert_eq!(store.get("rec_2").unwrap().status, SubscriptionStatus::Canceled);
        assert_eq!(store.writes(), 1);

        let again = service.reconcile("sub_1", Some("rec_2")).await.unwrap();
        assert!(!again.repaired);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_active_upstream_does_not_downgrade_local() {
        let (service, store, provider) = create_test_service();
        store.insert(
            SubscriptionRecord::new("rec_1", "user_1", SubscriptionStatus::Canceled)
                .with_external_subscription_id("sub_1")
                .with_price_id("price_pro")
                .with_period_end(period_end()),
        );
        provider.set_subscription(snapshot(SubscriptionStatus::Active));

        let result = service.reconcile("sub_1", Some("rec_1")).await.unwrap();
        assert!(!result.repaired);
        assert_eq!(result.drift.len(), 1);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retries_unreachable_then_gives_up() {
        let (service, _, provider) = create_test_service();
        provider.set_unreachable(true);

        let err = service.reconcile_with_backoff("sub_1", Some("rec_1")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(provider.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_does_not_retry_permanent_failure() {
        let (service, _, provider) = create_test_service();
        let err = service.reconcile_with_backoff("sub_nope", None).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_owner_skips_manual_grants() {
        let (service, store, provider) = create_test_service();
        store.insert(
            SubscriptionRecord::new("rec_2", "user_2", SubscriptionStatus::Active)
                .with_external_subscription_id("manual_comp_2025"),
        );

        assert!(service.reconcile_owner("user_2").await.unwrap().is_none());
        assert!(service.reconcile_owner("user_nobody").await.unwrap().is_none());
        assert!(service.reconcile_owner("user_1").await.unwrap().is_some());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_repairs_and_refetches() {
        let (service, store, provider) = create_test_service();
        let cache = SubscriptionCache::new(Arc::new(store.clone()), &crate::config::CacheConfig::default());
        let session = SessionContext::for_user("user_1");

        let view = cache.load("user_1").await;
        assert_eq!(view.data.unwrap().status, SubscriptionStatus::Active);

        provider.set_subscription(snapshot(SubscriptionStatus::Canceled));
        let handle = ReconcilePoller::spawn(Arc::new(service), session, cache.clone());

        tokio::time::sleep(ReconcileConfig::default().poll_interval() + std::time::Duration::from_secs(1)).await;
        assert_eq!(store.writes(), 1);

        let view = cache.peek("user_1").await.unwrap();
        assert_eq!(view.data.unwrap().status, SubscriptionStatus::Canceled);

        handle.shutdown().await;
    }
}
