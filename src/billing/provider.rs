//! Billing provider boundary.
//!
//! The provider is the authority on subscription state. This crate only ever
//! reads from it, by external subscription id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::BillingResult;
use super::storage::SubscriptionStatus;

/// Authoritative subscription state as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    pub external_subscription_id: String,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    /// Price of the first subscription item, if any.
    pub price_id: Option<String>,
}

/// Read-only client for the external billing provider.
///
/// Implementations must map failures to typed variants:
/// [`BillingError::ProviderUnreachable`](super::BillingError::ProviderUnreachable)
/// for network errors, timeouts, rate limits and 5xx responses, and
/// [`BillingError::ProviderPermanentFailure`](super::BillingError::ProviderPermanentFailure)
/// for unknown ids and other rejected requests.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Fetch the current state of a subscription.
    async fn fetch_subscription(&self, external_subscription_id: &str) -> BillingResult<ProviderSnapshot>;
}

/// Mock billing provider for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::error::BillingError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, RwLock};

    /// Mock provider backed by a map of snapshots.
    ///
    /// Unknown ids fail permanently; `set_unreachable(true)` makes every call
    /// fail as a network outage.
    #[derive(Default, Clone)]
    pub struct MockBillingProvider {
        subscriptions: Arc<RwLock<HashMap<String, ProviderSnapshot>>>,
        unreachable: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    impl MockBillingProvider {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Set the snapshot returned for its subscription id.
        pub fn set_subscription(&self, snapshot: ProviderSnapshot) {
            self.subscriptions
                .write()
                .unwrap()
                .insert(snapshot.external_subscription_id.clone(), snapshot);
        }

        /// Simulate a network outage.
        pub fn set_unreachable(&self, unreachable: bool) {
            self.unreachable.store(unreachable, Ordering::SeqCst);
        }

        /// Number of fetches made.
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BillingProvider for MockBillingProvider {
        async fn fetch_subscription(&self, external_subscription_id: &str) -> BillingResult<ProviderSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if self.unreachable.load(Ordering::SeqCst) {
                return Err(BillingError::ProviderUnreachable {
                    subscription_id: external_subscription_id.to_string(),
                    message: "simulated network failure".to_string(),
                    http_status: None,
                });
            }

            self.subscriptions
                .read()
                .unwrap()
                .get(external_subscription_id)
                .cloned()
                .ok_or_else(|| BillingError::ProviderPermanentFailure {
                    subscription_id: external_subscription_id.to_string(),
                    message: "No such subscription".to_string(),
                    code: Some("resource_missing".to_string()),
                    http_status: Some(404),
                })
        }
    }
}
