//! Storage trait and record types for subscription data.
//!
//! Implement [`SubscriptionStore`] against your relational store. One row per
//! `owner_user_id`, filtered by owner. An in-memory implementation is provided
//! for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

use super::error::{BillingError, BillingResult};

/// Trait for reading and repairing subscription records.
///
/// Implementations should return [`BillingError::StoreUnavailable`] for
/// connection-level failures so the cache can retry them, and
/// [`BillingError::StoreFailure`] for everything else.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Get the subscription record owned by a user, if any.
    async fn find_by_owner(&self, owner_user_id: &str) -> BillingResult<Option<SubscriptionRecord>>;

    /// Get a subscription record by its local id.
    async fn find_by_id(&self, record_id: &str) -> BillingResult<Option<SubscriptionRecord>>;

    /// Overwrite only the status column of a record.
    ///
    /// Returns [`BillingError::RecordNotFound`] if the record does not exist.
    async fn update_status(&self, record_id: &str, status: SubscriptionStatus) -> BillingResult<()>;
}

/// Locally cached subscription state for one user.
///
/// Created when the user completes checkout, mutated by webhook ingestion and
/// the reconciliation service, never hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub id: String,
    pub owner_user_id: String,
    /// Provider customer id, null until the first checkout completes.
    pub external_customer_id: Option<String>,
    /// Provider subscription id (`sub_...`) or a manual grant (`manual_...`).
    pub external_subscription_id: Option<String>,
    /// Price the subscription is billed at, null if no active price.
    pub external_price_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    /// Create a record with no provider linkage yet.
    pub fn new(id: impl Into<String>, owner_user_id: impl Into<String>, status: SubscriptionStatus) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_user_id: owner_user_id.into(),
            external_customer_id: None,
            external_subscription_id: None,
            external_price_id: None,
            status,
            current_period_end: None,
            cancel_at_period_end: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_external_subscription_id(mut self, id: impl Into<String>) -> Self {
        self.external_subscription_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_external_customer_id(mut self, id: impl Into<String>) -> Self {
        self.external_customer_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_price_id(mut self, price_id: impl Into<String>) -> Self {
        self.external_price_id = Some(price_id.into());
        self
    }

    #[must_use]
    pub fn with_period_end(mut self, period_end: DateTime<Utc>) -> Self {
        self.current_period_end = Some(period_end);
        self
    }

    #[must_use]
    pub fn with_cancel_at_period_end(mut self, cancel: bool) -> Self {
        self.cancel_at_period_end = cancel;
        self
    }
}

/// Subscription status.
///
/// A closed set. Provider statuses outside it (`unpaid`, `paused`,
/// `incomplete_expired`, anything new) degrade to [`Incomplete`](Self::Incomplete)
/// so they fail closed instead of crashing a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Subscription is active and paid.
    Active,
    /// Subscription is in trial period.
    Trialing,
    /// Payment failed.
    PastDue,
    /// Awaiting payment, or a status we do not recognise.
    Incomplete,
    /// Subscription has been canceled.
    Canceled,
}

impl SubscriptionStatus {
    /// Parse a status string, degrading unknown values to `Incomplete`.
    ///
    /// Unknown values are logged at error level.
    #[must_use]
    pub fn parse_lossy(status: &str) -> Self {
        match status.parse() {
            Ok(status) => status,
            Err(_) => {
                tracing::error!(
                    target: "subscription_sync::billing",
                    status = status,
                    "Unknown subscription status, treating as incomplete"
                );
                Self::Incomplete
            }
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Incomplete => "incomplete",
            Self::Canceled => "canceled",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "incomplete" => Ok(Self::Incomplete),
            "canceled" => Ok(Self::Canceled),
            other => Err(BillingError::UnknownStatus {
                status: other.to_string(),
            }),
        }
    }
}

impl<'de> Deserialize<'de> for SubscriptionStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse_lossy(&raw))
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// In-memory subscription store for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Arc, RwLock};
    use std::time::Duration;

    /// In-memory subscription store.
    ///
    /// Wraps data in Arc for cheap cloning. Counts reads and writes and can be
    /// told to fail upcoming reads, which is how the cache and reconciliation
    /// tests observe de-duplication, retries and idempotence.
    #[derive(Default, Clone)]
    pub struct InMemorySubscriptionStore {
        inner: Arc<InMemorySubscriptionStoreInner>,
    }

    #[derive(Default)]
    struct InMemorySubscriptionStoreInner {
        records: RwLock<HashMap<String, SubscriptionRecord>>,
        reads: AtomicUsize,
        writes: AtomicUsize,
        transient_failures: AtomicU32,
        permanent_failures: AtomicU32,
        read_delay_ms: AtomicUsize,
    }

    impl InMemorySubscriptionStore {
        /// Create a new in-memory store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Insert or replace a record.
        pub fn insert(&self, record: SubscriptionRecord) {
            self.inner
                .records
                .write()
                .unwrap()
                .insert(record.id.clone(), record);
        }

        /// Get a record by id without counting a read.
        pub fn get(&self, record_id: &str) -> Option<SubscriptionRecord> {
            self.inner.records.read().unwrap().get(record_id).cloned()
        }

        /// Number of `find_*` calls that reached the store.
        pub fn reads(&self) -> usize {
            self.inner.reads.load(Ordering::SeqCst)
        }

        /// Number of successful writes.
        pub fn writes(&self) -> usize {
            self.inner.writes.load(Ordering::SeqCst)
        }

        /// Fail the next `count` reads with `StoreUnavailable`.
        pub fn fail_next_reads(&self, count: u32) {
            self.inner.transient_failures.store(count, Ordering::SeqCst);
        }

        /// Fail the next `count` reads with `StoreFailure`.
        pub fn fail_next_reads_permanently(&self, count: u32) {
            self.inner.permanent_failures.store(count, Ordering::SeqCst);
        }

        /// Delay every read, to hold a fetch in flight.
        pub fn set_read_delay(&self, delay: Duration) {
            self.inner
                .read_delay_ms
                .store(delay.as_millis() as usize, Ordering::SeqCst);
        }

        async fn begin_read(&self, operation: &str) -> BillingResult<()> {
            self.inner.reads.fetch_add(1, Ordering::SeqCst);

            let delay = self.inner.read_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }

            if take_one(&self.inner.transient_failures) {
                return Err(BillingError::store_unavailable(operation, "simulated outage"));
            }
            if take_one(&self.inner.permanent_failures) {
                return Err(BillingError::store_failure(operation, "simulated failure"));
            }
            Ok(())
        }
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl SubscriptionStore for InMemorySubscriptionStore {
        async fn find_by_owner(&self, owner_user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
            self.begin_read("find_by_owner").await?;
            Ok(self
                .inner
                .records
                .read()
                .unwrap()
                .values()
                .find(|r| r.owner_user_id == owner_user_id)
                .cloned())
        }

        async fn find_by_id(&self, record_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
            self.begin_read("find_by_id").await?;
            Ok(self.get(record_id))
        }

        async fn update_status(&self, record_id: &str, status: SubscriptionStatus) -> BillingResult<()> {
            let mut records = self.inner.records.write().unwrap();
            let record = records
                .get_mut(record_id)
                .ok_or_else(|| BillingError::RecordNotFound {
                    record_id: record_id.to_string(),
                })?;
            record.status = status;
            record.updated_at = Utc::now();
            self.inner.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
