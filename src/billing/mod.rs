//! Subscription entitlement sync.
//!
//! Keeps a per-user view of subscription state consistent with the
//! subscription store and, through reconciliation, with the billing provider.
//!
//! - [`storage`]: the record type and the store boundary
//! - [`entitlements`]: pure entitlement and label resolution
//! - [`plans`]: price id to plan name lookup
//! - [`cache`]: the staleness-bounded per-user cache every read goes through
//! - [`realtime`]: change-feed driven cache invalidation
//! - [`reconcile`]: provider reconciliation and the periodic poller
//! - [`reader`] and [`routes`]: consumer-facing status
//!
//! # Example
//!
//! ```rust,ignore
//! use subscription_sync::billing::{
//!     PlanRegistry, RealtimeInvalidator, SessionContext, SubscriptionCache, SubscriptionReader,
//! };
//!
//! let cache = SubscriptionCache::new(store, &config.cache);
//! let session = SessionContext::new();
//! let invalidator = RealtimeInvalidator::spawn(session.clone(), feed, cache.clone());
//!
//! session.login(user_id);
//! let reader = SubscriptionReader::new(session, cache, Arc::new(PlanRegistry::from_catalog(&catalog)));
//! let status = reader.status().await;
//! if status.is_active {
//!     // unlock paid features
//! }
//! ```

pub mod backoff;
pub mod cache;
pub mod entitlements;
pub mod error;
#[cfg(feature = "stripe")]
pub mod live_client;
pub mod plans;
pub mod provider;
pub mod reader;
pub mod realtime;
pub mod reconcile;
pub mod routes;
pub mod session;
pub mod storage;

// Storage exports
pub use storage::{SubscriptionRecord, SubscriptionStatus, SubscriptionStore};

// Entitlement exports
pub use entitlements::{
    EntitlementState, MANUAL_SUBSCRIPTION_PREFIX, PROVIDER_SUBSCRIPTION_PREFIX, StatusLabel,
    effective_status_label, effective_status_label_at, is_entitled, is_entitled_at,
    is_in_grace_window_at, is_manual_subscription_id, is_provider_subscription_id,
    is_real_subscription,
};

// Plan exports
pub use plans::{
    BillingInterval, PlanBuilder, PlanDefinition, PlanRegistry, PlanRegistryBuilder, PriceMode,
    UNDEFINED_PLAN_LABEL,
};

// Cache exports
pub use cache::{CacheView, SubscriptionCache};

// Realtime exports
pub use realtime::{
    ChangeEvent, ChangeFeed, ChangeKind, FeedSubscription, InMemoryChangeFeed, InvalidatorHandle,
    RealtimeInvalidator,
};

// Provider and reconciliation exports
pub use provider::{BillingProvider, ProviderSnapshot};
pub use reconcile::{Drift, PollerHandle, ReconcilePoller, Reconciliation, ReconciliationService};

// Consumer exports
pub use reader::{BillingStatus, SubscriptionReader};
pub use routes::{BillingRoutes, RefreshResponse};
pub use session::SessionContext;

pub use error::{BillingError, BillingResult};

// Live client exports (production Stripe provider)
#[cfg(feature = "stripe")]
pub use live_client::{InvalidApiKeyError, LiveStripeConfig, LiveStripeProvider};

// Test exports
#[cfg(any(test, feature = "test-billing"))]
pub use storage::test::InMemorySubscriptionStore;

#[cfg(any(test, feature = "test-billing"))]
pub use provider::test::MockBillingProvider;
