//! subscription-sync - keeps a tenant's paid access in step with the billing provider
//!
//! The crate decides, at any instant, whether a user's subscription currently grants
//! access to the product, and keeps a locally cached subscription record consistent
//! with an external billing provider that remains the ultimate authority.
//!
//! # Components
//!
//! - **Plan Registry**: maps live and test price identifiers to plan definitions
//! - **Entitlement Resolver**: pure functions over a subscription record
//! - **Subscription Cache**: per-user, staleness-bounded, de-duplicated reads
//! - **Realtime Invalidator**: change-feed events force a cache refetch
//! - **Reconciliation Service**: idempotent drift repair against the provider
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use subscription_sync::billing::{
//!     PlanRegistry, RealtimeInvalidator, SessionContext, SubscriptionCache, SubscriptionReader,
//! };
//! use subscription_sync::{PlanCatalogConfig, SyncConfigBuilder};
//!
//! #[tokio::main]
//! async fn main() -> subscription_sync::Result<()> {
//!     subscription_sync::init_tracing();
//!
//!     let config = SyncConfigBuilder::new().from_env().build()?;
//!     let registry = Arc::new(PlanRegistry::from_catalog(&PlanCatalogConfig::from_env()));
//!
//!     let session = SessionContext::new();
//!     let cache = SubscriptionCache::new(store, &config.cache);
//!     let _invalidator = RealtimeInvalidator::spawn(session.clone(), feed, cache.clone());
//!
//!     session.login("user_123");
//!     let reader = SubscriptionReader::new(session, cache, registry);
//!     let status = reader.status().await;
//!     println!("active: {}", status.is_active);
//!     Ok(())
//! }
//! ```

pub mod billing;
mod config;
mod error;
mod utils;

pub use config::{
    CacheConfig, LoggingConfig, PlanCatalogConfig, PriceIds, ProviderConfig, ReconcileConfig,
    SyncConfig, SyncConfigBuilder,
};
pub use error::{ErrorResponse, Result, SyncError};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "subscription_sync=debug")
/// - `SUBSYNC_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    install_subscriber(env_filter, json_logs);
}

/// Initialize tracing from a loaded [`SyncConfig`]
pub fn init_tracing_with_config(config: &SyncConfig) {
    install_subscriber(EnvFilter::new(&config.logging.level), config.logging.json);
}

fn install_subscriber(env_filter: EnvFilter, json: bool) {
    // try_init so a host application that already installed a subscriber keeps it
    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}
