//! Live Stripe billing provider.
//!
//! Reads subscriptions from the Stripe API with retry, timeout and secure API
//! key handling, and maps every failure to a typed provider error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

use super::backoff::backoff_delay;
use super::error::{BillingError, BillingResult};
use super::provider::{BillingProvider, ProviderSnapshot};
use super::storage::SubscriptionStatus;
use crate::config::ProviderConfig;

const STRIPE_TARGET: &str = "subscription_sync::billing::stripe";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the live Stripe provider.
#[derive(Debug, Clone)]
pub struct LiveStripeConfig {
    /// Maximum number of retry attempts for transient failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for LiveStripeConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            timeout_seconds: 30,
        }
    }
}

impl LiveStripeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub fn base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

impl From<&ProviderConfig> for LiveStripeConfig {
    fn from(config: &ProviderConfig) -> Self {
        Self::default()
            .max_retries(config.max_retries)
            .timeout_seconds(config.timeout_seconds)
    }
}

// ============================================================================
// API Key Validation
// ============================================================================

/// Error returned when API key validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidApiKeyError {
    pub reason: String,
}

impl std::fmt::Display for InvalidApiKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid Stripe API key: {}", self.reason)
    }
}

impl std::error::Error for InvalidApiKeyError {}

/// Validate a Stripe secret or restricted key.
///
/// Publishable keys are rejected: subscriptions cannot be read with them.
fn validate_api_key(key: &str) -> Result<(), InvalidApiKeyError> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.is_empty() {
        return Err(InvalidApiKeyError {
            reason: "API key cannot be empty".to_string(),
        });
    }

    if key.len() < MIN_KEY_LENGTH {
        return Err(InvalidApiKeyError {
            reason: format!("API key too short (minimum {} characters)", MIN_KEY_LENGTH),
        });
    }

    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(InvalidApiKeyError {
            reason: "API key must start with sk_test_, sk_live_, rk_test_, or rk_live_".to_string(),
        });
    }

    Ok(())
}

// ============================================================================
// Live Stripe Provider
// ============================================================================

/// Read-only Stripe client used for reconciliation.
///
/// ```rust,ignore
/// use subscription_sync::billing::{LiveStripeConfig, LiveStripeProvider};
///
/// let provider = LiveStripeProvider::new(api_key, LiveStripeConfig::from(&config.provider))?;
/// let snapshot = provider.fetch_subscription("sub_123").await?;
/// ```
#[derive(Clone)]
pub struct LiveStripeProvider {
    client: stripe::Client,
    config: LiveStripeConfig,
    api_key: SecretString,
}

impl LiveStripeProvider {
    /// Create a provider. The key is kept out of debug output.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key format is invalid.
    pub fn new(
        api_key: impl Into<SecretString>,
        config: LiveStripeConfig,
    ) -> Result<Self, InvalidApiKeyError> {
        let api_key: SecretString = api_key.into();
        validate_api_key(api_key.expose_secret())?;

        let client = stripe::Client::new(api_key.expose_secret()).with_app_info(
            env!("CARGO_PKG_NAME").to_string(),
            Some(env!("CARGO_PKG_VERSION").to_string()),
            None,
        );

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the API key format is invalid.
    pub fn with_default_config(api_key: impl Into<SecretString>) -> Result<Self, InvalidApiKeyError> {
        Self::new(api_key, LiveStripeConfig::default())
    }

    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    #[must_use]
    pub fn is_live_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_live_") || key.starts_with("rk_live_")
    }

    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }
}

impl std::fmt::Debug for LiveStripeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStripeProvider")
            .field("config", &self.config)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BillingProvider for LiveStripeProvider {
    async fn fetch_subscription(&self, external_subscription_id: &str) -> BillingResult<ProviderSnapshot> {
        let sub_id: stripe::SubscriptionId =
            external_subscription_id
                .parse()
                .map_err(|_| BillingError::ProviderPermanentFailure {
                    subscription_id: external_subscription_id.to_string(),
                    message: "Invalid subscription ID".to_string(),
                    code: None,
                    http_status: None,
                })?;

        let subscription = with_retry(&self.config, external_subscription_id, || {
            let client = self.client.clone();
            let sub_id = sub_id.clone();
            async move { stripe::Subscription::retrieve(&client, &sub_id, &[]).await }
        })
        .await?;

        Ok(map_subscription(subscription))
    }
}

// ============================================================================
// Retry Logic
// ============================================================================

/// Run a Stripe call with a per-attempt timeout, retrying rate limits, 5xx
/// responses, timeouts and transport failures.
async fn with_retry<T, F, Fut>(
    config: &LiveStripeConfig,
    subscription_id: &str,
    operation_fn: F,
) -> BillingResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, stripe::StripeError>>,
{
    let timeout_duration = Duration::from_secs(config.timeout_seconds);
    let mut attempts = 0;

    loop {
        let error = match tokio::time::timeout(timeout_duration, operation_fn()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => map_stripe_error(e, subscription_id),
            Err(_timeout) => BillingError::ProviderUnreachable {
                subscription_id: subscription_id.to_string(),
                message: format!("Request timed out after {} seconds", config.timeout_seconds),
                http_status: Some(408),
            },
        };

        if !error.is_retryable() || attempts >= config.max_retries {
            return Err(error);
        }

        let delay = backoff_delay(attempts, config.base_delay_ms, config.max_delay_ms);
        tracing::warn!(
            target: STRIPE_TARGET,
            subscription_id = subscription_id,
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying Stripe API call after transient error"
        );
        tokio::time::sleep(delay).await;
        attempts += 1;
    }
}

// ============================================================================
// Error Mapping
// ============================================================================

#[inline]
fn is_transient_status(http_status: u16) -> bool {
    http_status == 429 || (500..600).contains(&http_status)
}

fn map_stripe_error(error: stripe::StripeError, subscription_id: &str) -> BillingError {
    let subscription_id = subscription_id.to_string();
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let http_status = request_error.http_status;
            let message = request_error
                .message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());

            if is_transient_status(http_status) {
                BillingError::ProviderUnreachable {
                    subscription_id,
                    message,
                    http_status: Some(http_status),
                }
            } else {
                BillingError::ProviderPermanentFailure {
                    subscription_id,
                    message,
                    code: request_error.code.as_ref().map(|c| format!("{c:?}")),
                    http_status: Some(http_status),
                }
            }
        }
        stripe::StripeError::Timeout => BillingError::ProviderUnreachable {
            subscription_id,
            message: "Request timed out".to_string(),
            http_status: Some(408),
        },
        stripe::StripeError::ClientError(msg) => BillingError::ProviderUnreachable {
            subscription_id,
            message: format!("HTTP client error: {msg}"),
            http_status: None,
        },
        stripe::StripeError::QueryStringSerialize(e) => BillingError::Internal {
            message: format!("Failed to serialize request: {e}"),
        },
        stripe::StripeError::JSONSerialize(e) => BillingError::Internal {
            message: format!("Failed to deserialize response: {e}"),
        },
        stripe::StripeError::UnsupportedVersion => BillingError::Internal {
            message: "Unsupported Stripe API version".to_string(),
        },
    }
}

// ============================================================================
// Subscription Mapping
// ============================================================================

fn map_status(status: stripe::SubscriptionStatus) -> SubscriptionStatus {
    match status {
        stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
        stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
        stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
        stripe::SubscriptionStatus::Incomplete => SubscriptionStatus::Incomplete,
        stripe::SubscriptionStatus::Canceled => SubscriptionStatus::Canceled,
        other => SubscriptionStatus::parse_lossy(other.as_str()),
    }
}

fn map_subscription(sub: stripe::Subscription) -> ProviderSnapshot {
    let price_id = sub
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string());

    ProviderSnapshot {
        external_subscription_id: sub.id.to_string(),
        status: map_status(sub.status),
        current_period_end: timestamp_to_datetime(sub.current_period_end),
        cancel_at_period_end: sub.cancel_at_period_end,
        price_id,
    }
}

fn timestamp_to_datetime(secs: stripe::Timestamp) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}
