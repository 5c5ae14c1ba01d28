//! Billing-specific error types.
//!
//! Every failure the sync engine can report is a typed variant here, so callers
//! can tell a transient outage from a permanent one without inspecting strings.
//! None of these variants means "not entitled": entitlement is only ever
//! decided from a subscription record.

use std::fmt;

use crate::error::SyncError;

/// Result alias for billing operations.
pub type BillingResult<T> = std::result::Result<T, BillingError>;

/// Billing-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Store errors
    /// The relational store could not be reached; safe to retry.
    StoreUnavailable { operation: String, message: String },
    /// The store rejected the operation; retrying will not help.
    StoreFailure { operation: String, message: String },
    /// No local subscription record with this id.
    RecordNotFound { record_id: String },

    // Provider errors
    /// Network or provider-side failure; safe to retry.
    ProviderUnreachable {
        subscription_id: String,
        message: String,
        http_status: Option<u16>,
    },
    /// The provider does not know this subscription, or rejected the request.
    ProviderPermanentFailure {
        subscription_id: String,
        message: String,
        code: Option<String>,
        http_status: Option<u16>,
    },

    // Status errors
    /// A status string outside the closed set.
    UnknownStatus { status: String },

    // Plan registry errors
    /// A plan was declared without any price identifier.
    MissingPriceId { plan_id: String },
    /// Two plans claim the same price identifier.
    DuplicatePriceId {
        price_id: String,
        first_plan: String,
        second_plan: String,
    },

    // Change feed errors
    /// Opening a change-feed subscription failed.
    ChangeFeedUnavailable { message: String },

    // General errors
    /// An unexpected internal error occurred.
    Internal { message: String },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreUnavailable { operation, message } => {
                write!(f, "Subscription store unavailable during '{}': {}", operation, message)
            }
            Self::StoreFailure { operation, message } => {
                write!(f, "Subscription store failed during '{}': {}", operation, message)
            }
            Self::RecordNotFound { record_id } => {
                write!(f, "Subscription record not found: {}", record_id)
            }
            Self::ProviderUnreachable { subscription_id, message, http_status } => {
                write!(
                    f,
                    "Billing provider unreachable for '{}': {}",
                    subscription_id, message
                )?;
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::ProviderPermanentFailure { subscription_id, message, code, http_status } => {
                write!(
                    f,
                    "Billing provider rejected '{}': {}",
                    subscription_id, message
                )?;
                if let Some(code) = code {
                    write!(f, " (code: {})", code)?;
                }
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::UnknownStatus { status } => {
                write!(f, "Unknown subscription status: '{}'", status)
            }
            Self::MissingPriceId { plan_id } => {
                write!(f, "Plan '{}' has no price identifier", plan_id)
            }
            Self::DuplicatePriceId { price_id, first_plan, second_plan } => {
                write!(
                    f,
                    "Price '{}' is claimed by both '{}' and '{}'",
                    price_id, first_plan, second_plan
                )
            }
            Self::ChangeFeedUnavailable { message } => {
                write!(f, "Change feed unavailable: {}", message)
            }
            Self::Internal { message } => {
                write!(f, "Internal billing error: {}", message)
            }
        }
    }
}

impl std::error::Error for BillingError {}

impl From<BillingError> for SyncError {
    fn from(err: BillingError) -> Self {
        match &err {
            BillingError::RecordNotFound { .. } | BillingError::ProviderPermanentFailure { .. } => {
                SyncError::NotFound(err.to_string())
            }

            BillingError::UnknownStatus { .. } => SyncError::BadRequest(err.to_string()),

            BillingError::StoreUnavailable { .. }
            | BillingError::ProviderUnreachable { .. }
            | BillingError::ChangeFeedUnavailable { .. } => {
                SyncError::ServiceUnavailable(err.to_string())
            }

            BillingError::MissingPriceId { .. } | BillingError::DuplicatePriceId { .. } => {
                SyncError::Configuration(err.to_string())
            }

            BillingError::StoreFailure { .. } | BillingError::Internal { .. } => {
                SyncError::Internal(err.to_string())
            }
        }
    }
}

impl BillingError {
    /// Shorthand for a transient store error.
    pub fn store_unavailable(operation: &str, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Shorthand for a permanent store error.
    pub fn store_failure(operation: &str, message: impl Into<String>) -> Self {
        Self::StoreFailure {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Transient store errors, unreachable providers and change-feed outages
    /// may succeed on a later attempt. Everything else is permanent.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. }
                | Self::ProviderUnreachable { .. }
                | Self::ChangeFeedUnavailable { .. }
        )
    }

    /// Check if the error came from the billing provider.
    #[must_use]
    pub fn is_provider_error(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnreachable { .. } | Self::ProviderPermanentFailure { .. }
        )
    }

    /// Check if the error came from the subscription store.
    #[must_use]
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::StoreFailure { .. } | Self::RecordNotFound { .. }
        )
    }
}
