//! Entitlement resolution.
//!
//! Pure functions turning a subscription record into "may this user use the
//! product right now". They never fail and never touch I/O. The `_at` variants
//! take the evaluation instant explicitly; the plain variants use `Utc::now()`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::storage::{SubscriptionRecord, SubscriptionStatus};

/// Prefix of subscription ids issued by the billing provider.
pub const PROVIDER_SUBSCRIPTION_PREFIX: &str = "sub_";
/// Prefix of subscriptions granted by hand, outside the provider.
pub const MANUAL_SUBSCRIPTION_PREFIX: &str = "manual_";

/// Resolved entitlement state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntitlementState {
    /// No subscription record.
    None,
    Active,
    Trialing,
    /// Canceled, but paid up until `until`.
    CanceledGrace { until: DateTime<Utc> },
    /// Canceled and past its period end (or no period end).
    Expired,
    PastDue,
    Incomplete,
}

impl EntitlementState {
    /// Resolve the state of a record at `now`.
    #[must_use]
    pub fn resolve_at(record: Option<&SubscriptionRecord>, now: DateTime<Utc>) -> Self {
        let Some(record) = record else {
            return Self::None;
        };

        match record.status {
            SubscriptionStatus::Active => Self::Active,
            SubscriptionStatus::Trialing => Self::Trialing,
            SubscriptionStatus::PastDue => Self::PastDue,
            SubscriptionStatus::Incomplete => Self::Incomplete,
            SubscriptionStatus::Canceled => match record.current_period_end {
                // strictly after: a period ending exactly now is over
                Some(until) if until > now => Self::CanceledGrace { until },
                _ => Self::Expired,
            },
        }
    }

    /// Whether this state grants access.
    #[must_use]
    pub fn is_entitled(&self) -> bool {
        matches!(
            self,
            Self::Active | Self::Trialing | Self::CanceledGrace { .. }
        )
    }

    /// Label shown to the user for this state.
    #[must_use]
    pub fn label(&self) -> StatusLabel {
        match self {
            Self::None => StatusLabel::NoSubscription,
            Self::Active | Self::CanceledGrace { .. } => StatusLabel::Active,
            Self::Trialing => StatusLabel::Trialing,
            Self::Expired => StatusLabel::Canceled,
            Self::PastDue => StatusLabel::PastDue,
            Self::Incomplete => StatusLabel::Incomplete,
        }
    }
}

/// User-facing status label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLabel {
    Active,
    Trialing,
    PastDue,
    Incomplete,
    Canceled,
    NoSubscription,
    /// The record could not be read yet, so nothing is known about it.
    Unknown,
}

impl StatusLabel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Incomplete => "incomplete",
            Self::Canceled => "canceled",
            Self::NoSubscription => "no_subscription",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for StatusLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether the record grants access right now.
#[must_use]
pub fn is_entitled(record: Option<&SubscriptionRecord>) -> bool {
    is_entitled_at(record, Utc::now())
}

/// Whether the record grants access at `now`.
///
/// `active` and `trialing` always do. `canceled` does only while
/// `current_period_end` is strictly after `now`. Everything else fails closed.
#[must_use]
pub fn is_entitled_at(record: Option<&SubscriptionRecord>, now: DateTime<Utc>) -> bool {
    EntitlementState::resolve_at(record, now).is_entitled()
}

/// Whether the record is canceled but still inside its paid period.
#[must_use]
pub fn is_in_grace_window_at(record: &SubscriptionRecord, now: DateTime<Utc>) -> bool {
    matches!(
        EntitlementState::resolve_at(Some(record), now),
        EntitlementState::CanceledGrace { .. }
    )
}

/// Label for the record right now.
#[must_use]
pub fn effective_status_label(record: Option<&SubscriptionRecord>) -> StatusLabel {
    effective_status_label_at(record, Utc::now())
}

/// Label for the record at `now`. The grace window renders as `active`.
#[must_use]
pub fn effective_status_label_at(
    record: Option<&SubscriptionRecord>,
    now: DateTime<Utc>,
) -> StatusLabel {
    EntitlementState::resolve_at(record, now).label()
}

/// Whether the record is backed by a provider or manual subscription.
///
/// Requires a non-empty id after the `sub_` or `manual_` prefix.
#[must_use]
pub fn is_real_subscription(record: Option<&SubscriptionRecord>) -> bool {
    record
        .and_then(|r| r.external_subscription_id.as_deref())
        .is_some_and(|id| is_provider_subscription_id(id) || is_manual_subscription_id(id))
}

/// Whether `id` was issued by the billing provider.
#[must_use]
pub fn is_provider_subscription_id(id: &str) -> bool {
    id.strip_prefix(PROVIDER_SUBSCRIPTION_PREFIX)
        .is_some_and(|rest| !rest.is_empty())
}

/// Whether `id` marks a manually granted subscription.
#[must_use]
pub fn is_manual_subscription_id(id: &str) -> bool {
    id.strip_prefix(MANUAL_SUBSCRIPTION_PREFIX)
        .is_some_and(|rest| !rest.is_empty())
}
