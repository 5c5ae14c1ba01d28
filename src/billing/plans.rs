//! Plan registry: price identifiers to plan definitions.
//!
//! Every plan carries a live price id, a test price id, or both. The registry
//! is built once at startup and is immutable afterwards.
//!
//! ```rust,ignore
//! use subscription_sync::billing::{BillingInterval, PlanRegistry};
//!
//! let registry = PlanRegistry::builder()
//!     .plan("pro_monthly")
//!         .display_name("Pro")
//!         .price(7900)
//!         .interval(BillingInterval::Month)
//!         .live_price("price_1Pro")
//!         .test_price("price_1ProTest")
//!         .done()
//!     .build()?;
//!
//! assert_eq!(registry.resolve_display_name(Some("price_1ProTest")), "Pro (Test)");
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::error::{BillingError, BillingResult};
use crate::config::{PlanCatalogConfig, PriceIds};

/// Display name returned when a price id is null or unknown.
pub const UNDEFINED_PLAN_LABEL: &str = "Undefined plan";

/// Billing interval of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

/// Which provider environment a price id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceMode {
    Live,
    Test,
}

/// A sellable plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub id: String,
    pub display_name: String,
    /// Price in minor currency units.
    pub price: u64,
    pub billing_interval: BillingInterval,
    pub interval_count: u32,
    pub live_price_id: Option<String>,
    pub test_price_id: Option<String>,
    /// Label used when resolved through the test price id.
    pub test_display_name: Option<String>,
}

impl PlanDefinition {
    /// Label shown for the test-mode price.
    ///
    /// Falls back to `"<display name> (Test)"`.
    #[must_use]
    pub fn test_label(&self) -> String {
        self.test_display_name
            .clone()
            .unwrap_or_else(|| format!("{} (Test)", self.display_name))
    }

    /// Which environment `price_id` belongs to for this plan.
    #[must_use]
    pub fn price_mode(&self, price_id: &str) -> Option<PriceMode> {
        if self.live_price_id.as_deref() == Some(price_id) {
            Some(PriceMode::Live)
        } else if self.test_price_id.as_deref() == Some(price_id) {
            Some(PriceMode::Test)
        } else {
            None
        }
    }

    fn price_ids(&self) -> impl Iterator<Item = (&str, PriceMode)> {
        self.live_price_id
            .as_deref()
            .map(|id| (id, PriceMode::Live))
            .into_iter()
            .chain(self.test_price_id.as_deref().map(|id| (id, PriceMode::Test)))
    }
}

/// Immutable lookup from price identifiers to plans.
#[derive(Debug, Clone, Default)]
pub struct PlanRegistry {
    plans: Vec<PlanDefinition>,
    by_price: HashMap<String, (usize, PriceMode)>,
}

impl PlanRegistry {
    /// Create a builder for constructing the registry.
    #[must_use]
    pub fn builder() -> PlanRegistryBuilder {
        PlanRegistryBuilder::new()
    }

    /// Build the standard catalog from configured price ids.
    ///
    /// Plans with no configured price id are skipped with a warning, and
    /// conflicting ids are logged and dropped. Never fails.
    #[must_use]
    pub fn from_catalog(catalog: &PlanCatalogConfig) -> Self {
        let mut builder = Self::builder();
        for (id, name, price, interval, ids) in standard_plans(catalog) {
            if ids.is_empty() {
                tracing::warn!(
                    target: "subscription_sync::billing",
                    plan_id = id,
                    "No price ids configured for plan, it will not resolve"
                );
                continue;
            }
            let mut plan = builder
                .plan(id)
                .display_name(name)
                .price(price)
                .interval(interval);
            if let Some(live) = &ids.live {
                plan = plan.live_price(live);
            }
            if let Some(test) = &ids.test {
                plan = plan.test_price(test);
            }
            builder = plan.done();
        }
        builder.build_lenient()
    }

    /// Look up the plan a price id belongs to.
    #[must_use]
    pub fn resolve_plan(&self, price_id: &str) -> Option<&PlanDefinition> {
        self.resolve(price_id).map(|(plan, _)| plan)
    }

    /// Look up the plan and the environment a price id belongs to.
    #[must_use]
    pub fn resolve(&self, price_id: &str) -> Option<(&PlanDefinition, PriceMode)> {
        let (index, mode) = self.by_price.get(price_id)?;
        self.plans.get(*index).map(|plan| (plan, *mode))
    }

    /// User-facing plan name for a price id.
    ///
    /// Test price ids resolve to the plan's test label. Null or unknown ids
    /// resolve to [`UNDEFINED_PLAN_LABEL`].
    #[must_use]
    pub fn resolve_display_name(&self, price_id: Option<&str>) -> String {
        match price_id.and_then(|id| self.resolve(id)) {
            Some((plan, PriceMode::Live)) => plan.display_name.clone(),
            Some((plan, PriceMode::Test)) => plan.test_label(),
            None => UNDEFINED_PLAN_LABEL.to_string(),
        }
    }

    /// Get a plan by its id.
    #[must_use]
    pub fn get(&self, plan_id: &str) -> Option<&PlanDefinition> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    /// Iterate over all plans in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &PlanDefinition> {
        self.plans.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Add a plan, rejecting it if it has no price id or reuses one.
    fn try_insert(&mut self, plan: PlanDefinition) -> BillingResult<()> {
        if plan.live_price_id.is_none() && plan.test_price_id.is_none() {
            return Err(BillingError::MissingPriceId { plan_id: plan.id });
        }

        if plan.live_price_id.is_some() && plan.live_price_id == plan.test_price_id {
            return Err(BillingError::DuplicatePriceId {
                price_id: plan.live_price_id.unwrap_or_default(),
                first_plan: plan.id.clone(),
                second_plan: plan.id,
            });
        }

        for (price_id, _) in plan.price_ids() {
            if let Some((index, _)) = self.by_price.get(price_id) {
                return Err(BillingError::DuplicatePriceId {
                    price_id: price_id.to_string(),
                    first_plan: self.plans[*index].id.clone(),
                    second_plan: plan.id.clone(),
                });
            }
        }

        let index = self.plans.len();
        for (price_id, mode) in plan.price_ids() {
            self.by_price.insert(price_id.to_string(), (index, mode));
        }
        self.plans.push(plan);
        Ok(())
    }
}

/// The plans the product sells, paired with their configured price ids.
fn standard_plans(
    catalog: &PlanCatalogConfig,
) -> [(&'static str, &'static str, u64, BillingInterval, &PriceIds); 4] {
    [
        ("starter_monthly", "Starter", 2_900, BillingInterval::Month, &catalog.starter_monthly),
        ("starter_yearly", "Starter (Yearly)", 29_000, BillingInterval::Year, &catalog.starter_yearly),
        ("pro_monthly", "Pro", 7_900, BillingInterval::Month, &catalog.pro_monthly),
        ("pro_yearly", "Pro (Yearly)", 79_000, BillingInterval::Year, &catalog.pro_yearly),
    ]
}

/// Builder for the plan registry.
#[derive(Debug, Default)]
pub struct PlanRegistryBuilder {
    plans: Vec<PlanDefinition>,
}

impl PlanRegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start defining a new plan.
    #[must_use]
    pub fn plan(self, id: &str) -> PlanBuilder {
        PlanBuilder {
            parent: self,
            plan: PlanDefinition {
                id: id.to_string(),
                display_name: id.to_string(),
                price: 0,
                billing_interval: BillingInterval::Month,
                interval_count: 1,
                live_price_id: None,
                test_price_id: None,
                test_display_name: None,
            },
        }
    }

    /// Add a fully formed plan definition.
    #[must_use]
    pub fn add(mut self, plan: PlanDefinition) -> Self {
        self.plans.push(plan);
        self
    }

    /// Build the registry, failing on the first invalid plan.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::MissingPriceId`] for a plan with no price id and
    /// [`BillingError::DuplicatePriceId`] when a price id is reused.
    pub fn build(self) -> BillingResult<PlanRegistry> {
        let mut registry = PlanRegistry::default();
        for plan in self.plans {
            registry.try_insert(plan)?;
        }
        Ok(registry)
    }

    /// Build the registry, logging and skipping invalid plans.
    ///
    /// The first plan to claim a price id keeps it.
    #[must_use]
    pub fn build_lenient(self) -> PlanRegistry {
        let mut registry = PlanRegistry::default();
        for plan in self.plans {
            let plan_id = plan.id.clone();
            if let Err(e) = registry.try_insert(plan) {
                tracing::error!(
                    target: "subscription_sync::billing",
                    plan_id = %plan_id,
                    error = %e,
                    "Rejected plan definition"
                );
            }
        }
        registry
    }
}

/// Builder for a single plan.
#[derive(Debug)]
pub struct PlanBuilder {
    parent: PlanRegistryBuilder,
    plan: PlanDefinition,
}

impl PlanBuilder {
    #[must_use]
    pub fn display_name(mut self, name: &str) -> Self {
        self.plan.display_name = name.to_string();
        self
    }

    /// Price in minor currency units.
    #[must_use]
    pub fn price(mut self, minor_units: u64) -> Self {
        self.plan.price = minor_units;
        self
    }

    #[must_use]
    pub fn interval(mut self, interval: BillingInterval) -> Self {
        self.plan.billing_interval = interval;
        self
    }

    #[must_use]
    pub fn interval_count(mut self, count: u32) -> Self {
        self.plan.interval_count = count.max(1);
        self
    }

    #[must_use]
    pub fn live_price(mut self, price_id: &str) -> Self {
        self.plan.live_price_id = Some(price_id.to_string());
        self
    }

    #[must_use]
    pub fn test_price(mut self, price_id: &str) -> Self {
        self.plan.test_price_id = Some(price_id.to_string());
        self
    }

    #[must_use]
    pub fn test_display_name(mut self, name: &str) -> Self {
        self.plan.test_display_name = Some(name.to_string());
        self
    }

    /// Finish this plan and return to the registry builder.
    #[must_use]
    pub fn done(self) -> PlanRegistryBuilder {
        self.parent.add(self.plan)
    }
}
