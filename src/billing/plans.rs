//! Plan catalog.
//!
//! Static definitions of each plan tier: token allowance, minute allotment,
//! validity windows, processor price references and redemption-code prefixes.
//!
//! ```rust,ignore
//! use tidemark::billing::{PlanCatalog, PlanId, MinuteAllotment, CodeWindow};
//!
//! let catalog = PlanCatalog::builder()
//!     .plan(PlanId::Free)
//!         .tokens(10)
//!         .minutes(MinuteAllotment::Bounded(15))
//!         .done()
//!     .plan(PlanId::Pro)
//!         .tokens(100)
//!         .minutes(MinuteAllotment::Bounded(180))
//!         .paid_period_days(30)
//!         .code_window(CodeWindow::Months(2))
//!         .code_prefix("SKP")
//!         .price_ref("price_pro_monthly")
//!         .metered()
//!         .done()
//!     .build();
//! ```

use std::collections::HashMap;

use super::entitlement::{PlanId, UNLIMITED_MINUTES};
use super::error::{BillingError, Result};

/// Minutes granted by a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinuteAllotment {
    Bounded(u32),
    Unlimited,
}

impl MinuteAllotment {
    /// The value stored in `minutes_left` when this allotment is granted fresh.
    #[must_use]
    pub fn as_minutes_left(self) -> i64 {
        match self {
            Self::Bounded(minutes) => i64::from(minutes),
            Self::Unlimited => UNLIMITED_MINUTES,
        }
    }

    #[must_use]
    pub fn is_unlimited(self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

/// Validity window opened when a plan is granted through a redemption code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeWindow {
    /// A fixed number of calendar months from redemption.
    Months(u32),
    /// The window ends when the code itself would have expired.
    CodeExpiry,
}

/// Definition of a single plan tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanConfig {
    pub id: PlanId,
    pub display_name: String,
    pub tokens: u32,
    pub minutes: MinuteAllotment,
    /// Length of a paid period. `None` for plans with no validity window.
    pub paid_period_days: Option<u32>,
    /// How a code-issued grant sets its window. `None` if codes cannot issue this plan.
    pub code_window: Option<CodeWindow>,
    /// Processor price reference used at checkout.
    pub price_ref: Option<String>,
    /// Prefix of redemption codes issuing this plan.
    pub code_prefix: Option<String>,
    /// Eligible for mid-period top-ups once the balance is exhausted.
    pub metered: bool,
    /// Refused at checkout unless explicitly allowed.
    pub non_production: bool,
}

impl PlanConfig {
    /// Whether this plan can be bought through the payment processor.
    #[must_use]
    pub fn is_purchasable(&self) -> bool {
        self.price_ref.is_some() && self.paid_period_days.is_some()
    }

    /// Whether redemption codes may issue this plan.
    #[must_use]
    pub fn is_redeemable(&self) -> bool {
        self.code_window.is_some()
    }
}

/// Lookup table of plan definitions.
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    plans: HashMap<PlanId, PlanConfig>,
}

impl PlanCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> PlanCatalogBuilder {
        PlanCatalogBuilder::new()
    }

    /// The stock catalog: free, pro, pro+, enterprise and a non-production test tier.
    ///
    /// The free tier is the single baseline for new accounts and for accounts
    /// whose subscription ends: 10 tokens and 15 minutes in both cases.
    #[must_use]
    pub fn standard() -> Self {
        Self::builder()
            .plan(PlanId::Free)
                .display_name("Free")
                .tokens(10)
                .minutes(MinuteAllotment::Bounded(15))
                .done()
            .plan(PlanId::Pro)
                .display_name("Pro")
                .tokens(100)
                .minutes(MinuteAllotment::Bounded(180))
                .paid_period_days(30)
                .code_window(CodeWindow::Months(2))
                .code_prefix("SKP")
                .price_ref("price_pro_monthly")
                .metered()
                .done()
            .plan(PlanId::ProPlus)
                .display_name("Pro+")
                .tokens(1000)
                .minutes(MinuteAllotment::Unlimited)
                .paid_period_days(30)
                .code_window(CodeWindow::CodeExpiry)
                .code_prefix("SKPP")
                .price_ref("price_proplus_monthly")
                .done()
            .plan(PlanId::Enterprise)
                .display_name("Enterprise")
                .tokens(1000)
                .minutes(MinuteAllotment::Unlimited)
                .paid_period_days(30)
                .done()
            .plan(PlanId::Test)
                .display_name("Test")
                .tokens(10)
                .minutes(MinuteAllotment::Bounded(10))
                .paid_period_days(7)
                .price_ref("price_test")
                .non_production()
                .done()
            .build()
    }

    /// Add or replace a plan definition.
    pub fn add(&mut self, config: PlanConfig) {
        self.plans.insert(config.id, config);
    }

    /// Point a plan at a different processor price.
    pub fn set_price_ref(&mut self, plan: PlanId, price_ref: impl Into<String>) {
        if let Some(config) = self.plans.get_mut(&plan) {
            config.price_ref = Some(price_ref.into());
        }
    }

    #[must_use]
    pub fn get(&self, plan: PlanId) -> Option<&PlanConfig> {
        self.plans.get(&plan)
    }

    /// Get a plan, failing with `UnknownPlan` if it is not in the catalog.
    pub fn require(&self, plan: PlanId) -> Result<&PlanConfig> {
        self.get(plan).ok_or_else(|| BillingError::UnknownPlan {
            reference: plan.to_string(),
        })
    }

    /// The plan accounts fall back to on cancellation.
    pub fn free_tier(&self) -> Result<&PlanConfig> {
        self.require(PlanId::Free)
    }

    /// Find the plan a processor price reference belongs to.
    #[must_use]
    pub fn find_by_price_ref(&self, price_ref: &str) -> Option<&PlanConfig> {
        self.plans
            .values()
            .find(|p| p.price_ref.as_deref() == Some(price_ref))
    }

    /// Find the plan issued by codes with this prefix.
    #[must_use]
    pub fn find_by_code_prefix(&self, prefix: &str) -> Option<&PlanConfig> {
        self.plans
            .values()
            .find(|p| p.code_prefix.as_deref() == Some(prefix))
    }

    /// All configured code prefixes.
    pub fn code_prefixes(&self) -> impl Iterator<Item = &str> {
        self.plans.values().filter_map(|p| p.code_prefix.as_deref())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlanConfig> {
        self.plans.values()
    }
}

/// Builder for a [`PlanCatalog`].
#[derive(Debug, Default)]
pub struct PlanCatalogBuilder {
    plans: HashMap<PlanId, PlanConfig>,
}

impl PlanCatalogBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start defining a plan.
    #[must_use]
    pub fn plan(self, id: PlanId) -> PlanBuilder {
        PlanBuilder {
            parent: self,
            config: PlanConfig {
                id,
                display_name: id.as_str().to_string(),
                tokens: 0,
                minutes: MinuteAllotment::Bounded(0),
                paid_period_days: None,
                code_window: None,
                price_ref: None,
                code_prefix: None,
                metered: false,
                non_production: false,
            },
        }
    }

    #[must_use]
    pub fn build(self) -> PlanCatalog {
        PlanCatalog { plans: self.plans }
    }

    fn add_plan(mut self, config: PlanConfig) -> Self {
        self.plans.insert(config.id, config);
        self
    }
}

/// Builder for a single plan definition.
#[derive(Debug)]
pub struct PlanBuilder {
    parent: PlanCatalogBuilder,
    config: PlanConfig,
}

impl PlanBuilder {
    #[must_use]
    pub fn display_name(mut self, name: &str) -> Self {
        self.config.display_name = name.to_string();
        self
    }

    #[must_use]
    pub fn tokens(mut self, tokens: u32) -> Self {
        self.config.tokens = tokens;
        self
    }

    #[must_use]
    pub fn minutes(mut self, minutes: MinuteAllotment) -> Self {
        self.config.minutes = minutes;
        self
    }

    #[must_use]
    pub fn paid_period_days(mut self, days: u32) -> Self {
        self.config.paid_period_days = Some(days);
        self
    }

    #[must_use]
    pub fn code_window(mut self, window: CodeWindow) -> Self {
        self.config.code_window = Some(window);
        self
    }

    /// Set the code prefix. Stored uppercase.
    #[must_use]
    pub fn code_prefix(mut self, prefix: &str) -> Self {
        self.config.code_prefix = Some(prefix.to_ascii_uppercase());
        self
    }

    #[must_use]
    pub fn price_ref(mut self, price_ref: &str) -> Self {
        self.config.price_ref = Some(price_ref.to_string());
        self
    }

    /// Allow top-ups when the balance runs out mid-period.
    #[must_use]
    pub fn metered(mut self) -> Self {
        self.config.metered = true;
        self
    }

    #[must_use]
    pub fn non_production(mut self) -> Self {
        self.config.non_production = true;
        self
    }

    /// Finish this plan and return to the catalog builder.
    #[must_use]
    pub fn done(self) -> PlanCatalogBuilder {
        self.parent.add_plan(self.config)
    }
}
