//! Causal events.
//!
//! Every entitlement change originates from one of these: a processor
//! webhook, a client-driven checkout verification, or a code redemption.
//! Each event carries the identifier used to deduplicate it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entitlement::PlanId;

/// Identifiers an event offers for locating the affected account.
///
/// Resolution tries them in order: account id, customer ref, email.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRef {
    pub account_id: Option<String>,
    pub customer_ref: Option<String>,
    pub email: Option<String>,
}

impl AccountRef {
    #[must_use]
    pub fn by_id(account_id: impl Into<String>) -> Self {
        Self {
            account_id: Some(account_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn by_customer(customer_ref: impl Into<String>) -> Self {
        Self {
            customer_ref: Some(customer_ref.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_customer(mut self, customer_ref: Option<String>) -> Self {
        if customer_ref.is_some() {
            self.customer_ref = customer_ref;
        }
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: Option<String>) -> Self {
        if email.is_some() {
            self.email = email;
        }
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.account_id.is_none() && self.customer_ref.is_none() && self.email.is_none()
    }
}

/// How an event names the plan it grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanRef {
    Named(PlanId),
    /// A processor price reference, looked up in the catalog.
    Price(String),
    Unspecified,
}

impl PlanRef {
    /// Prefer an explicit plan name, fall back to a price reference.
    #[must_use]
    pub fn from_parts(plan: Option<&str>, price_ref: Option<&str>) -> Self {
        if let Some(plan) = plan.and_then(|p| p.parse::<PlanId>().ok()) {
            return Self::Named(plan);
        }
        match price_ref {
            Some(price) => Self::Price(price.to_string()),
            None => Self::Unspecified,
        }
    }
}

/// Processor-side subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Paused,
    Unpaid,
}

impl SubscriptionStatus {
    /// Parse a Stripe subscription status string.
    ///
    /// Unrecognized statuses map to `Incomplete`, which never changes entitlements.
    #[must_use]
    pub fn from_stripe(status: &str) -> Self {
        match status {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "canceled" => Self::Canceled,
            "incomplete_expired" => Self::IncompleteExpired,
            "paused" => Self::Paused,
            "unpaid" => Self::Unpaid,
            _ => Self::Incomplete,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Paused => "paused",
            Self::Unpaid => "unpaid",
        }
    }

    /// The subscription entitles the account to its plan.
    #[must_use]
    pub fn grants_access(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    /// The subscription is over and will not recover.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::IncompleteExpired)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why the processor issued an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingReason {
    SubscriptionCreate,
    SubscriptionCycle,
    SubscriptionUpdate,
    Manual,
    Other,
}

impl BillingReason {
    #[must_use]
    pub fn from_stripe(reason: &str) -> Self {
        match reason {
            "subscription_create" => Self::SubscriptionCreate,
            "subscription_cycle" => Self::SubscriptionCycle,
            "subscription_update" => Self::SubscriptionUpdate,
            "manual" => Self::Manual,
            _ => Self::Other,
        }
    }

    /// A periodic renewal of an existing subscription.
    #[must_use]
    pub fn is_renewal(&self) -> bool {
        matches!(self, Self::SubscriptionCycle)
    }
}

/// A paid checkout session completed at the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutCompleted {
    pub event_id: String,
    pub session_id: String,
    pub account: AccountRef,
    pub plan: PlanRef,
    pub subscription_ref: Option<String>,
    /// False for async payment methods still settling.
    pub paid: bool,
}

/// The processor changed a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpdated {
    pub event_id: String,
    pub subscription_ref: String,
    pub account: AccountRef,
    pub plan: PlanRef,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<DateTime<Utc>>,
}

/// The processor ended a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDeleted {
    pub event_id: String,
    pub subscription_ref: String,
    pub account: AccountRef,
}

/// An invoice was paid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoicePaid {
    pub event_id: String,
    pub invoice_id: String,
    pub account: AccountRef,
    pub plan: PlanRef,
    pub subscription_ref: Option<String>,
    pub billing_reason: BillingReason,
    pub period_end: Option<DateTime<Utc>>,
}

/// An invoice payment attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceFailed {
    pub event_id: String,
    pub invoice_id: String,
    pub account: AccountRef,
    pub subscription_ref: Option<String>,
    pub attempt_count: u32,
}

/// A redemption code is being applied to an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRedeemed {
    /// Normalized code string.
    pub code: String,
    pub account_id: String,
    pub plan: PlanId,
    pub code_expires_at: DateTime<Utc>,
}

/// The client asked us to confirm a checkout session directly with the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualVerify {
    pub session_id: String,
    pub account_id: String,
    pub plan: PlanRef,
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
}

/// Any event that may change an entitlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CausalEvent {
    CheckoutCompleted(CheckoutCompleted),
    SubscriptionUpdated(SubscriptionUpdated),
    SubscriptionDeleted(SubscriptionDeleted),
    InvoicePaid(InvoicePaid),
    InvoiceFailed(InvoiceFailed),
    CodeRedeemed(CodeRedeemed),
    ManualVerify(ManualVerify),
}

impl CausalEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CheckoutCompleted(_) => "checkout_completed",
            Self::SubscriptionUpdated(_) => "subscription_updated",
            Self::SubscriptionDeleted(_) => "subscription_deleted",
            Self::InvoicePaid(_) => "invoice_paid",
            Self::InvoiceFailed(_) => "invoice_failed",
            Self::CodeRedeemed(_) => "code_redeemed",
            Self::ManualVerify(_) => "manual_verify",
        }
    }

    /// Key under which the effect of this event is recorded.
    ///
    /// A webhook checkout and a manual verification of the same session share
    /// a key, so whichever lands second is a no-op. Paid invoices are keyed
    /// by invoice, since the processor reports one payment under more than
    /// one event type.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        match self {
            Self::CheckoutCompleted(e) => checkout_key(&e.session_id),
            Self::ManualVerify(e) => checkout_key(&e.session_id),
            Self::CodeRedeemed(e) => redemption_key(&e.code),
            Self::SubscriptionUpdated(e) => event_key(&e.event_id),
            Self::SubscriptionDeleted(e) => event_key(&e.event_id),
            Self::InvoicePaid(e) => invoice_key(&e.invoice_id),
            Self::InvoiceFailed(e) => event_key(&e.event_id),
        }
    }

    #[must_use]
    pub fn account_ref(&self) -> AccountRef {
        match self {
            Self::CheckoutCompleted(e) => e.account.clone(),
            Self::SubscriptionUpdated(e) => e.account.clone(),
            Self::SubscriptionDeleted(e) => e.account.clone(),
            Self::InvoicePaid(e) => e.account.clone(),
            Self::InvoiceFailed(e) => e.account.clone(),
            Self::CodeRedeemed(e) => AccountRef::by_id(&e.account_id),
            Self::ManualVerify(e) => {
                AccountRef::by_id(&e.account_id).with_customer(e.customer_ref.clone())
            }
        }
    }
}

fn checkout_key(session_id: &str) -> String {
    format!("checkout:{}", session_id)
}

fn event_key(event_id: &str) -> String {
    format!("event:{}", event_id)
}

fn invoice_key(invoice_id: &str) -> String {
    format!("invoice:{}", invoice_id)
}

pub(crate) fn redemption_key(code: &str) -> String {
    format!("code:{}", code)
}
