//! Account and entitlement state.
//!
//! An [`Account`] is the unit of serialization: the entitlement, the usage
//! counters and the optimistic-locking version all change together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::{BillingError, Result};
use super::plans::PlanConfig;

/// Sentinel stored in `minutes_left` for unlimited plans.
pub const UNLIMITED_MINUTES: i64 = -1;

/// Plan tiers known to the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlanId {
    #[serde(rename = "free")]
    Free,
    #[serde(rename = "pro")]
    Pro,
    #[serde(rename = "pro+")]
    ProPlus,
    #[serde(rename = "enterprise")]
    Enterprise,
    /// Short-window plan for exercising the purchase flow outside production.
    #[serde(rename = "test")]
    Test,
}

impl PlanId {
    pub const ALL: [PlanId; 5] = [
        PlanId::Free,
        PlanId::Pro,
        PlanId::ProPlus,
        PlanId::Enterprise,
        PlanId::Test,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::ProPlus => "pro+",
            Self::Enterprise => "enterprise",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanId {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "pro+" | "pro_plus" | "proplus" => Ok(Self::ProPlus),
            "enterprise" => Ok(Self::Enterprise),
            "test" => Ok(Self::Test),
            _ => Err(BillingError::UnknownPlan {
                reference: s.to_string(),
            }),
        }
    }
}

/// Entitlement lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    /// The account may consume its allotment.
    Active,
    /// The balance is exhausted or payment lapsed.
    Inactive,
    /// The paid subscription ended.
    Cancelled,
}

impl EntitlementStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// The per-account grant of service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub plan: PlanId,
    pub status: EntitlementStatus,
    pub start_date: DateTime<Utc>,
    /// End of the paid validity window. `None` means no window (free tier).
    pub end_date: Option<DateTime<Utc>>,
    pub tokens: u32,
    /// Remaining minutes, or [`UNLIMITED_MINUTES`].
    pub minutes_left: i64,
    pub external_customer_ref: Option<String>,
    pub external_subscription_ref: Option<String>,
}

impl Entitlement {
    /// Baseline entitlement for a plan, with no window and no processor refs.
    #[must_use]
    pub fn baseline(plan: &PlanConfig, now: DateTime<Utc>) -> Self {
        Self {
            plan: plan.id,
            status: EntitlementStatus::Active,
            start_date: now,
            end_date: None,
            tokens: plan.tokens,
            minutes_left: plan.minutes.as_minutes_left(),
            external_customer_ref: None,
            external_subscription_ref: None,
        }
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.minutes_left == UNLIMITED_MINUTES
    }

    /// Whether the paid validity window is still open at `now`.
    #[must_use]
    pub fn window_open(&self, now: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end| now < end)
    }
}

/// Usage counters carried alongside the entitlement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub sessions_completed: u64,
    pub total_minutes_used: u64,
    pub last_session_at: Option<DateTime<Utc>>,
}

/// The account aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub entitlement: Entitlement,
    pub usage: UsageStats,
    /// Bumped on every write, used for compare-and-save.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// A fresh account on the given (normally free) plan.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        email: impl Into<String>,
        plan: &PlanConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            entitlement: Entitlement::baseline(plan, now),
            usage: UsageStats::default(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy of this account carrying `entitlement`, stamped for the next version.
    #[must_use]
    pub(crate) fn next_version(&self, entitlement: Entitlement, now: DateTime<Utc>) -> Self {
        Self {
            entitlement,
            version: self.version + 1,
            updated_at: now,
            ..self.clone()
        }
    }
}
