//! Usage metering.
//!
//! Decrements minute balances as sessions complete and grants metered
//! top-ups. Writes go through the engine's compare-and-save loop, so a
//! consume racing a grant on the same account never loses either update.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::audit::{BillingAuditEvent, BillingAuditLogger, TracingAuditLogger};
use super::entitlement::{Entitlement, EntitlementStatus, PlanId, UsageStats};
use super::error::{BillingError, Result, TopUpRejection};
use super::grant::{GrantKind, apply_grant};
use super::reconcile::ReconciliationEngine;
use super::storage::AccountStore;
use super::validation::validate_seconds;

/// Result of recording a finished session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumeOutcome {
    /// Whole minutes charged, rounded up.
    pub consumed_minutes: u64,
    pub is_unlimited: bool,
    /// The balance reached zero with this session.
    pub exhausted: bool,
    pub entitlement: Entitlement,
}

/// Snapshot of an account's balance and usage counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub account_id: String,
    pub plan: PlanId,
    pub status: EntitlementStatus,
    pub minutes_left: i64,
    pub is_unlimited: bool,
    pub tokens: u32,
    pub end_date: Option<DateTime<Utc>>,
    pub usage: UsageStats,
}

/// Charge sessions against an account's minute balance.
pub struct UsageMeter<S: AccountStore, A: BillingAuditLogger = TracingAuditLogger> {
    engine: Arc<ReconciliationEngine<S, A>>,
}

impl<S: AccountStore, A: BillingAuditLogger> UsageMeter<S, A> {
    #[must_use]
    pub fn new(engine: Arc<ReconciliationEngine<S, A>>) -> Self {
        Self { engine }
    }

    /// Record a session of `seconds` length.
    ///
    /// Minutes are rounded up. Unlimited balances only update the counters.
    /// A bounded balance is clamped at zero, and hitting zero from a positive
    /// balance marks the entitlement inactive.
    pub async fn consume(&self, account_id: &str, seconds: f64) -> Result<ConsumeOutcome> {
        validate_seconds(seconds)?;
        // Saturating float-to-int cast.
        let consumed_minutes = (seconds / 60.0).ceil() as u64;

        if consumed_minutes == 0 {
            let account = self.engine.get_account(account_id).await?;
            return Ok(ConsumeOutcome {
                consumed_minutes,
                is_unlimited: account.entitlement.is_unlimited(),
                exhausted: false,
                entitlement: account.entitlement,
            });
        }

        let charge = i64::try_from(consumed_minutes).unwrap_or(i64::MAX);
        let (account, exhausted) = self
            .engine
            .modify_account(account_id, |account, now| {
                let ent = &mut account.entitlement;
                let mut exhausted = false;
                if !ent.is_unlimited() {
                    let before = ent.minutes_left;
                    ent.minutes_left = before.saturating_sub(charge).max(0);
                    if before > 0 && ent.minutes_left == 0 {
                        ent.status = EntitlementStatus::Inactive;
                        exhausted = true;
                    }
                }

                let usage = &mut account.usage;
                usage.sessions_completed = usage.sessions_completed.saturating_add(1);
                usage.total_minutes_used = usage.total_minutes_used.saturating_add(consumed_minutes);
                usage.last_session_at = Some(now);
                Ok(exhausted)
            })
            .await?;

        tracing::debug!(
            account_id = %account_id,
            consumed_minutes,
            minutes_left = account.entitlement.minutes_left,
            "usage recorded"
        );

        if exhausted {
            tracing::info!(account_id = %account_id, plan = %account.entitlement.plan, "minute balance exhausted");
            self.engine
                .audit()
                .log(BillingAuditEvent::BalanceExhausted {
                    account_id: account_id.to_string(),
                    plan: account.entitlement.plan,
                })
                .await;
        }

        Ok(ConsumeOutcome {
            consumed_minutes,
            is_unlimited: account.entitlement.is_unlimited(),
            exhausted,
            entitlement: account.entitlement,
        })
    }

    /// Grant one allotment to an exhausted metered account.
    ///
    /// Requires a metered plan, an open paid window and a balance of exactly
    /// zero. The first failing check is reported.
    pub async fn top_up(&self, account_id: &str) -> Result<Entitlement> {
        let catalog = self.engine.catalog();
        let (account, ()) = self
            .engine
            .modify_account(account_id, |account, now| {
                let current = account.entitlement.clone();
                let plan = catalog.require(current.plan)?;

                if !plan.metered {
                    return Err(BillingError::TopUpRejected {
                        reason: TopUpRejection::NotEligible,
                    });
                }
                if !current.window_open(now) {
                    return Err(BillingError::TopUpRejected {
                        reason: TopUpRejection::PeriodEnded,
                    });
                }
                if current.minutes_left != 0 {
                    return Err(BillingError::TopUpRejected {
                        reason: TopUpRejection::MinutesRemaining,
                    });
                }

                account.entitlement = apply_grant(&current, plan, GrantKind::TopUp, now)?;
                Ok(())
            })
            .await?;

        tracing::info!(
            account_id = %account_id,
            minutes_left = account.entitlement.minutes_left,
            "top-up granted"
        );
        self.engine
            .audit()
            .log(BillingAuditEvent::TopUpGranted {
                account_id: account_id.to_string(),
                minutes_left: account.entitlement.minutes_left,
            })
            .await;

        Ok(account.entitlement)
    }

    pub async fn summary(&self, account_id: &str) -> Result<UsageSummary> {
        let account = self.engine.get_account(account_id).await?;
        let ent = account.entitlement;
        Ok(UsageSummary {
            account_id: account.id,
            plan: ent.plan,
            status: ent.status,
            is_unlimited: ent.is_unlimited(),
            minutes_left: ent.minutes_left,
            tokens: ent.tokens,
            end_date: ent.end_date,
            usage: account.usage,
        })
    }
}
