//! Grant policy.
//!
//! The single place that decides whether a new grant stacks onto the current
//! balance or resets it. Every causal path (checkout, manual verification,
//! renewals, plan changes, code redemption, top-ups) goes through
//! [`apply_grant`]; subscription endings go through [`apply_cancellation`].
//!
//! Both functions are pure: they take the current entitlement and return the
//! next one without touching storage.

use chrono::{DateTime, Duration, Months, Utc};

use super::entitlement::{Entitlement, EntitlementStatus, UNLIMITED_MINUTES};
use super::error::{BillingError, Result};
use super::plans::{CodeWindow, MinuteAllotment, PlanConfig};

/// What kind of grant is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantKind {
    /// A purchase or plan change. Resets open a paid period ending at
    /// `period_end` when the processor supplies one.
    Purchase { period_end: Option<DateTime<Utc>> },
    /// A periodic renewal. May push an open window further out.
    Renewal { period_end: Option<DateTime<Utc>> },
    /// A redemption code grant.
    Code { code_expires_at: DateTime<Utc> },
    /// A metered top-up inside an open window.
    TopUp,
}

impl GrantKind {
    fn extends_window(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Renewal { period_end } => *period_end,
            _ => None,
        }
    }
}

/// Apply a minute-granting event to `current` for `plan`.
///
/// - Unlimited plans set `minutes_left` to the sentinel and never stack.
/// - Same plan with an open window stacks the allotment onto the balance,
///   or resets to the allotment when the balance is exhausted.
/// - Anything else resets plan, tokens and minutes and opens a new window.
///
/// The grant always reactivates the entitlement and refreshes tokens.
pub fn apply_grant(
    current: &Entitlement,
    plan: &PlanConfig,
    kind: GrantKind,
    now: DateTime<Utc>,
) -> Result<Entitlement> {
    let mut next = current.clone();
    next.status = EntitlementStatus::Active;
    next.tokens = plan.tokens;

    let continuing = current.plan == plan.id
        && current.status != EntitlementStatus::Cancelled
        && current.window_open(now);

    if continuing {
        next.minutes_left = match plan.minutes {
            MinuteAllotment::Unlimited => UNLIMITED_MINUTES,
            MinuteAllotment::Bounded(allotment) if current.minutes_left > 0 => {
                current.minutes_left.saturating_add(i64::from(allotment))
            }
            MinuteAllotment::Bounded(allotment) => i64::from(allotment),
        };

        if let Some(period_end) = kind.extends_window() {
            if next.end_date.is_none_or(|end| period_end > end) {
                next.end_date = Some(period_end);
            }
        }
        return Ok(next);
    }

    next.plan = plan.id;
    next.minutes_left = plan.minutes.as_minutes_left();

    // A top-up never opens a window; callers only reach here with one open.
    if kind != GrantKind::TopUp {
        next.start_date = now;
        next.end_date = window_end(plan, kind, now)?;
    }

    Ok(next)
}

/// Return `current` to the free tier after its subscription ended.
///
/// The customer reference is kept so a later purchase reuses it. An account
/// already cancelled onto the free tier is returned unchanged, so free-tier
/// consumption since the first cancellation is preserved.
#[must_use]
pub fn apply_cancellation(
    current: &Entitlement,
    free_tier: &PlanConfig,
    now: DateTime<Utc>,
) -> Entitlement {
    if current.plan == free_tier.id
        && current.status == EntitlementStatus::Cancelled
        && current.external_subscription_ref.is_none()
        && current.end_date.is_none()
    {
        return current.clone();
    }

    Entitlement {
        plan: free_tier.id,
        status: EntitlementStatus::Cancelled,
        start_date: now,
        end_date: None,
        tokens: free_tier.tokens,
        minutes_left: free_tier.minutes.as_minutes_left(),
        external_customer_ref: current.external_customer_ref.clone(),
        external_subscription_ref: None,
    }
}

fn window_end(
    plan: &PlanConfig,
    kind: GrantKind,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match kind {
        GrantKind::Code { code_expires_at } => match plan.code_window {
            Some(CodeWindow::Months(months)) => now
                .checked_add_months(Months::new(months))
                .map(Some)
                .ok_or_else(|| BillingError::validation("code_window", "window end out of range")),
            Some(CodeWindow::CodeExpiry) => Ok(Some(code_expires_at.max(now))),
            None => Err(BillingError::validation(
                "plan",
                format!("plan {} cannot be issued by codes", plan.id),
            )),
        },
        GrantKind::Purchase { period_end } | GrantKind::Renewal { period_end } => {
            if let Some(end) = period_end.filter(|end| *end > now) {
                return Ok(Some(end));
            }
            Ok(plan
                .paid_period_days
                .map(|days| now + Duration::days(i64::from(days))))
        }
        GrantKind::TopUp => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::entitlement::PlanId;
    use crate::billing::plans::PlanCatalog;

    fn pro_with(minutes_left: i64, end_in_days: i64, now: DateTime<Utc>) -> Entitlement {
        Entitlement {
            plan: PlanId::Pro,
            status: EntitlementStatus::Active,
            start_date: now - Duration::days(10),
            end_date: Some(now + Duration::days(end_in_days)),
            tokens: 100,
            minutes_left,
            external_customer_ref: Some("cus_1".to_string()),
            external_subscription_ref: Some("sub_1".to_string()),
        }
    }

    #[test]
    fn test_stack_onto_open_window() {
        let catalog = PlanCatalog::standard();
        let now = Utc::now();
        let current = pro_with(50, 5, now);

        let next = apply_grant(
            &current,
            catalog.get(PlanId::Pro).unwrap(),
            GrantKind::Purchase { period_end: None },
            now,
        )
        .unwrap();

        assert_eq!(next.minutes_left, 230);
        assert_eq!(next.end_date, current.end_date);
        assert_eq!(next.start_date, current.start_date);
    }

    #[test]
    fn test_exhausted_balance_resets_instead_of_stacking() {
        let catalog = PlanCatalog::standard();
        let now = Utc::now();
        let mut current = pro_with(0, 5, now);
        current.status = EntitlementStatus::Inactive;

        let next = apply_grant(
            &current,
            catalog.get(PlanId::Pro).unwrap(),
            GrantKind::Renewal { period_end: None },
            now,
        )
        .unwrap();

        assert_eq!(next.minutes_left, 180);
        assert_eq!(next.status, EntitlementStatus::Active);
    }

    #[test]
    fn test_renewal_extends_but_never_shortens_window() {
        let catalog = PlanCatalog::standard();
        let now = Utc::now();
        let current = pro_with(20, 5, now);
        let pro = catalog.get(PlanId::Pro).unwrap();

        let later = now + Duration::days(35);
        let next = apply_grant(&current, pro, GrantKind::Renewal { period_end: Some(later) }, now).unwrap();
        assert_eq!(next.end_date, Some(later));

        let earlier = now + Duration::days(1);
        let next = apply_grant(&current, pro, GrantKind::Renewal { period_end: Some(earlier) }, now).unwrap();
        assert_eq!(next.end_date, current.end_date);
    }

    #[test]
    fn test_expired_window_resets() {
        let catalog = PlanCatalog::standard();
        let now = Utc::now();
        let current = pro_with(70, -1, now);

        let next = apply_grant(
            &current,
            catalog.get(PlanId::Pro).unwrap(),
            GrantKind::Purchase { period_end: None },
            now,
        )
        .unwrap();

        assert_eq!(next.minutes_left, 180);
        assert_eq!(next.start_date, now);
        assert_eq!(next.end_date, Some(now + Duration::days(30)));
    }

    #[test]
    fn test_unlimited_never_stacks() {
        let catalog = PlanCatalog::standard();
        let now = Utc::now();
        let current = pro_with(50, 5, now);

        let next = apply_grant(
            &current,
            catalog.get(PlanId::ProPlus).unwrap(),
            GrantKind::Purchase { period_end: None },
            now,
        )
        .unwrap();

        assert_eq!(next.plan, PlanId::ProPlus);
        assert_eq!(next.minutes_left, UNLIMITED_MINUTES);
        assert_eq!(next.tokens, 1000);
        assert!(next.is_unlimited());
    }

    #[test]
    fn test_code_window_months() {
        let catalog = PlanCatalog::standard();
        let now = Utc::now();
        let free = Entitlement::baseline(catalog.free_tier().unwrap(), now);

        let next = apply_grant(
            &free,
            catalog.get(PlanId::Pro).unwrap(),
            GrantKind::Code { code_expires_at: now + Duration::days(30) },
            now,
        )
        .unwrap();

        assert_eq!(next.plan, PlanId::Pro);
        assert_eq!(next.minutes_left, 180);
        assert_eq!(next.tokens, 100);
        assert_eq!(next.end_date, now.checked_add_months(Months::new(2)));
    }

    #[test]
    fn test_code_window_follows_code_expiry() {
        let catalog = PlanCatalog::standard();
        let now = Utc::now();
        let free = Entitlement::baseline(catalog.free_tier().unwrap(), now);
        let expires = now + Duration::days(12);

        let next = apply_grant(
            &free,
            catalog.get(PlanId::ProPlus).unwrap(),
            GrantKind::Code { code_expires_at: expires },
            now,
        )
        .unwrap();

        assert_eq!(next.end_date, Some(expires));
    }

    #[test]
    fn test_processor_period_end_used_for_new_window() {
        let catalog = PlanCatalog::standard();
        let now = Utc::now();
        let free = Entitlement::baseline(catalog.free_tier().unwrap(), now);
        let period_end = now + Duration::days(31);

        let next = apply_grant(
            &free,
            catalog.get(PlanId::Pro).unwrap(),
            GrantKind::Purchase { period_end: Some(period_end) },
            now,
        )
        .unwrap();

        assert_eq!(next.end_date, Some(period_end));
    }

    #[test]
    fn test_cancellation_keeps_customer_ref() {
        let catalog = PlanCatalog::standard();
        let now = Utc::now();
        let current = pro_with(50, 5, now);

        let next = apply_cancellation(&current, catalog.free_tier().unwrap(), now);

        assert_eq!(next.plan, PlanId::Free);
        assert_eq!(next.status, EntitlementStatus::Cancelled);
        assert_eq!(next.minutes_left, 15);
        assert_eq!(next.tokens, 10);
        assert!(next.end_date.is_none());
        assert!(next.external_subscription_ref.is_none());
        assert_eq!(next.external_customer_ref.as_deref(), Some("cus_1"));
    }

    #[test]
    fn test_cancellation_is_stable_once_applied() {
        let catalog = PlanCatalog::standard();
        let now = Utc::now();
        let free = catalog.free_tier().unwrap();
        let mut cancelled = apply_cancellation(&pro_with(50, 5, now), free, now);
        cancelled.minutes_left = 4;

        let again = apply_cancellation(&cancelled, free, now + Duration::hours(1));
        assert_eq!(again, cancelled);
    }
}
