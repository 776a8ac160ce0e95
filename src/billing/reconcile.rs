//! Reconciliation engine.
//!
//! Turns causal events into entitlement transitions. For each event the
//! engine resolves the account and plan, computes the next entitlement with
//! the shared grant policy and commits it together with the event's
//! idempotency key. Concurrent writers are handled with optimistic
//! compare-and-save and a bounded retry.

use chrono::{DateTime, Utc};

use super::audit::{BillingAuditEvent, BillingAuditLogger, TracingAuditLogger};
use super::entitlement::{Account, Entitlement, EntitlementStatus};
use super::error::{BillingError, Result};
use super::events::{AccountRef, CausalEvent, CodeRedeemed, PlanRef};
use super::grant::{GrantKind, apply_cancellation, apply_grant};
use super::plans::{PlanCatalog, PlanConfig};
use super::storage::{AccountStore, RedemptionCommit, SaveOutcome};
use super::validation::validate_account_id;

/// Default number of attempts for optimistic locking conflicts.
pub const MAX_RETRIES: u32 = 5;

/// What applying an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The entitlement changed.
    Applied {
        account_id: String,
        entitlement: Entitlement,
    },
    /// The event was recorded but left the entitlement as it was.
    Unchanged {
        account_id: String,
        entitlement: Entitlement,
    },
    /// The idempotency key was already recorded.
    AlreadyApplied { idempotency_key: String },
    /// The event cannot be applied yet and was not recorded.
    Deferred { reason: &'static str },
}

impl ReconcileOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Unchanged { .. } => "unchanged",
            Self::AlreadyApplied { .. } => "already_applied",
            Self::Deferred { .. } => "deferred",
        }
    }

    #[must_use]
    pub fn entitlement(&self) -> Option<&Entitlement> {
        match self {
            Self::Applied { entitlement, .. } | Self::Unchanged { entitlement, .. } => {
                Some(entitlement)
            }
            _ => None,
        }
    }
}

/// Applies causal events to account entitlements.
pub struct ReconciliationEngine<S: AccountStore, A: BillingAuditLogger = TracingAuditLogger> {
    store: S,
    catalog: PlanCatalog,
    audit: A,
    max_retries: u32,
}

impl<S: AccountStore> ReconciliationEngine<S> {
    /// Create an engine that audits through `tracing`.
    #[must_use]
    pub fn new(store: S, catalog: PlanCatalog) -> Self {
        Self {
            store,
            catalog,
            audit: TracingAuditLogger,
            max_retries: MAX_RETRIES,
        }
    }
}

impl<S: AccountStore, A: BillingAuditLogger> ReconciliationEngine<S, A> {
    /// Replace the audit logger.
    #[must_use]
    pub fn with_audit_logger<B: BillingAuditLogger>(self, audit: B) -> ReconciliationEngine<S, B> {
        ReconciliationEngine {
            store: self.store,
            catalog: self.catalog,
            audit,
            max_retries: self.max_retries,
        }
    }

    /// Override how many compare-and-save attempts a write gets.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub fn audit(&self) -> &A {
        &self.audit
    }

    /// Create an account on the free tier.
    pub async fn create_account(&self, account_id: &str, email: &str) -> Result<Account> {
        validate_account_id(account_id)?;
        let free = self.catalog.free_tier()?;
        let account = Account::new(account_id, email.trim(), free, Utc::now());
        self.store.create_account(&account).await?;

        tracing::info!(account_id = %account_id, plan = %free.id, "account created");
        Ok(account)
    }

    /// Load an account or fail with `NotFound`.
    pub async fn get_account(&self, account_id: &str) -> Result<Account> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or_else(|| BillingError::NotFound {
                resource: "account",
                id: account_id.to_string(),
            })
    }

    /// Locate the account an event refers to.
    ///
    /// Tries the account id, then the customer reference, then the email.
    pub async fn resolve_account(
        &self,
        event_kind: &'static str,
        reference: &AccountRef,
    ) -> Result<Account> {
        if let Some(id) = &reference.account_id {
            if let Some(account) = self.store.get_account(id).await? {
                return Ok(account);
            }
        }
        if let Some(customer_ref) = &reference.customer_ref {
            if let Some(account) = self.store.find_by_customer_ref(customer_ref).await? {
                return Ok(account);
            }
        }
        if let Some(email) = &reference.email {
            if let Some(account) = self.store.find_by_email(email.trim()).await? {
                return Ok(account);
            }
        }

        Err(BillingError::UserResolution {
            event_kind,
            detail: format!(
                "no account for id={}, customer={}, email_present={}",
                reference.account_id.as_deref().unwrap_or("-"),
                reference.customer_ref.as_deref().unwrap_or("-"),
                reference.email.is_some()
            ),
        })
    }

    /// Map a plan reference to a catalog entry.
    pub fn resolve_plan(&self, plan: &PlanRef) -> Result<&PlanConfig> {
        match plan {
            PlanRef::Named(id) => self.catalog.require(*id),
            PlanRef::Price(price_ref) => {
                self.catalog
                    .find_by_price_ref(price_ref)
                    .ok_or_else(|| BillingError::UnknownPlan {
                        reference: price_ref.clone(),
                    })
            }
            PlanRef::Unspecified => Err(BillingError::UnknownPlan {
                reference: "unspecified".to_string(),
            }),
        }
    }

    /// Apply a code redemption. The code's used flip is committed with the grant.
    pub async fn redeem(&self, event: CodeRedeemed) -> Result<ReconcileOutcome> {
        self.apply(&CausalEvent::CodeRedeemed(event)).await
    }

    /// Apply a causal event.
    ///
    /// Account and plan are resolved before anything is written; a failure
    /// there leaves both the account and the ledger untouched.
    pub async fn apply(&self, event: &CausalEvent) -> Result<ReconcileOutcome> {
        let kind = event.kind();
        let key = event.idempotency_key();

        if let CausalEvent::CheckoutCompleted(checkout) = event {
            if !checkout.paid {
                tracing::debug!(
                    session_id = %checkout.session_id,
                    "checkout completed without payment, deferring"
                );
                return Ok(ReconcileOutcome::Deferred {
                    reason: "payment_pending",
                });
            }
        }

        if self.store.is_event_processed(&key).await? {
            return Ok(self.already_applied(key).await);
        }

        let account = self.resolve_account(kind, &event.account_ref()).await?;
        let plan = self.resolve_event_plan(event)?;

        let mut account = account;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                account = self.get_account(&account.id).await?;
            }

            let now = Utc::now();
            let next = self.transition(event, &account.entitlement, plan, now)?;
            let updated = account.next_version(next, now);

            let saved = match event {
                CausalEvent::CodeRedeemed(redeemed) => {
                    match self
                        .store
                        .commit_redemption(&redeemed.code, &updated, account.version, now)
                        .await?
                    {
                        RedemptionCommit::Committed(_) => SaveOutcome::Saved,
                        RedemptionCommit::VersionConflict => SaveOutcome::VersionConflict,
                        RedemptionCommit::CodeAlreadyUsed => {
                            return Err(BillingError::AlreadyUsed {
                                code: redeemed.code.clone(),
                            });
                        }
                        RedemptionCommit::CodeNotFound => {
                            return Err(BillingError::NotFound {
                                resource: "code",
                                id: redeemed.code.clone(),
                            });
                        }
                    }
                }
                _ => {
                    self.store
                        .compare_and_save_account(&updated, account.version, Some(&key))
                        .await?
                }
            };

            match saved {
                SaveOutcome::Saved => {
                    return Ok(self.committed(event, &key, &account, updated).await);
                }
                SaveOutcome::AlreadyProcessed => return Ok(self.already_applied(key).await),
                SaveOutcome::VersionConflict => {
                    tracing::debug!(
                        account_id = %account.id,
                        attempt = attempt + 1,
                        event = kind,
                        "version conflict, retrying"
                    );
                }
            }
        }

        tracing::warn!(
            account_id = %account.id,
            event = kind,
            attempts = self.max_retries,
            "giving up after repeated version conflicts"
        );
        Err(BillingError::ConcurrentModification {
            account_id: account.id,
        })
    }

    /// Read-modify-write an account without a causal event key.
    ///
    /// `mutate` is re-run on a fresh copy after every conflict. If it leaves
    /// the account unchanged nothing is written.
    pub(crate) async fn modify_account<T, F>(
        &self,
        account_id: &str,
        mut mutate: F,
    ) -> Result<(Account, T)>
    where
        F: FnMut(&mut Account, DateTime<Utc>) -> Result<T> + Send,
        T: Send,
    {
        for attempt in 0..self.max_retries {
            let current = self.get_account(account_id).await?;
            let now = Utc::now();

            let mut next = current.clone();
            let value = mutate(&mut next, now)?;
            if next == current {
                return Ok((current, value));
            }
            next.version = current.version + 1;
            next.updated_at = now;

            match self
                .store
                .compare_and_save_account(&next, current.version, None)
                .await?
            {
                SaveOutcome::Saved => return Ok((next, value)),
                SaveOutcome::VersionConflict | SaveOutcome::AlreadyProcessed => {
                    tracing::debug!(
                        account_id = %account_id,
                        attempt = attempt + 1,
                        "version conflict, retrying"
                    );
                }
            }
        }

        Err(BillingError::ConcurrentModification {
            account_id: account_id.to_string(),
        })
    }

    /// Remember the processor customer for an account.
    pub async fn link_customer(&self, account_id: &str, customer_ref: &str) -> Result<Account> {
        let (account, linked) = self
            .modify_account(account_id, |account, _now| {
                let linked = account.entitlement.external_customer_ref.as_deref() != Some(customer_ref);
                account.entitlement.external_customer_ref = Some(customer_ref.to_string());
                Ok(linked)
            })
            .await?;

        if linked {
            self.audit
                .log(BillingAuditEvent::CustomerLinked {
                    account_id: account_id.to_string(),
                    customer_ref: customer_ref.to_string(),
                })
                .await;
        }
        Ok(account)
    }

    fn resolve_event_plan(&self, event: &CausalEvent) -> Result<Option<&PlanConfig>> {
        match event {
            CausalEvent::CheckoutCompleted(e) => self.resolve_plan(&e.plan).map(Some),
            CausalEvent::ManualVerify(e) => self.resolve_plan(&e.plan).map(Some),
            CausalEvent::CodeRedeemed(e) => self.catalog.require(e.plan).map(Some),
            CausalEvent::SubscriptionUpdated(e) if e.status.grants_access() => {
                self.resolve_plan(&e.plan).map(Some)
            }
            CausalEvent::InvoicePaid(e) if e.billing_reason.is_renewal() => {
                self.resolve_plan(&e.plan).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn transition(
        &self,
        event: &CausalEvent,
        current: &Entitlement,
        plan: Option<&PlanConfig>,
        now: DateTime<Utc>,
    ) -> Result<Entitlement> {
        match event {
            CausalEvent::CheckoutCompleted(e) => {
                let next = apply_grant(current, require(plan)?, GrantKind::Purchase { period_end: None }, now)?;
                Ok(with_refs(next, e.account.customer_ref.as_deref(), e.subscription_ref.as_deref()))
            }
            CausalEvent::ManualVerify(e) => {
                let next = apply_grant(current, require(plan)?, GrantKind::Purchase { period_end: None }, now)?;
                Ok(with_refs(next, e.customer_ref.as_deref(), e.subscription_ref.as_deref()))
            }
            CausalEvent::SubscriptionUpdated(e) => {
                if e.status.is_terminal() {
                    return self.cancel(current, &e.subscription_ref, now);
                }
                if !e.status.grants_access() {
                    return Ok(current.clone());
                }

                // Only subscriptions the account already tracks can change
                // its plan; a new subscription is granted by its checkout.
                if current.external_subscription_ref.as_deref() != Some(e.subscription_ref.as_str()) {
                    return Ok(current.clone());
                }

                let plan = require(plan)?;
                if current.plan != plan.id || current.status == EntitlementStatus::Cancelled {
                    let next = apply_grant(
                        current,
                        plan,
                        GrantKind::Purchase { period_end: e.current_period_end },
                        now,
                    )?;
                    return Ok(with_refs(next, e.account.customer_ref.as_deref(), None));
                }

                let mut next = current.clone();
                if let Some(period_end) = e.current_period_end {
                    if next.end_date.is_none_or(|end| period_end > end) {
                        next.end_date = Some(period_end);
                    }
                }
                Ok(next)
            }
            CausalEvent::SubscriptionDeleted(e) => self.cancel(current, &e.subscription_ref, now),
            CausalEvent::InvoicePaid(e) => match plan {
                // Invoices of an ended or replaced subscription never grant.
                Some(_) if e.subscription_ref.as_deref().is_some_and(|sub| {
                    current.external_subscription_ref.as_deref() != Some(sub)
                }) =>
                {
                    tracing::debug!(
                        invoice_id = %e.invoice_id,
                        "ignoring renewal of untracked subscription"
                    );
                    Ok(current.clone())
                }
                Some(plan) => {
                    let next = apply_grant(current, plan, GrantKind::Renewal { period_end: e.period_end }, now)?;
                    Ok(with_refs(next, e.account.customer_ref.as_deref(), e.subscription_ref.as_deref()))
                }
                None => Ok(current.clone()),
            },
            CausalEvent::InvoiceFailed(_) => Ok(current.clone()),
            CausalEvent::CodeRedeemed(e) => apply_grant(
                current,
                require(plan)?,
                GrantKind::Code { code_expires_at: e.code_expires_at },
                now,
            ),
        }
    }

    fn cancel(
        &self,
        current: &Entitlement,
        subscription_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<Entitlement> {
        // A late event for a subscription the account has since replaced.
        if current
            .external_subscription_ref
            .as_deref()
            .is_some_and(|tracked| tracked != subscription_ref)
        {
            tracing::debug!(
                subscription_ref = %subscription_ref,
                "ignoring end of untracked subscription"
            );
            return Ok(current.clone());
        }
        Ok(apply_cancellation(current, self.catalog.free_tier()?, now))
    }

    async fn committed(
        &self,
        event: &CausalEvent,
        key: &str,
        before: &Account,
        after: Account,
    ) -> ReconcileOutcome {
        let kind = event.kind();
        let changed = before.entitlement != after.entitlement;
        let ent = &after.entitlement;

        if changed {
            tracing::info!(
                account_id = %after.id,
                event = kind,
                idempotency_key = %key,
                plan = %ent.plan,
                status = ent.status.as_str(),
                minutes_left = ent.minutes_left,
                "entitlement updated"
            );
            let audit_event = if ent.status == EntitlementStatus::Cancelled
                && before.entitlement.status != EntitlementStatus::Cancelled
            {
                BillingAuditEvent::EntitlementCancelled {
                    account_id: after.id.clone(),
                    idempotency_key: key.to_string(),
                }
            } else {
                BillingAuditEvent::GrantApplied {
                    account_id: after.id.clone(),
                    event_kind: kind,
                    idempotency_key: key.to_string(),
                    plan: ent.plan,
                    minutes_left: ent.minutes_left,
                }
            };
            self.audit.log(audit_event).await;
        } else {
            tracing::info!(
                account_id = %after.id,
                event = kind,
                idempotency_key = %key,
                "event recorded without entitlement change"
            );
            self.audit
                .log(BillingAuditEvent::EventRecorded {
                    account_id: after.id.clone(),
                    event_kind: kind,
                    idempotency_key: key.to_string(),
                })
                .await;
        }

        if let CausalEvent::InvoiceFailed(failed) = event {
            self.audit
                .log(BillingAuditEvent::PaymentFailed {
                    account_id: after.id.clone(),
                    invoice_id: failed.invoice_id.clone(),
                    attempt_count: failed.attempt_count,
                })
                .await;
        }

        let account_id = after.id;
        let entitlement = after.entitlement;
        if changed {
            ReconcileOutcome::Applied { account_id, entitlement }
        } else {
            ReconcileOutcome::Unchanged { account_id, entitlement }
        }
    }

    async fn already_applied(&self, idempotency_key: String) -> ReconcileOutcome {
        tracing::debug!(idempotency_key = %idempotency_key, "event already applied, skipping");
        self.audit
            .log(BillingAuditEvent::EventAlreadyApplied {
                idempotency_key: idempotency_key.clone(),
            })
            .await;
        ReconcileOutcome::AlreadyApplied { idempotency_key }
    }
}

fn require(plan: Option<&PlanConfig>) -> Result<&PlanConfig> {
    plan.ok_or_else(|| BillingError::UnknownPlan {
        reference: "unspecified".to_string(),
    })
}

/// Record processor references carried by an event.
fn with_refs(
    mut next: Entitlement,
    customer_ref: Option<&str>,
    subscription_ref: Option<&str>,
) -> Entitlement {
    if let Some(customer_ref) = customer_ref {
        next.external_customer_ref = Some(customer_ref.to_string());
    }
    if let Some(subscription_ref) = subscription_ref {
        next.external_subscription_ref = Some(subscription_ref.to_string());
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::audit::test::RecordingAuditLogger;
    use crate::billing::entitlement::{PlanId, UNLIMITED_MINUTES};
    use crate::billing::events::{
        BillingReason, CheckoutCompleted, InvoiceFailed, InvoicePaid, ManualVerify,
        SubscriptionDeleted, SubscriptionStatus, SubscriptionUpdated,
    };
    use crate::billing::storage::MemoryAccountStore;
    use chrono::Duration;

    type TestEngine = ReconciliationEngine<MemoryAccountStore, RecordingAuditLogger>;

    async fn engine() -> (TestEngine, RecordingAuditLogger) {
        let audit = RecordingAuditLogger::new();
        let engine = ReconciliationEngine::new(MemoryAccountStore::new(), PlanCatalog::standard())
            .with_audit_logger(audit.clone());
        engine.create_account("user_1", "user1@example.com").await.unwrap();
        (engine, audit)
    }

    async fn put_pro(engine: &TestEngine, minutes_left: i64, end_in_days: i64) {
        let mut account = engine.get_account("user_1").await.unwrap();
        let now = Utc::now();
        account.entitlement = Entitlement {
            plan: PlanId::Pro,
            status: EntitlementStatus::Active,
            start_date: now - Duration::days(5),
            end_date: Some(now + Duration::days(end_in_days)),
            tokens: 100,
            minutes_left,
            external_customer_ref: Some("cus_1".to_string()),
            external_subscription_ref: Some("sub_1".to_string()),
        };
        engine.store().put_account(account).await;
    }

    fn checkout(event_id: &str, session_id: &str, plan: PlanId) -> CausalEvent {
        CausalEvent::CheckoutCompleted(CheckoutCompleted {
            event_id: event_id.to_string(),
            session_id: session_id.to_string(),
            account: AccountRef::by_id("user_1").with_customer(Some("cus_1".to_string())),
            plan: PlanRef::Named(plan),
            subscription_ref: Some("sub_1".to_string()),
            paid: true,
        })
    }

    fn renewal(event_id: &str) -> CausalEvent {
        CausalEvent::InvoicePaid(InvoicePaid {
            event_id: event_id.to_string(),
            invoice_id: format!("in_{}", event_id),
            account: AccountRef::by_customer("cus_1"),
            plan: PlanRef::Price("price_pro_monthly".to_string()),
            subscription_ref: Some("sub_1".to_string()),
            billing_reason: BillingReason::SubscriptionCycle,
            period_end: None,
        })
    }

    #[tokio::test]
    async fn test_new_account_starts_on_free_baseline() {
        let (engine, _) = engine().await;
        let ent = engine.get_account("user_1").await.unwrap().entitlement;

        assert_eq!(ent.plan, PlanId::Free);
        assert_eq!(ent.status, EntitlementStatus::Active);
        assert_eq!(ent.minutes_left, 15);
        assert_eq!(ent.tokens, 10);
        assert!(ent.end_date.is_none());
    }

    #[tokio::test]
    async fn test_checkout_grants_plan() {
        let (engine, audit) = engine().await;

        let outcome = engine.apply(&checkout("evt_1", "cs_1", PlanId::Pro)).await.unwrap();
        let ent = outcome.entitlement().unwrap();

        assert_eq!(ent.plan, PlanId::Pro);
        assert_eq!(ent.minutes_left, 180);
        assert_eq!(ent.tokens, 100);
        assert_eq!(ent.external_customer_ref.as_deref(), Some("cus_1"));
        assert_eq!(ent.external_subscription_ref.as_deref(), Some("sub_1"));
        assert_eq!(audit.kinds().await, vec!["grant_applied"]);
    }

    #[tokio::test]
    async fn test_second_checkout_stacks() {
        let (engine, _) = engine().await;
        put_pro(&engine, 50, 10).await;

        let outcome = engine.apply(&checkout("evt_2", "cs_2", PlanId::Pro)).await.unwrap();
        assert_eq!(outcome.entitlement().unwrap().minutes_left, 230);
    }

    #[tokio::test]
    async fn test_replayed_event_is_noop() {
        let (engine, audit) = engine().await;
        let event = checkout("evt_1", "cs_1", PlanId::Pro);

        engine.apply(&event).await.unwrap();
        let before = engine.get_account("user_1").await.unwrap();

        let outcome = engine.apply(&event).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::AlreadyApplied { .. }));

        let after = engine.get_account("user_1").await.unwrap();
        assert_eq!(before, after);
        assert_eq!(audit.kinds().await, vec!["grant_applied", "event_already_applied"]);
    }

    #[tokio::test]
    async fn test_webhook_and_manual_verify_converge() {
        let (engine, _) = engine().await;

        let manual = CausalEvent::ManualVerify(ManualVerify {
            session_id: "cs_9".to_string(),
            account_id: "user_1".to_string(),
            plan: PlanRef::Named(PlanId::Pro),
            customer_ref: Some("cus_1".to_string()),
            subscription_ref: Some("sub_1".to_string()),
        });
        engine.apply(&manual).await.unwrap();

        let outcome = engine.apply(&checkout("evt_9", "cs_9", PlanId::Pro)).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::AlreadyApplied { .. }));
        assert_eq!(engine.get_account("user_1").await.unwrap().entitlement.minutes_left, 180);
    }

    #[tokio::test]
    async fn test_unpaid_checkout_is_deferred_and_not_recorded() {
        let (engine, _) = engine().await;
        let event = CausalEvent::CheckoutCompleted(CheckoutCompleted {
            event_id: "evt_3".to_string(),
            session_id: "cs_3".to_string(),
            account: AccountRef::by_id("user_1"),
            plan: PlanRef::Named(PlanId::Pro),
            subscription_ref: None,
            paid: false,
        });

        let outcome = engine.apply(&event).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Deferred { .. }));
        assert!(!engine.store().is_event_processed("checkout:cs_3").await.unwrap());
    }

    #[tokio::test]
    async fn test_renewal_resets_exhausted_balance() {
        let (engine, _) = engine().await;
        put_pro(&engine, 0, 3).await;

        let outcome = engine.apply(&renewal("evt_r1")).await.unwrap();
        let ent = outcome.entitlement().unwrap();
        assert_eq!(ent.minutes_left, 180);
        assert_eq!(ent.status, EntitlementStatus::Active);
    }

    #[tokio::test]
    async fn test_first_invoice_does_not_grant() {
        let (engine, _) = engine().await;
        put_pro(&engine, 180, 30).await;

        let event = CausalEvent::InvoicePaid(InvoicePaid {
            event_id: "evt_first".to_string(),
            invoice_id: "in_first".to_string(),
            account: AccountRef::by_customer("cus_1"),
            plan: PlanRef::Price("price_pro_monthly".to_string()),
            subscription_ref: Some("sub_1".to_string()),
            billing_reason: BillingReason::SubscriptionCreate,
            period_end: None,
        });

        let outcome = engine.apply(&event).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Unchanged { .. }));
        assert_eq!(outcome.entitlement().unwrap().minutes_left, 180);
    }

    #[tokio::test]
    async fn test_subscription_deleted_downgrades() {
        let (engine, audit) = engine().await;
        put_pro(&engine, 40, 10).await;

        let event = CausalEvent::SubscriptionDeleted(SubscriptionDeleted {
            event_id: "evt_del".to_string(),
            subscription_ref: "sub_1".to_string(),
            account: AccountRef::by_customer("cus_1"),
        });

        let ent = engine.apply(&event).await.unwrap().entitlement().cloned().unwrap();
        assert_eq!(ent.plan, PlanId::Free);
        assert_eq!(ent.status, EntitlementStatus::Cancelled);
        assert_eq!(ent.minutes_left, 15);
        assert!(ent.external_subscription_ref.is_none());
        assert_eq!(ent.external_customer_ref.as_deref(), Some("cus_1"));
        assert_eq!(audit.kinds().await, vec!["entitlement_cancelled"]);
    }

    #[tokio::test]
    async fn test_late_renewal_after_deletion_does_not_restore_plan() {
        let (engine, _) = engine().await;
        put_pro(&engine, 40, 10).await;

        let deleted = CausalEvent::SubscriptionDeleted(SubscriptionDeleted {
            event_id: "evt_del".to_string(),
            subscription_ref: "sub_1".to_string(),
            account: AccountRef::by_customer("cus_1"),
        });
        engine.apply(&deleted).await.unwrap();

        let late = CausalEvent::InvoicePaid(InvoicePaid {
            event_id: "evt_late".to_string(),
            invoice_id: "in_late".to_string(),
            account: AccountRef::by_customer("cus_1"),
            plan: PlanRef::Price("price_pro_monthly".to_string()),
            subscription_ref: Some("sub_1".to_string()),
            billing_reason: BillingReason::SubscriptionCycle,
            period_end: Some(Utc::now() - Duration::hours(1)),
        });

        let outcome = engine.apply(&late).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Unchanged { .. }));

        let ent = engine.get_account("user_1").await.unwrap().entitlement;
        assert_eq!(ent.plan, PlanId::Free);
        assert_eq!(ent.status, EntitlementStatus::Cancelled);
        assert_eq!(ent.minutes_left, 15);
        assert!(ent.external_subscription_ref.is_none());
        assert!(engine.store().is_event_processed("invoice:in_late").await.unwrap());
    }

    #[tokio::test]
    async fn test_renewal_of_replaced_subscription_does_not_grant() {
        let (engine, _) = engine().await;
        put_pro(&engine, 40, 10).await;

        let old = CausalEvent::InvoicePaid(InvoicePaid {
            event_id: "evt_old_inv".to_string(),
            invoice_id: "in_old".to_string(),
            account: AccountRef::by_customer("cus_1"),
            plan: PlanRef::Price("price_pro_monthly".to_string()),
            subscription_ref: Some("sub_old".to_string()),
            billing_reason: BillingReason::SubscriptionCycle,
            period_end: None,
        });

        let outcome = engine.apply(&old).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Unchanged { .. }));
        let ent = outcome.entitlement().unwrap();
        assert_eq!(ent.minutes_left, 40);
        assert_eq!(ent.external_subscription_ref.as_deref(), Some("sub_1"));
    }

    #[tokio::test]
    async fn test_stale_subscription_deletion_ignored() {
        let (engine, _) = engine().await;
        put_pro(&engine, 40, 10).await;

        let event = CausalEvent::SubscriptionDeleted(SubscriptionDeleted {
            event_id: "evt_old".to_string(),
            subscription_ref: "sub_old".to_string(),
            account: AccountRef::by_customer("cus_1"),
        });

        let outcome = engine.apply(&event).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Unchanged { .. }));
        assert_eq!(outcome.entitlement().unwrap().plan, PlanId::Pro);
    }

    #[tokio::test]
    async fn test_plan_change_on_tracked_subscription() {
        let (engine, _) = engine().await;
        put_pro(&engine, 40, 10).await;
        let period_end = Utc::now() + Duration::days(30);

        let event = CausalEvent::SubscriptionUpdated(SubscriptionUpdated {
            event_id: "evt_up".to_string(),
            subscription_ref: "sub_1".to_string(),
            account: AccountRef::by_customer("cus_1"),
            plan: PlanRef::Price("price_proplus_monthly".to_string()),
            status: SubscriptionStatus::Active,
            current_period_end: Some(period_end),
        });

        let ent = engine.apply(&event).await.unwrap().entitlement().cloned().unwrap();
        assert_eq!(ent.plan, PlanId::ProPlus);
        assert_eq!(ent.minutes_left, UNLIMITED_MINUTES);
        assert_eq!(ent.end_date, Some(period_end));
    }

    #[tokio::test]
    async fn test_same_plan_update_only_extends_window() {
        let (engine, _) = engine().await;
        put_pro(&engine, 40, 10).await;
        let period_end = Utc::now() + Duration::days(40);

        let event = CausalEvent::SubscriptionUpdated(SubscriptionUpdated {
            event_id: "evt_sync".to_string(),
            subscription_ref: "sub_1".to_string(),
            account: AccountRef::by_customer("cus_1"),
            plan: PlanRef::Named(PlanId::Pro),
            status: SubscriptionStatus::Active,
            current_period_end: Some(period_end),
        });

        let ent = engine.apply(&event).await.unwrap().entitlement().cloned().unwrap();
        assert_eq!(ent.minutes_left, 40);
        assert_eq!(ent.end_date, Some(period_end));
    }

    #[tokio::test]
    async fn test_untracked_subscription_update_does_not_grant() {
        let (engine, _) = engine().await;

        let event = CausalEvent::SubscriptionUpdated(SubscriptionUpdated {
            event_id: "evt_new".to_string(),
            subscription_ref: "sub_new".to_string(),
            account: AccountRef::by_id("user_1"),
            plan: PlanRef::Named(PlanId::Pro),
            status: SubscriptionStatus::Active,
            current_period_end: None,
        });

        let outcome = engine.apply(&event).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Unchanged { .. }));
        assert_eq!(outcome.entitlement().unwrap().plan, PlanId::Free);
    }

    #[tokio::test]
    async fn test_invoice_failed_records_without_change() {
        let (engine, audit) = engine().await;
        put_pro(&engine, 40, 10).await;

        let event = CausalEvent::InvoiceFailed(InvoiceFailed {
            event_id: "evt_fail".to_string(),
            invoice_id: "in_fail".to_string(),
            account: AccountRef::by_customer("cus_1"),
            subscription_ref: Some("sub_1".to_string()),
            attempt_count: 2,
        });

        let outcome = engine.apply(&event).await.unwrap();
        let ent = outcome.entitlement().unwrap();
        assert_eq!(ent.status, EntitlementStatus::Active);
        assert_eq!(ent.minutes_left, 40);
        assert!(engine.store().is_event_processed("event:evt_fail").await.unwrap());
        assert_eq!(audit.kinds().await, vec!["event_recorded", "payment_failed"]);
    }

    #[tokio::test]
    async fn test_unresolvable_account_writes_nothing() {
        let (engine, _) = engine().await;
        let event = CausalEvent::InvoicePaid(InvoicePaid {
            event_id: "evt_lost".to_string(),
            invoice_id: "in_lost".to_string(),
            account: AccountRef::by_customer("cus_unknown"),
            plan: PlanRef::Price("price_pro_monthly".to_string()),
            subscription_ref: None,
            billing_reason: BillingReason::SubscriptionCycle,
            period_end: None,
        });

        let err = engine.apply(&event).await.unwrap_err();
        assert!(matches!(err, BillingError::UserResolution { .. }));
        assert!(!engine.store().is_event_processed("invoice:in_lost").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_price_fails_before_mutation() {
        let (engine, _) = engine().await;
        let before = engine.get_account("user_1").await.unwrap();

        let event = CausalEvent::CheckoutCompleted(CheckoutCompleted {
            event_id: "evt_x".to_string(),
            session_id: "cs_x".to_string(),
            account: AccountRef::by_id("user_1"),
            plan: PlanRef::Price("price_unknown".to_string()),
            subscription_ref: None,
            paid: true,
        });

        let err = engine.apply(&event).await.unwrap_err();
        assert!(matches!(err, BillingError::UnknownPlan { .. }));
        assert_eq!(engine.get_account("user_1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_resolve_account_by_email() {
        let (engine, _) = engine().await;
        let reference = AccountRef::default().with_email(Some("USER1@example.com".to_string()));

        let account = engine.resolve_account("checkout_completed", &reference).await.unwrap();
        assert_eq!(account.id, "user_1");
    }

    #[tokio::test]
    async fn test_link_customer() {
        let (engine, audit) = engine().await;

        let account = engine.link_customer("user_1", "cus_new").await.unwrap();
        assert_eq!(account.entitlement.external_customer_ref.as_deref(), Some("cus_new"));
        assert_eq!(account.version, 1);

        // Linking again writes nothing
        let again = engine.link_customer("user_1", "cus_new").await.unwrap();
        assert_eq!(again.version, 1);
        assert_eq!(audit.kinds().await, vec!["customer_linked"]);
    }
}
