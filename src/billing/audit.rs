//! Audit logging for billing operations.
//!
//! Every entitlement transition and every reconciliation failure that needs
//! an operator is reported through [`BillingAuditLogger`].

use std::fmt;
use std::future::Future;

use super::entitlement::PlanId;

/// Audit event types for billing operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingAuditEvent {
    /// A causal event changed an entitlement.
    GrantApplied {
        account_id: String,
        event_kind: &'static str,
        idempotency_key: String,
        plan: PlanId,
        minutes_left: i64,
    },
    /// A subscription ended and the account fell back to the free tier.
    EntitlementCancelled {
        account_id: String,
        idempotency_key: String,
    },
    /// A causal event was recorded without changing the entitlement.
    EventRecorded {
        account_id: String,
        event_kind: &'static str,
        idempotency_key: String,
    },
    /// A replayed event was skipped.
    EventAlreadyApplied { idempotency_key: String },
    /// An invoice payment failed at the processor.
    PaymentFailed {
        account_id: String,
        invoice_id: String,
        attempt_count: u32,
    },
    /// A causal event could not be reconciled and needs an operator.
    ReconciliationFailed {
        event_kind: &'static str,
        idempotency_key: String,
        reason: String,
    },
    /// A batch of redemption codes was issued.
    CodesGenerated {
        issuer: String,
        plan: PlanId,
        count: usize,
    },
    /// A redemption code was consumed.
    CodeRedeemed {
        code: String,
        account_id: String,
        plan: PlanId,
    },
    /// A bounded balance reached zero.
    BalanceExhausted { account_id: String, plan: PlanId },
    /// A metered top-up was granted.
    TopUpGranted { account_id: String, minutes_left: i64 },
    /// A processor customer was linked to an account.
    CustomerLinked {
        account_id: String,
        customer_ref: String,
    },
    /// Checkout session created.
    CheckoutCreated {
        account_id: String,
        plan: PlanId,
        session_id: String,
    },
    /// Webhook received and verified.
    WebhookReceived { event_id: String, event_type: String },
    /// Webhook processed.
    WebhookProcessed {
        event_id: String,
        event_type: String,
        outcome: String,
    },
}

impl fmt::Display for BillingAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GrantApplied { account_id, event_kind, idempotency_key, plan, minutes_left } => {
                write!(
                    f,
                    "Grant applied to {} from {} ({}): plan={}, minutes_left={}",
                    account_id, event_kind, idempotency_key, plan, minutes_left
                )
            }
            Self::EntitlementCancelled { account_id, idempotency_key } => {
                write!(f, "Entitlement for {} cancelled ({})", account_id, idempotency_key)
            }
            Self::EventRecorded { account_id, event_kind, idempotency_key } => {
                write!(
                    f,
                    "Recorded {} for {} without entitlement change ({})",
                    event_kind, account_id, idempotency_key
                )
            }
            Self::EventAlreadyApplied { idempotency_key } => {
                write!(f, "Event {} already applied, skipped", idempotency_key)
            }
            Self::PaymentFailed { account_id, invoice_id, attempt_count } => {
                write!(
                    f,
                    "Payment failed for {} on invoice {} (attempt {})",
                    account_id, invoice_id, attempt_count
                )
            }
            Self::ReconciliationFailed { event_kind, idempotency_key, reason } => {
                write!(f, "Could not reconcile {} ({}): {}", event_kind, idempotency_key, reason)
            }
            Self::CodesGenerated { issuer, plan, count } => {
                write!(f, "{} generated {} {} codes", issuer, count, plan)
            }
            Self::CodeRedeemed { code, account_id, plan } => {
                write!(f, "Code {} redeemed by {} for {}", code, account_id, plan)
            }
            Self::BalanceExhausted { account_id, plan } => {
                write!(f, "Balance exhausted for {} on {}", account_id, plan)
            }
            Self::TopUpGranted { account_id, minutes_left } => {
                write!(f, "Top-up granted to {}: minutes_left={}", account_id, minutes_left)
            }
            Self::CustomerLinked { account_id, customer_ref } => {
                write!(f, "Customer {} linked to {}", customer_ref, account_id)
            }
            Self::CheckoutCreated { account_id, plan, session_id } => {
                write!(f, "Checkout {} created for {} on {}", session_id, account_id, plan)
            }
            Self::WebhookReceived { event_id, event_type } => {
                write!(f, "Webhook received: {} ({})", event_type, event_id)
            }
            Self::WebhookProcessed { event_id, event_type, outcome } => {
                write!(f, "Webhook processed: {} ({}) -> {}", event_type, event_id, outcome)
            }
        }
    }
}

/// Trait for audit logging billing events.
///
/// Implementations should swallow their own failures so auditing never
/// disrupts reconciliation.
pub trait BillingAuditLogger: Send + Sync {
    /// Log a billing audit event.
    fn log(&self, event: BillingAuditEvent) -> impl Future<Output = ()> + Send;
}

/// No-op audit logger.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

impl BillingAuditLogger for NoOpAuditLogger {
    async fn log(&self, _event: BillingAuditEvent) {}
}

/// Tracing-based audit logger.
///
/// Operator-facing events go out at WARN or ERROR, the rest at INFO.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

impl BillingAuditLogger for TracingAuditLogger {
    async fn log(&self, event: BillingAuditEvent) {
        match &event {
            BillingAuditEvent::ReconciliationFailed { .. } => {
                tracing::error!(
                    target: "billing::audit",
                    event_type = %event_kind(&event),
                    "{}", event
                );
            }
            BillingAuditEvent::PaymentFailed { .. } | BillingAuditEvent::BalanceExhausted { .. } => {
                tracing::warn!(
                    target: "billing::audit",
                    event_type = %event_kind(&event),
                    "{}", event
                );
            }
            _ => {
                tracing::info!(
                    target: "billing::audit",
                    event_type = %event_kind(&event),
                    "{}", event
                );
            }
        }
    }
}

/// Get the event kind as a string for structured logging.
pub fn event_kind(event: &BillingAuditEvent) -> &'static str {
    match event {
        BillingAuditEvent::GrantApplied { .. } => "grant_applied",
        BillingAuditEvent::EntitlementCancelled { .. } => "entitlement_cancelled",
        BillingAuditEvent::EventRecorded { .. } => "event_recorded",
        BillingAuditEvent::EventAlreadyApplied { .. } => "event_already_applied",
        BillingAuditEvent::PaymentFailed { .. } => "payment_failed",
        BillingAuditEvent::ReconciliationFailed { .. } => "reconciliation_failed",
        BillingAuditEvent::CodesGenerated { .. } => "codes_generated",
        BillingAuditEvent::CodeRedeemed { .. } => "code_redeemed",
        BillingAuditEvent::BalanceExhausted { .. } => "balance_exhausted",
        BillingAuditEvent::TopUpGranted { .. } => "top_up_granted",
        BillingAuditEvent::CustomerLinked { .. } => "customer_linked",
        BillingAuditEvent::CheckoutCreated { .. } => "checkout_created",
        BillingAuditEvent::WebhookReceived { .. } => "webhook_received",
        BillingAuditEvent::WebhookProcessed { .. } => "webhook_processed",
    }
}

/// Audit logger that keeps events in memory.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Captures events for assertions. Clones share the same buffer.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingAuditLogger {
        events: Arc<Mutex<Vec<BillingAuditEvent>>>,
    }

    impl RecordingAuditLogger {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn events(&self) -> Vec<BillingAuditEvent> {
            self.events.lock().await.clone()
        }

        pub async fn kinds(&self) -> Vec<&'static str> {
            self.events.lock().await.iter().map(event_kind).collect()
        }
    }

    impl BillingAuditLogger for RecordingAuditLogger {
        async fn log(&self, event: BillingAuditEvent) {
            self.events.lock().await.push(event);
        }
    }
}
