//! Stripe webhook handling.
//!
//! Verifies the signature, maps the processor's event into a
//! [`CausalEvent`] and hands it to the engine. The HTTP status tells the
//! processor whether to retry: 200 for applied, duplicate or ignored events,
//! 400 for a bad signature or payload, 500 for anything the engine could not
//! apply. A failed event is never recorded in the ledger, so its retry is
//! applied normally.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;

use super::audit::{BillingAuditEvent, BillingAuditLogger, TracingAuditLogger};
use super::error::{BillingError, Result};
use super::events::{
    AccountRef, BillingReason, CausalEvent, CheckoutCompleted, InvoiceFailed, InvoicePaid, PlanRef,
    SubscriptionDeleted, SubscriptionStatus, SubscriptionUpdated,
};
use super::gateway::{METADATA_ACCOUNT_ID, METADATA_PLAN_ID, PaymentStatus, StripeSignatureVerifier};
use super::reconcile::{ReconcileOutcome, ReconciliationEngine};
use super::storage::AccountStore;

/// A verified webhook, mapped to the event the engine understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    /// `None` for event types that do not affect entitlements.
    pub event: Option<CausalEvent>,
}

/// Outcome of webhook processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The entitlement changed.
    Processed,
    /// Recorded without an entitlement change.
    Unchanged,
    /// Event was already processed.
    AlreadyProcessed,
    /// Event type is not relevant.
    Ignored,
    /// Payment still settling. Not recorded, so a later event can apply it.
    Deferred,
}

impl WebhookOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Unchanged => "unchanged",
            Self::AlreadyProcessed => "already_processed",
            Self::Ignored => "ignored",
            Self::Deferred => "deferred",
        }
    }
}

impl From<&ReconcileOutcome> for WebhookOutcome {
    fn from(outcome: &ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome::Applied { .. } => Self::Processed,
            ReconcileOutcome::Unchanged { .. } => Self::Unchanged,
            ReconcileOutcome::AlreadyApplied { .. } => Self::AlreadyProcessed,
            ReconcileOutcome::Deferred { .. } => Self::Deferred,
        }
    }
}

/// HTTP answer for the processor.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: StatusCode,
    /// Set when the event was handled.
    pub outcome: Option<WebhookOutcome>,
    pub body: serde_json::Value,
}

impl WebhookResponse {
    fn handled(outcome: WebhookOutcome) -> Self {
        Self {
            status: StatusCode::OK,
            outcome: Some(outcome),
            body: json!({ "received": true, "outcome": outcome.as_str() }),
        }
    }

    fn rejected(error: &BillingError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            outcome: None,
            body: json!({ "error": error.code() }),
        }
    }

    fn failed() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            outcome: None,
            body: json!({ "error": "webhook_processing_failed" }),
        }
    }
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Webhook handler for Stripe events.
pub struct WebhookProcessor<S: AccountStore, A: BillingAuditLogger = TracingAuditLogger> {
    engine: Arc<ReconciliationEngine<S, A>>,
    verifier: StripeSignatureVerifier,
}

impl<S: AccountStore, A: BillingAuditLogger> WebhookProcessor<S, A> {
    #[must_use]
    pub fn new(engine: Arc<ReconciliationEngine<S, A>>, verifier: StripeSignatureVerifier) -> Self {
        Self { engine, verifier }
    }

    /// Verify, parse and apply a raw webhook request.
    ///
    /// `signature` is the `Stripe-Signature` header value, if present.
    ///
    /// Every reconciliation failure answers 500, including `UserResolution`
    /// and `UnknownPlan`. Those are not retryable inside the engine, but a
    /// 200 would tell the processor the account is reconciled when it is not.
    /// The processor's retries give an operator time to create the missing
    /// account or price mapping, after which the same event applies. Each
    /// failure is logged with its error code and audited as
    /// `reconciliation_failed`.
    pub async fn process(&self, payload: &[u8], signature: Option<&str>) -> WebhookResponse {
        let verified = match signature {
            Some(header) => self.verifier.verify(payload, header),
            None => Err(BillingError::Signature {
                reason: "missing signature header".to_string(),
            }),
        };
        if let Err(err) = verified {
            tracing::warn!(target: "billing::webhook", error = %err, "webhook signature rejected");
            return WebhookResponse::rejected(&err);
        }

        let event = match parse_event(payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(target: "billing::webhook", error = %err, "malformed webhook payload");
                return WebhookResponse::rejected(&err);
            }
        };

        self.engine
            .audit()
            .log(BillingAuditEvent::WebhookReceived {
                event_id: event.id.clone(),
                event_type: event.event_type.clone(),
            })
            .await;

        match self.handle_event(&event).await {
            Ok(outcome) => {
                self.engine
                    .audit()
                    .log(BillingAuditEvent::WebhookProcessed {
                        event_id: event.id.clone(),
                        event_type: event.event_type.clone(),
                        outcome: outcome.as_str().to_string(),
                    })
                    .await;
                WebhookResponse::handled(outcome)
            }
            Err(err) => {
                let (kind, key) = event
                    .event
                    .as_ref()
                    .map(|e| (e.kind(), e.idempotency_key()))
                    .unwrap_or(("unknown", String::new()));
                tracing::error!(
                    target: "billing::webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error_code = err.code(),
                    retryable = err.is_retryable(),
                    error = %err,
                    "webhook could not be reconciled"
                );
                self.engine
                    .audit()
                    .log(BillingAuditEvent::ReconciliationFailed {
                        event_kind: kind,
                        idempotency_key: key,
                        reason: err.to_string(),
                    })
                    .await;
                WebhookResponse::failed()
            }
        }
    }

    /// Apply an already verified event.
    pub async fn handle_event(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        let Some(causal) = &event.event else {
            tracing::debug!(
                target: "billing::webhook",
                event_type = %event.event_type,
                "ignoring webhook event type"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let outcome = self.engine.apply(causal).await?;
        tracing::info!(
            target: "billing::webhook",
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = outcome.as_str(),
            "webhook reconciled"
        );
        Ok(WebhookOutcome::from(&outcome))
    }
}

/// Parse a webhook body into a [`WebhookEvent`].
///
/// Unknown event types parse successfully with no causal event. Known types
/// with a malformed object are rejected.
pub fn parse_event(payload: &[u8]) -> Result<WebhookEvent> {
    let envelope: Envelope = serde_json::from_slice(payload).map_err(malformed)?;
    let object = envelope.data.object;
    let id = envelope.id;

    let event = match envelope.event_type.as_str() {
        "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
            let session: SessionObject = serde_json::from_value(object).map_err(malformed)?;
            let email = session
                .customer_details
                .and_then(|d| d.email)
                .or(session.customer_email);
            Some(CausalEvent::CheckoutCompleted(CheckoutCompleted {
                event_id: id.clone(),
                account: AccountRef {
                    account_id: session.metadata.get(METADATA_ACCOUNT_ID).cloned(),
                    customer_ref: session.customer.map(IdOrObject::into_id),
                    email,
                },
                plan: PlanRef::from_parts(session.metadata.get(METADATA_PLAN_ID).map(String::as_str), None),
                subscription_ref: session.subscription.map(IdOrObject::into_id),
                paid: session
                    .payment_status
                    .as_deref()
                    .map(PaymentStatus::from_stripe)
                    .is_some_and(PaymentStatus::is_settled),
                session_id: session.id,
            }))
        }
        "customer.subscription.created" | "customer.subscription.updated" => {
            let sub: SubscriptionObject = serde_json::from_value(object).map_err(malformed)?;
            let item = sub.items.data.first();
            Some(CausalEvent::SubscriptionUpdated(SubscriptionUpdated {
                event_id: id.clone(),
                account: subscription_account(&sub),
                plan: PlanRef::from_parts(
                    sub.metadata.get(METADATA_PLAN_ID).map(String::as_str),
                    item.and_then(|i| i.price.as_ref()).map(|p| p.id.as_str()),
                ),
                status: SubscriptionStatus::from_stripe(&sub.status),
                current_period_end: sub
                    .current_period_end
                    .or_else(|| item.and_then(|i| i.current_period_end))
                    .and_then(from_unix),
                subscription_ref: sub.id,
            }))
        }
        "customer.subscription.deleted" => {
            let sub: SubscriptionObject = serde_json::from_value(object).map_err(malformed)?;
            Some(CausalEvent::SubscriptionDeleted(SubscriptionDeleted {
                event_id: id.clone(),
                account: subscription_account(&sub),
                subscription_ref: sub.id,
            }))
        }
        "invoice.paid" | "invoice.payment_succeeded" => {
            let invoice: InvoiceObject = serde_json::from_value(object).map_err(malformed)?;
            let line = invoice.lines.data.first();
            Some(CausalEvent::InvoicePaid(InvoicePaid {
                event_id: id.clone(),
                account: invoice_account(&invoice),
                plan: PlanRef::from_parts(None, line.and_then(InvoiceLine::price_ref)),
                subscription_ref: invoice.subscription_ref(),
                billing_reason: invoice
                    .billing_reason
                    .as_deref()
                    .map_or(BillingReason::Other, BillingReason::from_stripe),
                period_end: line.and_then(|l| l.period.as_ref()).and_then(|p| from_unix(p.end)),
                invoice_id: invoice.id,
            }))
        }
        "invoice.payment_failed" => {
            let invoice: InvoiceObject = serde_json::from_value(object).map_err(malformed)?;
            Some(CausalEvent::InvoiceFailed(InvoiceFailed {
                event_id: id.clone(),
                account: invoice_account(&invoice),
                subscription_ref: invoice.subscription_ref(),
                attempt_count: invoice.attempt_count.unwrap_or(0),
                invoice_id: invoice.id,
            }))
        }
        _ => None,
    };

    Ok(WebhookEvent {
        id,
        event_type: envelope.event_type,
        event,
    })
}

fn malformed(err: serde_json::Error) -> BillingError {
    BillingError::validation("payload", format!("malformed webhook payload: {}", err))
}

fn from_unix(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

fn subscription_account(sub: &SubscriptionObject) -> AccountRef {
    AccountRef {
        account_id: sub.metadata.get(METADATA_ACCOUNT_ID).cloned(),
        customer_ref: sub.customer.clone().map(IdOrObject::into_id),
        email: None,
    }
}

fn invoice_account(invoice: &InvoiceObject) -> AccountRef {
    AccountRef {
        account_id: invoice
            .parent
            .as_ref()
            .and_then(|p| p.subscription_details.as_ref())
            .and_then(|d| d.metadata.get(METADATA_ACCOUNT_ID).cloned()),
        customer_ref: invoice.customer.clone().map(IdOrObject::into_id),
        email: invoice.customer_email.clone(),
    }
}

#[derive(Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData {
    object: serde_json::Value,
}

/// A reference the processor sends either as an id or as an expanded object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum IdOrObject {
    Id(String),
    Object { id: String },
}

impl IdOrObject {
    fn into_id(self) -> String {
        match self {
            Self::Id(id) | Self::Object { id } => id,
        }
    }
}

#[derive(Deserialize)]
struct SessionObject {
    id: String,
    customer: Option<IdOrObject>,
    subscription: Option<IdOrObject>,
    payment_status: Option<String>,
    customer_email: Option<String>,
    customer_details: Option<CustomerDetails>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct CustomerDetails {
    email: Option<String>,
}

#[derive(Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: Option<IdOrObject>,
    status: String,
    current_period_end: Option<i64>,
    #[serde(default)]
    items: List<SubscriptionItem>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct SubscriptionItem {
    price: Option<Price>,
    current_period_end: Option<i64>,
}

#[derive(Deserialize)]
struct Price {
    id: String,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct List<T> {
    #[serde(default)]
    data: Vec<T>,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Deserialize)]
struct InvoiceObject {
    id: String,
    customer: Option<IdOrObject>,
    customer_email: Option<String>,
    subscription: Option<IdOrObject>,
    parent: Option<InvoiceParent>,
    billing_reason: Option<String>,
    attempt_count: Option<u32>,
    #[serde(default)]
    lines: List<InvoiceLine>,
}

impl InvoiceObject {
    /// Older API versions put the subscription on the invoice, newer ones
    /// under `parent.subscription_details`.
    fn subscription_ref(&self) -> Option<String> {
        self.subscription.clone().map(IdOrObject::into_id).or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| d.subscription.clone())
        })
    }
}

#[derive(Deserialize)]
struct InvoiceParent {
    subscription_details: Option<SubscriptionDetails>,
}

#[derive(Deserialize)]
struct SubscriptionDetails {
    subscription: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct InvoiceLine {
    price: Option<Price>,
    pricing: Option<LinePricing>,
    period: Option<Period>,
}

impl InvoiceLine {
    fn price_ref(&self) -> Option<&str> {
        self.price.as_ref().map(|p| p.id.as_str()).or_else(|| {
            self.pricing
                .as_ref()
                .and_then(|p| p.price_details.as_ref())
                .and_then(|d| d.price.as_deref())
        })
    }
}

#[derive(Deserialize)]
struct LinePricing {
    price_details: Option<PriceDetails>,
}

#[derive(Deserialize)]
struct PriceDetails {
    price: Option<String>,
}

#[derive(Deserialize)]
struct Period {
    end: i64,
}
