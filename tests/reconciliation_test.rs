use std::collections::HashMap;
use std::sync::Arc;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use serde_json::{Value, json};

use tidemark::billing::gateway::{METADATA_ACCOUNT_ID, METADATA_PLAN_ID};
use tidemark::billing::{
    AccountStore, BillingError, CheckoutConfig, CheckoutManager, CheckoutSession, CheckoutSessionRequest,
    CodeRegistry, CreateCustomerRequest, EntitlementStatus, GatewayHandle, MemoryAccountStore,
    PaymentGateway, PaymentLink, PaymentLinkRequest, PaymentStatus, PlanCatalog, PlanId,
    ReconciliationEngine, RetrievedSession, RetrievedSubscription, StripeSignatureVerifier,
    SubscriptionStatus, UsageMeter, WebhookOutcome, WebhookProcessor,
};

const SECRET: &str = "whsec_integration";

type Engine = ReconciliationEngine<MemoryAccountStore>;

/// Gateway that reports every known session as paid.
struct PaidSessions {
    sessions: HashMap<String, RetrievedSession>,
}

impl PaidSessions {
    fn with_session(session_id: &str, account_id: &str, plan: PlanId) -> Self {
        let metadata = HashMap::from([
            (METADATA_ACCOUNT_ID.to_string(), account_id.to_string()),
            (METADATA_PLAN_ID.to_string(), plan.as_str().to_string()),
        ]);
        let session = RetrievedSession {
            id: session_id.to_string(),
            payment_status: PaymentStatus::Paid,
            metadata,
            customer_ref: Some("cus_1".to_string()),
            subscription_ref: Some("sub_1".to_string()),
            customer_email: None,
        };
        Self {
            sessions: HashMap::from([(session_id.to_string(), session)]),
        }
    }
}

impl PaymentGateway for PaidSessions {
    async fn create_customer(&self, _request: CreateCustomerRequest) -> tidemark::billing::error::Result<String> {
        Ok("cus_1".to_string())
    }

    async fn create_checkout_session(
        &self,
        _request: CheckoutSessionRequest,
    ) -> tidemark::billing::error::Result<CheckoutSession> {
        Ok(CheckoutSession {
            id: "cs_new".to_string(),
            url: "https://checkout.test/cs_new".to_string(),
        })
    }

    async fn create_payment_link(
        &self,
        _request: PaymentLinkRequest,
    ) -> tidemark::billing::error::Result<PaymentLink> {
        Ok(PaymentLink {
            id: "plink_1".to_string(),
            url: "https://checkout.test/plink_1".to_string(),
        })
    }

    async fn retrieve_session(&self, session_id: &str) -> tidemark::billing::error::Result<RetrievedSession> {
        self.sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound {
                resource: "checkout_session",
                id: session_id.to_string(),
            })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> tidemark::billing::error::Result<RetrievedSubscription> {
        Ok(RetrievedSubscription {
            id: subscription_id.to_string(),
            status: SubscriptionStatus::Active,
            price_ref: Some("price_pro_monthly".to_string()),
            current_period_end: None,
        })
    }
}

async fn engine_with(accounts: &[&str], max_retries: u32) -> Arc<Engine> {
    let engine = Arc::new(
        ReconciliationEngine::new(MemoryAccountStore::new(), PlanCatalog::standard())
            .with_max_retries(max_retries),
    );
    for id in accounts {
        engine
            .create_account(id, &format!("{}@example.com", id))
            .await
            .unwrap();
    }
    engine
}

fn envelope(id: &str, event_type: &str, object: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": id,
        "type": event_type,
        "data": { "object": object },
    }))
    .unwrap()
}

fn signed(payload: &[u8]) -> String {
    StripeSignatureVerifier::new(SECRET)
        .sign(payload, Utc::now().timestamp())
        .unwrap()
}

fn checkout_completed(event_id: &str, session_id: &str) -> Vec<u8> {
    envelope(
        event_id,
        "checkout.session.completed",
        json!({
            "id": session_id,
            "customer": "cus_1",
            "subscription": "sub_1",
            "payment_status": "paid",
            "metadata": { "account_id": "user_1", "plan_id": "pro" },
        }),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redemption_has_one_winner() {
    let engine = engine_with(&["user_a", "user_b"], 5).await;
    let registry = Arc::new(CodeRegistry::new(engine.clone()));
    let code = registry.generate(PlanId::Pro, "admin", None).await.unwrap();

    let mut handles = Vec::new();
    for account in ["user_a", "user_b"] {
        let registry = registry.clone();
        let text = code.code.clone();
        handles.push(tokio::spawn(async move { registry.redeem(&text, account).await }));
    }

    let mut winners = 0;
    let mut losers = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(redemption) => {
                winners += 1;
                assert_eq!(redemption.entitlement.plan, PlanId::Pro);
            }
            Err(BillingError::AlreadyUsed { .. }) => losers += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((winners, losers), (1, 1));

    let stored = engine.store();
    let a = engine.get_account("user_a").await.unwrap().entitlement.plan;
    let b = engine.get_account("user_b").await.unwrap().entitlement.plan;
    assert_eq!([a, b].iter().filter(|p| **p == PlanId::Pro).count(), 1);
    assert!(stored.get_code(&code.code).await.unwrap().unwrap().is_used);
}

#[tokio::test]
async fn test_webhook_then_verify_grants_once() {
    let engine = engine_with(&["user_1"], 5).await;
    let processor = WebhookProcessor::new(engine.clone(), StripeSignatureVerifier::new(SECRET));
    let checkout = CheckoutManager::new(
        engine.clone(),
        GatewayHandle::Configured(PaidSessions::with_session("cs_1", "user_1", PlanId::Pro)),
        CheckoutConfig::new(),
    );

    let payload = checkout_completed("evt_1", "cs_1");
    let response = processor.process(&payload, Some(&signed(&payload))).await;
    assert_eq!(response.outcome, Some(WebhookOutcome::Processed));

    let ent = checkout.verify_checkout("cs_1", "user_1").await.unwrap();
    assert_eq!(ent.plan, PlanId::Pro);
    assert_eq!(ent.minutes_left, 180);
}

#[tokio::test]
async fn test_verify_then_webhook_grants_once() {
    let engine = engine_with(&["user_1"], 5).await;
    let processor = WebhookProcessor::new(engine.clone(), StripeSignatureVerifier::new(SECRET));
    let checkout = CheckoutManager::new(
        engine.clone(),
        GatewayHandle::Configured(PaidSessions::with_session("cs_1", "user_1", PlanId::Pro)),
        CheckoutConfig::new(),
    );

    let ent = checkout.verify_checkout("cs_1", "user_1").await.unwrap();
    assert_eq!(ent.minutes_left, 180);

    let payload = checkout_completed("evt_1", "cs_1");
    let response = processor.process(&payload, Some(&signed(&payload))).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.outcome, Some(WebhookOutcome::AlreadyProcessed));

    let account = engine.get_account("user_1").await.unwrap();
    assert_eq!(account.entitlement.minutes_left, 180);
    assert_eq!(account.entitlement.external_subscription_ref.as_deref(), Some("sub_1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_webhook_and_verify_grant_once() {
    let engine = engine_with(&["user_1"], 16).await;
    let processor = WebhookProcessor::new(engine.clone(), StripeSignatureVerifier::new(SECRET));
    let checkout = CheckoutManager::new(
        engine.clone(),
        GatewayHandle::Configured(PaidSessions::with_session("cs_1", "user_1", PlanId::Pro)),
        CheckoutConfig::new(),
    );

    let payload = checkout_completed("evt_1", "cs_1");
    let header = signed(&payload);
    let (response, verified) = tokio::join!(
        processor.process(&payload, Some(&header)),
        checkout.verify_checkout("cs_1", "user_1"),
    );

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(verified.unwrap().plan, PlanId::Pro);
    assert_eq!(engine.get_account("user_1").await.unwrap().entitlement.minutes_left, 180);
    assert!(engine.store().processed_keys().await.contains(&"checkout:cs_1".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consume_loses_no_updates() {
    let engine = engine_with(&["user_1"], 64).await;
    let registry = CodeRegistry::new(engine.clone());
    let code = registry.generate(PlanId::Pro, "admin", None).await.unwrap();
    registry.redeem(&code.code, "user_1").await.unwrap();

    let meter = Arc::new(UsageMeter::new(engine.clone()));
    let mut handles = Vec::new();
    for _ in 0..10 {
        let meter = meter.clone();
        handles.push(tokio::spawn(async move { meter.consume("user_1", 60.0).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let account = engine.get_account("user_1").await.unwrap();
    assert_eq!(account.entitlement.minutes_left, 170);
    assert_eq!(account.usage.sessions_completed, 10);
    assert_eq!(account.usage.total_minutes_used, 10);
}

#[tokio::test]
async fn test_webhook_signature_end_to_end() {
    let engine = engine_with(&["user_1"], 5).await;
    let processor = WebhookProcessor::new(engine.clone(), StripeSignatureVerifier::new(SECRET));
    let payload = checkout_completed("evt_1", "cs_1");

    let stale = StripeSignatureVerifier::new(SECRET)
        .sign(&payload, Utc::now().timestamp() - 3600)
        .unwrap();
    let response = processor.process(&payload, Some(&stale)).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let mut tampered = payload.clone();
    tampered.extend_from_slice(b" ");
    let response = processor.process(&tampered, Some(&signed(&payload))).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(engine.get_account("user_1").await.unwrap().entitlement.plan, PlanId::Free);

    let response = processor.process(&payload, Some(&signed(&payload))).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["outcome"], "processed");
}

#[tokio::test]
async fn test_subscription_lifecycle() {
    let engine = engine_with(&["user_1"], 5).await;
    let processor = WebhookProcessor::new(engine.clone(), StripeSignatureVerifier::new(SECRET));
    let meter = UsageMeter::new(engine.clone());

    let payload = checkout_completed("evt_1", "cs_1");
    processor.process(&payload, Some(&signed(&payload))).await;

    // 100 minutes used from the 180 allotment
    meter.consume("user_1", 6000.0).await.unwrap();

    let period_end = (Utc::now() + Duration::days(45)).timestamp();
    let renewal = envelope(
        "evt_2",
        "invoice.paid",
        json!({
            "id": "in_2",
            "customer": "cus_1",
            "subscription": "sub_1",
            "billing_reason": "subscription_cycle",
            "lines": { "data": [ {
                "price": { "id": "price_pro_monthly" },
                "period": { "start": Utc::now().timestamp(), "end": period_end },
            } ] },
        }),
    );
    let response = processor.process(&renewal, Some(&signed(&renewal))).await;
    assert_eq!(response.outcome, Some(WebhookOutcome::Processed));

    let ent = engine.get_account("user_1").await.unwrap().entitlement;
    assert_eq!(ent.minutes_left, 260);
    assert_eq!(ent.end_date.map(|d| d.timestamp()), Some(period_end));

    let deleted = envelope(
        "evt_3",
        "customer.subscription.deleted",
        json!({ "id": "sub_1", "customer": "cus_1", "status": "canceled" }),
    );
    processor.process(&deleted, Some(&signed(&deleted))).await;

    let ent = engine.get_account("user_1").await.unwrap().entitlement;
    assert_eq!(ent.plan, PlanId::Free);
    assert_eq!(ent.status, EntitlementStatus::Cancelled);
    assert_eq!(ent.external_customer_ref.as_deref(), Some("cus_1"));
}

#[tokio::test]
async fn test_code_redemption_then_top_up() {
    let engine = engine_with(&["user_1"], 5).await;
    let registry = CodeRegistry::new(engine.clone());
    let meter = UsageMeter::new(engine.clone());

    let code = registry.generate(PlanId::Pro, "admin", None).await.unwrap();
    let redemption = registry.redeem(&code.code.to_lowercase(), "user_1").await.unwrap();
    assert_eq!(redemption.entitlement.minutes_left, 180);

    let outcome = meter.consume("user_1", 180.0 * 60.0).await.unwrap();
    assert!(outcome.exhausted);

    let ent = meter.top_up("user_1").await.unwrap();
    assert_eq!(ent.minutes_left, 180);
    assert_eq!(ent.status, EntitlementStatus::Active);

    let stats = registry.stats().await.unwrap();
    assert_eq!(stats.totals.used, 1);
}
