//! Payment processor boundary.
//!
//! The core never talks to the processor directly. It consumes a
//! [`PaymentGateway`] for outbound calls and a [`StripeSignatureVerifier`]
//! for inbound webhooks. Deployments without a processor hold a
//! [`GatewayHandle::Unconfigured`] and every gateway-backed operation fails
//! with [`BillingError::GatewayNotConfigured`].

use std::collections::HashMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::entitlement::PlanId;
use super::error::{BillingError, Result};
use super::events::SubscriptionStatus;

/// Session metadata key carrying the purchasing account.
pub const METADATA_ACCOUNT_ID: &str = "account_id";

/// Session metadata key carrying the purchased plan.
pub const METADATA_PLAN_ID: &str = "plan_id";

/// Default maximum age of a signed webhook, in seconds.
pub const DEFAULT_SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Request to create a processor customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCustomerRequest {
    pub account_id: String,
    pub email: String,
}

/// Who is buying what. Written into session metadata and read back on
/// completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub account_id: String,
    pub plan: PlanId,
}

impl CheckoutMetadata {
    #[must_use]
    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            (METADATA_ACCOUNT_ID.to_string(), self.account_id.clone()),
            (METADATA_PLAN_ID.to_string(), self.plan.as_str().to_string()),
        ])
    }
}

/// Request to create a hosted checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    pub customer_ref: String,
    pub price_ref: String,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: CheckoutMetadata,
}

/// Request to create a reusable payment link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentLinkRequest {
    pub price_ref: String,
    pub metadata: CheckoutMetadata,
}

/// A created checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutSession {
    pub id: String,
    /// URL to redirect the customer to.
    pub url: String,
}

/// A created payment link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentLink {
    pub id: String,
    pub url: String,
}

/// Payment state of a checkout session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Paid,
    Unpaid,
    NoPaymentRequired,
}

impl PaymentStatus {
    /// Map the processor's status string. Unknown values count as unpaid.
    #[must_use]
    pub fn from_stripe(status: &str) -> Self {
        match status {
            "paid" => Self::Paid,
            "no_payment_required" => Self::NoPaymentRequired,
            _ => Self::Unpaid,
        }
    }

    /// Whether the session has settled and may be granted.
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Paid | Self::NoPaymentRequired)
    }
}

/// A checkout session as reported by the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedSession {
    pub id: String,
    pub payment_status: PaymentStatus,
    pub metadata: HashMap<String, String>,
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub customer_email: Option<String>,
}

impl RetrievedSession {
    #[must_use]
    pub fn metadata_account_id(&self) -> Option<&str> {
        self.metadata.get(METADATA_ACCOUNT_ID).map(String::as_str)
    }

    #[must_use]
    pub fn metadata_plan(&self) -> Option<&str> {
        self.metadata.get(METADATA_PLAN_ID).map(String::as_str)
    }
}

/// A subscription as reported by the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedSubscription {
    pub id: String,
    pub status: SubscriptionStatus,
    /// Price of the first subscription item.
    pub price_ref: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
}

/// Outbound calls to the payment processor.
///
/// Implementations report transport and processor failures as
/// [`BillingError::GatewayUnavailable`].
pub trait PaymentGateway: Send + Sync {
    /// Create a customer and return its reference.
    fn create_customer(
        &self,
        request: CreateCustomerRequest,
    ) -> impl Future<Output = Result<String>> + Send;

    fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> impl Future<Output = Result<CheckoutSession>> + Send;

    fn create_payment_link(
        &self,
        request: PaymentLinkRequest,
    ) -> impl Future<Output = Result<PaymentLink>> + Send;

    fn retrieve_session(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<RetrievedSession>> + Send;

    fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> impl Future<Output = Result<RetrievedSubscription>> + Send;
}

/// A payment gateway that may not be configured.
#[derive(Debug, Clone)]
pub enum GatewayHandle<G> {
    Configured(G),
    Unconfigured,
}

impl<G> Default for GatewayHandle<G> {
    fn default() -> Self {
        Self::Unconfigured
    }
}

impl<G> GatewayHandle<G> {
    #[must_use]
    pub fn is_configured(&self) -> bool {
        matches!(self, Self::Configured(_))
    }

    /// Borrow the gateway, or fail with `GatewayNotConfigured`.
    pub fn require(&self) -> Result<&G> {
        match self {
            Self::Configured(gateway) => Ok(gateway),
            Self::Unconfigured => Err(BillingError::GatewayNotConfigured),
        }
    }
}

impl<G> From<Option<G>> for GatewayHandle<G> {
    fn from(gateway: Option<G>) -> Self {
        gateway.map_or(Self::Unconfigured, Self::Configured)
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Verifies `Stripe-Signature` headers.
///
/// The header carries `t=<unix seconds>` and one or more `v1=<hex>` entries.
/// Each `v1` is an HMAC-SHA256 over `"<t>.<raw body>"` keyed with the
/// endpoint secret. The secret is held as a [`SecretString`] and never
/// appears in debug output.
pub struct StripeSignatureVerifier {
    secret: SecretString,
    tolerance_secs: i64,
}

impl StripeSignatureVerifier {
    #[must_use]
    pub fn new(secret: impl Into<SecretString>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: DEFAULT_SIGNATURE_TOLERANCE_SECS,
        }
    }

    /// Override the accepted clock skew.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs.max(0);
        self
    }

    /// Verify `header` against the raw request body.
    pub fn verify(&self, payload: &[u8], header: &str) -> Result<()> {
        self.verify_at(payload, header, Utc::now().timestamp())
    }

    /// Verify as of the given unix time.
    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> Result<()> {
        let parts = parse_signature_header(header)?;

        if now.abs_diff(parts.timestamp) > self.tolerance_secs.unsigned_abs() {
            return Err(signature_error("timestamp outside tolerance"));
        }

        let expected = self.compute(parts.timestamp, payload)?;
        let matched = parts.signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|provided| expected.as_slice().ct_eq(&provided).unwrap_u8() == 1)
                .unwrap_or(false)
        });

        if !matched {
            return Err(signature_error("no matching v1 signature"));
        }
        Ok(())
    }

    /// Build a header value for `payload` signed at `timestamp`.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String> {
        let signature = self.compute(timestamp, payload)?;
        Ok(format!("t={},v1={}", timestamp, hex::encode(signature)))
    }

    fn compute(&self, timestamp: i64, payload: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| signature_error("invalid signing key"))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl std::fmt::Debug for StripeSignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeSignatureVerifier")
            .field("secret", &"[REDACTED]")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

struct SignatureParts {
    timestamp: i64,
    signatures: Vec<String>,
}

fn parse_signature_header(header: &str) -> Result<SignatureParts> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| signature_error("malformed signature header"))?;

        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => signatures.push(value.trim().to_string()),
            // Other schemes are ignored
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| signature_error("missing timestamp"))?;
    if signatures.is_empty() {
        return Err(signature_error("missing v1 signature"));
    }
    Ok(SignatureParts { timestamp, signatures })
}

fn signature_error(reason: &str) -> BillingError {
    BillingError::Signature {
        reason: reason.to_string(),
    }
}

/// In-memory gateway for tests.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tokio::sync::RwLock;

    /// Records outbound calls and serves sessions and subscriptions from memory.
    #[derive(Default)]
    pub struct MockPaymentGateway {
        counter: AtomicU64,
        failing: AtomicBool,
        customers: RwLock<Vec<CreateCustomerRequest>>,
        sessions: RwLock<HashMap<String, RetrievedSession>>,
        subscriptions: RwLock<HashMap<String, RetrievedSubscription>>,
    }

    impl MockPaymentGateway {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every call fail with `GatewayUnavailable`.
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub async fn customers(&self) -> Vec<CreateCustomerRequest> {
            self.customers.read().await.clone()
        }

        pub async fn insert_session(&self, session: RetrievedSession) {
            self.sessions.write().await.insert(session.id.clone(), session);
        }

        pub async fn insert_subscription(&self, subscription: RetrievedSubscription) {
            self.subscriptions
                .write()
                .await
                .insert(subscription.id.clone(), subscription);
        }

        /// Mark a created session paid and attach a subscription to it.
        pub async fn complete_session(&self, session_id: &str, subscription_ref: Option<&str>) {
            if let Some(session) = self.sessions.write().await.get_mut(session_id) {
                session.payment_status = PaymentStatus::Paid;
                session.subscription_ref = subscription_ref.map(str::to_string);
            }
        }

        fn next_id(&self, prefix: &str) -> String {
            format!("{}_test_{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst))
        }

        fn check(&self, operation: &'static str) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(BillingError::GatewayUnavailable {
                    operation,
                    message: "mock gateway failure".to_string(),
                });
            }
            Ok(())
        }
    }

    impl PaymentGateway for MockPaymentGateway {
        async fn create_customer(&self, request: CreateCustomerRequest) -> Result<String> {
            self.check("create_customer")?;
            let id = self.next_id("cus");
            self.customers.write().await.push(request);
            Ok(id)
        }

        async fn create_checkout_session(
            &self,
            request: CheckoutSessionRequest,
        ) -> Result<CheckoutSession> {
            self.check("create_checkout_session")?;
            let id = self.next_id("cs");
            self.insert_session(RetrievedSession {
                id: id.clone(),
                payment_status: PaymentStatus::Unpaid,
                metadata: request.metadata.to_map(),
                customer_ref: Some(request.customer_ref),
                subscription_ref: None,
                customer_email: None,
            })
            .await;
            Ok(CheckoutSession {
                url: format!("https://checkout.stripe.com/c/pay/{}", id),
                id,
            })
        }

        async fn create_payment_link(&self, _request: PaymentLinkRequest) -> Result<PaymentLink> {
            self.check("create_payment_link")?;
            let id = self.next_id("plink");
            Ok(PaymentLink {
                url: format!("https://buy.stripe.com/{}", id),
                id,
            })
        }

        async fn retrieve_session(&self, session_id: &str) -> Result<RetrievedSession> {
            self.check("retrieve_session")?;
            self.sessions
                .read()
                .await
                .get(session_id)
                .cloned()
                .ok_or_else(|| BillingError::NotFound {
                    resource: "checkout_session",
                    id: session_id.to_string(),
                })
        }

        async fn retrieve_subscription(&self, subscription_id: &str) -> Result<RetrievedSubscription> {
            self.check("retrieve_subscription")?;
            self.subscriptions
                .read()
                .await
                .get(subscription_id)
                .cloned()
                .ok_or_else(|| BillingError::NotFound {
                    resource: "subscription",
                    id: subscription_id.to_string(),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::MockPaymentGateway;
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const PAYLOAD: &[u8] = br#"{"id":"evt_123","type":"invoice.paid","data":{"object":{}}}"#;

    #[test]
    fn test_parse_signature_header() {
        let parts = parse_signature_header("t=1234567890,v1=abc123,v1=def456,v0=ignored").unwrap();
        assert_eq!(parts.timestamp, 1234567890);
        assert_eq!(parts.signatures, vec!["abc123", "def456"]);
    }

    #[test]
    fn test_parse_signature_header_invalid() {
        assert!(parse_signature_header("invalid").is_err());
        assert!(parse_signature_header("v1=abc").is_err());
        assert!(parse_signature_header("t=123").is_err());
    }

    #[test]
    fn test_verify_valid_signature() {
        let verifier = StripeSignatureVerifier::new(SECRET);
        let now = Utc::now().timestamp();
        let header = verifier.sign(PAYLOAD, now).unwrap();
        assert!(verifier.verify(PAYLOAD, &header).is_ok());
    }

    #[test]
    fn test_verify_accepts_any_matching_v1() {
        let verifier = StripeSignatureVerifier::new(SECRET);
        let header = verifier.sign(PAYLOAD, 1_700_000_000).unwrap();
        let rotated = header.replacen("v1=", "v1=00ff,v1=", 1);
        assert!(verifier.verify_at(PAYLOAD, &rotated, 1_700_000_010).is_ok());
    }

    #[test]
    fn test_verify_rejects_wrong_secret_and_tampering() {
        let verifier = StripeSignatureVerifier::new(SECRET);
        let other = StripeSignatureVerifier::new("whsec_other");
        let header = other.sign(PAYLOAD, 1_700_000_000).unwrap();
        assert!(matches!(
            verifier.verify_at(PAYLOAD, &header, 1_700_000_000),
            Err(BillingError::Signature { .. })
        ));

        let header = verifier.sign(PAYLOAD, 1_700_000_000).unwrap();
        assert!(verifier.verify_at(b"{}", &header, 1_700_000_000).is_err());
        assert!(verifier.verify_at(PAYLOAD, "t=1700000000,v1=not_hex", 1_700_000_000).is_err());
    }

    #[test]
    fn test_verify_rejects_old_timestamp() {
        let verifier = StripeSignatureVerifier::new(SECRET);
        let header = verifier.sign(PAYLOAD, 1_700_000_000).unwrap();

        assert!(verifier.verify_at(PAYLOAD, &header, 1_700_000_300).is_ok());
        assert!(verifier.verify_at(PAYLOAD, &header, 1_700_000_301).is_err());
        assert!(verifier.verify_at(PAYLOAD, &header, 1_699_999_699).is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let verifier = StripeSignatureVerifier::new(SECRET);
        let debug = format!("{:?}", verifier);
        assert!(!debug.contains(SECRET));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_gateway_handle() {
        let handle: GatewayHandle<MockPaymentGateway> = GatewayHandle::Unconfigured;
        assert!(!handle.is_configured());
        assert_eq!(handle.require().err(), Some(BillingError::GatewayNotConfigured));

        let handle = GatewayHandle::from(Some(MockPaymentGateway::new()));
        assert!(handle.require().is_ok());
    }

    #[test]
    fn test_payment_status() {
        assert!(PaymentStatus::from_stripe("paid").is_settled());
        assert!(PaymentStatus::from_stripe("no_payment_required").is_settled());
        assert!(!PaymentStatus::from_stripe("unpaid").is_settled());
        assert!(!PaymentStatus::from_stripe("something_new").is_settled());
    }

    #[tokio::test]
    async fn test_mock_gateway_sessions() {
        let gateway = MockPaymentGateway::new();
        let session = gateway
            .create_checkout_session(CheckoutSessionRequest {
                customer_ref: "cus_1".to_string(),
                price_ref: "price_pro_monthly".to_string(),
                success_url: "https://example.com/ok".to_string(),
                cancel_url: "https://example.com/cancel".to_string(),
                metadata: CheckoutMetadata {
                    account_id: "user_1".to_string(),
                    plan: PlanId::Pro,
                },
            })
            .await
            .unwrap();

        let retrieved = gateway.retrieve_session(&session.id).await.unwrap();
        assert_eq!(retrieved.payment_status, PaymentStatus::Unpaid);
        assert_eq!(retrieved.metadata_account_id(), Some("user_1"));
        assert_eq!(retrieved.metadata_plan(), Some("pro"));

        gateway.complete_session(&session.id, Some("sub_1")).await;
        let retrieved = gateway.retrieve_session(&session.id).await.unwrap();
        assert_eq!(retrieved.payment_status, PaymentStatus::Paid);

        gateway.set_failing(true);
        assert!(matches!(
            gateway.retrieve_session(&session.id).await,
            Err(BillingError::GatewayUnavailable { .. })
        ));
    }
}
