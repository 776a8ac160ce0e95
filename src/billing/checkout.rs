//! Checkout sessions and manual verification.
//!
//! Creates hosted checkout sessions and payment links for purchasable plans,
//! and lets a client confirm a finished session directly with the processor
//! when the webhook has not arrived yet. Verification and the webhook share
//! an idempotency key, so the plan is granted exactly once whichever lands
//! first.

use std::sync::Arc;

use url::Url;

use super::audit::{BillingAuditEvent, BillingAuditLogger, TracingAuditLogger};
use super::entitlement::{Entitlement, PlanId};
use super::error::{BillingError, Result};
use super::events::{CausalEvent, ManualVerify, PlanRef};
use super::gateway::{
    CheckoutMetadata, CheckoutSession, CheckoutSessionRequest, CreateCustomerRequest,
    GatewayHandle, PaymentGateway, PaymentLink, PaymentLinkRequest,
};
use super::plans::PlanConfig;
use super::reconcile::{ReconcileOutcome, ReconciliationEngine};
use super::storage::AccountStore;
use super::validation::validate_account_id;

/// Configuration for checkout sessions.
#[derive(Debug, Clone, Default)]
pub struct CheckoutConfig {
    /// Allowed domains for redirect URLs (empty = allow any HTTPS URL).
    pub allowed_redirect_domains: Vec<String>,
    /// Allow plans flagged `non_production` to be purchased.
    pub allow_non_production_plans: bool,
}

impl CheckoutConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set allowed redirect domains.
    ///
    /// Subdomains of an allowed domain are accepted too.
    #[must_use]
    pub fn allowed_redirect_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_redirect_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn add_allowed_domain(mut self, domain: impl Into<String>) -> Self {
        self.allowed_redirect_domains.push(domain.into());
        self
    }

    #[must_use]
    pub fn allow_non_production_plans(mut self, allow: bool) -> Self {
        self.allow_non_production_plans = allow;
        self
    }

    /// Validate a redirect URL against the allowed domains.
    ///
    /// The URL must parse, use HTTPS and, when a domain list is configured,
    /// point at one of those domains.
    pub fn validate_redirect_url(&self, url: &str) -> Result<()> {
        let parsed = Url::parse(url)
            .map_err(|e| BillingError::validation("redirect_url", format!("invalid URL: {}", e)))?;

        if parsed.scheme() != "https" {
            return Err(BillingError::validation("redirect_url", "URL must use HTTPS"));
        }

        if !self.allowed_redirect_domains.is_empty() {
            let host = parsed
                .host_str()
                .ok_or_else(|| BillingError::validation("redirect_url", "URL must have a host"))?;

            let domain_allowed = self
                .allowed_redirect_domains
                .iter()
                .any(|allowed| host == allowed || host.ends_with(&format!(".{}", allowed)));

            if !domain_allowed {
                return Err(BillingError::validation(
                    "redirect_url",
                    format!("domain '{}' is not allowed", host),
                ));
            }
        }

        Ok(())
    }
}

/// Request to start a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub plan: PlanId,
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutRequest {
    #[must_use]
    pub fn new(plan: PlanId, success_url: impl Into<String>, cancel_url: impl Into<String>) -> Self {
        Self {
            plan,
            success_url: success_url.into(),
            cancel_url: cancel_url.into(),
        }
    }
}

/// Checkout session management.
pub struct CheckoutManager<S, G, A = TracingAuditLogger>
where
    S: AccountStore,
    G: PaymentGateway,
    A: BillingAuditLogger,
{
    engine: Arc<ReconciliationEngine<S, A>>,
    gateway: GatewayHandle<G>,
    config: CheckoutConfig,
}

impl<S, G, A> CheckoutManager<S, G, A>
where
    S: AccountStore,
    G: PaymentGateway,
    A: BillingAuditLogger,
{
    #[must_use]
    pub fn new(
        engine: Arc<ReconciliationEngine<S, A>>,
        gateway: GatewayHandle<G>,
        config: CheckoutConfig,
    ) -> Self {
        Self { engine, gateway, config }
    }

    pub fn gateway(&self) -> &GatewayHandle<G> {
        &self.gateway
    }

    /// Create a hosted checkout session for `account_id`.
    ///
    /// Creates and links a processor customer first if the account has none.
    pub async fn create_checkout_session(
        &self,
        account_id: &str,
        request: CheckoutRequest,
    ) -> Result<CheckoutSession> {
        validate_account_id(account_id)?;
        self.config.validate_redirect_url(&request.success_url)?;
        self.config.validate_redirect_url(&request.cancel_url)?;

        let (plan, price_ref) = self.purchasable(request.plan)?;
        let gateway = self.gateway.require()?;
        let customer_ref = self.ensure_customer(gateway, account_id).await?;

        let session = gateway
            .create_checkout_session(CheckoutSessionRequest {
                customer_ref,
                price_ref: price_ref.to_string(),
                success_url: request.success_url,
                cancel_url: request.cancel_url,
                metadata: CheckoutMetadata {
                    account_id: account_id.to_string(),
                    plan: plan.id,
                },
            })
            .await?;

        tracing::info!(
            account_id = %account_id,
            plan = %plan.id,
            session_id = %session.id,
            "checkout session created"
        );
        self.engine
            .audit()
            .log(BillingAuditEvent::CheckoutCreated {
                account_id: account_id.to_string(),
                plan: plan.id,
                session_id: session.id.clone(),
            })
            .await;

        Ok(session)
    }

    /// Create a payment link tagged with the account and plan.
    pub async fn create_payment_link(&self, account_id: &str, plan: PlanId) -> Result<PaymentLink> {
        validate_account_id(account_id)?;
        let (plan, price_ref) = self.purchasable(plan)?;
        let gateway = self.gateway.require()?;

        // Links are only issued to existing accounts.
        self.engine.get_account(account_id).await?;

        let link = gateway
            .create_payment_link(PaymentLinkRequest {
                price_ref: price_ref.to_string(),
                metadata: CheckoutMetadata {
                    account_id: account_id.to_string(),
                    plan: plan.id,
                },
            })
            .await?;

        tracing::info!(account_id = %account_id, plan = %plan.id, link_id = %link.id, "payment link created");
        Ok(link)
    }

    /// Confirm a checkout session with the processor and grant its plan.
    ///
    /// The session is fetched before anything is written. A session already
    /// granted by its webhook returns the current entitlement unchanged.
    pub async fn verify_checkout(&self, session_id: &str, account_id: &str) -> Result<Entitlement> {
        validate_account_id(account_id)?;
        if session_id.trim().is_empty() {
            return Err(BillingError::validation("session_id", "session_id cannot be empty"));
        }
        let gateway = self.gateway.require()?;

        let session = gateway.retrieve_session(session_id).await?;
        if session.metadata_account_id() != Some(account_id) {
            tracing::warn!(
                account_id = %account_id,
                session_id = %session_id,
                "checkout session belongs to another account"
            );
            return Err(BillingError::Unauthorized {
                reason: "checkout session does not belong to this account".to_string(),
            });
        }
        if !session.payment_status.is_settled() {
            return Err(BillingError::validation("session_id", "checkout session is not paid"));
        }

        let plan = match session.metadata_plan() {
            Some(plan) => PlanRef::from_parts(Some(plan), None),
            None => match &session.subscription_ref {
                Some(subscription_ref) => {
                    let subscription = gateway.retrieve_subscription(subscription_ref).await?;
                    PlanRef::from_parts(None, subscription.price_ref.as_deref())
                }
                None => PlanRef::Unspecified,
            },
        };

        let outcome = self
            .engine
            .apply(&CausalEvent::ManualVerify(ManualVerify {
                session_id: session.id.clone(),
                account_id: account_id.to_string(),
                plan,
                customer_ref: session.customer_ref.clone(),
                subscription_ref: session.subscription_ref.clone(),
            }))
            .await?;

        match outcome {
            ReconcileOutcome::Applied { entitlement, .. }
            | ReconcileOutcome::Unchanged { entitlement, .. } => Ok(entitlement),
            ReconcileOutcome::AlreadyApplied { .. } => {
                Ok(self.engine.get_account(account_id).await?.entitlement)
            }
            ReconcileOutcome::Deferred { .. } => Err(BillingError::validation(
                "session_id",
                "checkout session is not paid",
            )),
        }
    }

    fn purchasable(&self, plan: PlanId) -> Result<(&PlanConfig, &str)> {
        let config = self.engine.catalog().require(plan)?;
        let price_ref = match (&config.price_ref, config.is_purchasable()) {
            (Some(price_ref), true) => price_ref.as_str(),
            _ => {
                return Err(BillingError::validation(
                    "plan",
                    format!("plan {} cannot be purchased", plan),
                ));
            }
        };
        if config.non_production && !self.config.allow_non_production_plans {
            return Err(BillingError::validation(
                "plan",
                format!("plan {} is not available", plan),
            ));
        }
        Ok((config, price_ref))
    }

    async fn ensure_customer(&self, gateway: &G, account_id: &str) -> Result<String> {
        let account = self.engine.get_account(account_id).await?;
        if let Some(customer_ref) = account.entitlement.external_customer_ref {
            return Ok(customer_ref);
        }

        let customer_ref = gateway
            .create_customer(CreateCustomerRequest {
                account_id: account.id,
                email: account.email,
            })
            .await?;
        self.engine.link_customer(account_id, &customer_ref).await?;
        Ok(customer_ref)
    }
}
