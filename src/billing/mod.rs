//! Entitlement reconciliation.
//!
//! Every event that changes what an account may use flows through one
//! [`ReconciliationEngine`]: payment processor webhooks, manual checkout
//! verification, redemption codes, usage and top-ups. The engine resolves
//! the account and plan, applies the grant policy and commits the new
//! entitlement together with the event's idempotency key.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tidemark::billing::{
//!     CodeRegistry, MemoryAccountStore, PlanCatalog, PlanId, ReconciliationEngine, UsageMeter,
//! };
//!
//! let engine = Arc::new(ReconciliationEngine::new(
//!     MemoryAccountStore::new(),
//!     PlanCatalog::standard(),
//! ));
//! engine.create_account("user_1", "user1@example.com").await?;
//!
//! let codes = CodeRegistry::new(engine.clone());
//! let code = codes.generate(PlanId::Pro, "admin", None).await?;
//! codes.redeem(&code.code, "user_1").await?;
//!
//! let meter = UsageMeter::new(engine.clone());
//! meter.consume("user_1", 125.0).await?;
//! ```

pub mod audit;
pub mod checkout;
pub mod codes;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod gateway;
pub mod grant;
pub mod plans;
pub mod reconcile;
#[cfg(feature = "database")]
pub mod sea_orm_store;
pub mod storage;
pub mod usage;
pub mod validation;
pub mod webhook;

// Plan exports
pub use plans::{CodeWindow, MinuteAllotment, PlanBuilder, PlanCatalog, PlanCatalogBuilder, PlanConfig};

// Entitlement exports
pub use entitlement::{Account, Entitlement, EntitlementStatus, PlanId, UNLIMITED_MINUTES, UsageStats};

// Event exports
pub use events::{
    AccountRef, BillingReason, CausalEvent, CheckoutCompleted, CodeRedeemed, InvoiceFailed,
    InvoicePaid, ManualVerify, PlanRef, SubscriptionDeleted, SubscriptionStatus,
    SubscriptionUpdated,
};

// Grant exports
pub use grant::{GrantKind, apply_cancellation, apply_grant};

// Storage exports
pub use storage::{AccountStore, MemoryAccountStore, RedemptionCommit, SaveOutcome};

// Engine exports
pub use reconcile::{ReconcileOutcome, ReconciliationEngine};

// Code exports
pub use codes::{Code, CodeRegistry, CodeStats, CodeValidation, FormatCheck, PlanCodeStats, Redemption};

// Usage exports
pub use usage::{ConsumeOutcome, UsageMeter, UsageSummary};

// Gateway exports
pub use gateway::{
    CheckoutMetadata, CheckoutSession, CheckoutSessionRequest, CreateCustomerRequest,
    GatewayHandle, PaymentGateway, PaymentLink, PaymentLinkRequest, PaymentStatus,
    RetrievedSession, RetrievedSubscription, StripeSignatureVerifier,
};

// Checkout exports
pub use checkout::{CheckoutConfig, CheckoutManager, CheckoutRequest};

// Webhook exports
pub use webhook::{WebhookEvent, WebhookOutcome, WebhookProcessor, WebhookResponse, parse_event};

// Audit exports
pub use audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger, TracingAuditLogger};

// Error exports
pub use error::{BillingError, TopUpRejection};

// SeaORM storage exports
#[cfg(feature = "database")]
pub use sea_orm_store::SeaOrmAccountStore;

// Test exports
#[cfg(any(test, feature = "test-billing"))]
pub use audit::test::RecordingAuditLogger;

#[cfg(any(test, feature = "test-billing"))]
pub use gateway::test::MockPaymentGateway;
