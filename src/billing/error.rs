//! Billing-specific error types.
//!
//! Every fallible billing operation returns [`BillingError`] so callers can
//! tell client mistakes (bad codes, bad signatures) from failures the payment
//! processor should retry. Convert into [`TidemarkError`](crate::TidemarkError)
//! at the HTTP boundary.

use chrono::{DateTime, Utc};
use std::fmt;

/// Result alias for billing operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Why a metered top-up was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopUpRejection {
    /// The account's plan is not eligible for top-ups.
    NotEligible,
    /// The paid period has already ended.
    PeriodEnded,
    /// The account still has minutes left.
    MinutesRemaining,
}

impl TopUpRejection {
    /// Stable machine-readable reason.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotEligible => "not_eligible",
            Self::PeriodEnded => "period_ended",
            Self::MinutesRemaining => "minutes_remaining",
        }
    }
}

/// Billing-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Client errors
    /// Input failed validation (malformed code, bad plan, negative duration).
    Validation { field: String, reason: String },
    /// The referenced resource does not exist.
    NotFound { resource: &'static str, id: String },
    /// The redemption code was already consumed.
    AlreadyUsed { code: String },
    /// The redemption code is past its expiry.
    Expired { code: String, expired_at: DateTime<Utc> },
    /// The caller may not act on the referenced resource.
    Unauthorized { reason: String },
    /// Top-up preconditions were not met.
    TopUpRejected { reason: TopUpRejection },
    /// Webhook signature or timestamp check failed.
    Signature { reason: String },

    // Reconciliation errors
    /// No account matched the event's identifiers.
    UserResolution { event_kind: &'static str, detail: String },
    /// The event's plan reference did not resolve to a catalog entry.
    UnknownPlan { reference: String },
    /// The account changed underneath us more times than we retry.
    ConcurrentModification { account_id: String },

    // Infrastructure errors
    /// The payment processor could not be reached or failed.
    GatewayUnavailable { operation: &'static str, message: String },
    /// No payment processor is configured.
    GatewayNotConfigured,
    /// The backing store failed.
    Storage { message: String },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { field, reason } => write!(f, "Invalid {}: {}", field, reason),
            Self::NotFound { resource, id } => write!(f, "{} not found: {}", resource, id),
            Self::AlreadyUsed { code } => write!(f, "Code {} has already been used", code),
            Self::Expired { code, expired_at } => {
                write!(f, "Code {} expired at {}", code, expired_at.to_rfc3339())
            }
            Self::Unauthorized { reason } => write!(f, "Unauthorized: {}", reason),
            Self::TopUpRejected { reason } => match reason {
                TopUpRejection::NotEligible => write!(f, "Top-up is only available on metered plans"),
                TopUpRejection::PeriodEnded => write!(f, "Top-up unavailable: the paid period has ended"),
                TopUpRejection::MinutesRemaining => {
                    write!(f, "Top-up unavailable: minutes remain on the current balance")
                }
            },
            Self::Signature { reason } => write!(f, "Webhook signature rejected: {}", reason),
            Self::UserResolution { event_kind, detail } => {
                write!(f, "Could not resolve account for {} event: {}", event_kind, detail)
            }
            Self::UnknownPlan { reference } => write!(f, "Unknown plan reference: {}", reference),
            Self::ConcurrentModification { account_id } => {
                write!(f, "Concurrent modification of account {}, retry", account_id)
            }
            Self::GatewayUnavailable { operation, message } => {
                write!(f, "Payment gateway error during {}: {}", operation, message)
            }
            Self::GatewayNotConfigured => write!(f, "Payment gateway is not configured"),
            Self::Storage { message } => write!(f, "Storage error: {}", message),
        }
    }
}

impl std::error::Error for BillingError {}

impl From<BillingError> for crate::error::TidemarkError {
    fn from(err: BillingError) -> Self {
        match &err {
            BillingError::NotFound { .. } => crate::error::TidemarkError::NotFound(err.to_string()),

            BillingError::Unauthorized { .. } => {
                crate::error::TidemarkError::Unauthorized(err.to_string())
            }

            BillingError::TopUpRejected { .. } => {
                crate::error::TidemarkError::Forbidden(err.to_string())
            }

            BillingError::Validation { .. }
            | BillingError::AlreadyUsed { .. }
            | BillingError::Expired { .. }
            | BillingError::Signature { .. } => {
                crate::error::TidemarkError::BadRequest(err.to_string())
            }

            BillingError::GatewayUnavailable { .. } | BillingError::GatewayNotConfigured => {
                crate::error::TidemarkError::ServiceUnavailable(err.to_string())
            }

            BillingError::UserResolution { .. }
            | BillingError::UnknownPlan { .. }
            | BillingError::ConcurrentModification { .. }
            | BillingError::Storage { .. } => crate::error::TidemarkError::Internal(err.to_string()),
        }
    }
}

impl BillingError {
    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn storage(message: impl fmt::Display) -> Self {
        Self::Storage {
            message: message.to_string(),
        }
    }

    /// Stable machine-readable error code for API payloads.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { field, .. } if field == "code" => "invalid_format",
            Self::Validation { .. } => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyUsed { .. } => "already_used",
            Self::Expired { .. } => "expired",
            Self::Unauthorized { .. } => "unauthorized",
            Self::TopUpRejected { reason } => reason.as_str(),
            Self::Signature { .. } => "signature_error",
            Self::UserResolution { .. } => "user_resolution_error",
            Self::UnknownPlan { .. } => "unknown_plan",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::GatewayUnavailable { .. } => "gateway_unavailable",
            Self::GatewayNotConfigured => "gateway_not_configured",
            Self::Storage { .. } => "storage_error",
        }
    }

    /// Returns true if this error was caused by the caller.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::NotFound { .. }
                | Self::AlreadyUsed { .. }
                | Self::Expired { .. }
                | Self::Unauthorized { .. }
                | Self::TopUpRejected { .. }
                | Self::Signature { .. }
        )
    }

    /// Returns true if this error is a server-side failure.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Returns true if the same request may succeed when retried unchanged.
    ///
    /// Resolution failures are not retryable: they need an operator to fix
    /// the account or catalog first.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. }
                | Self::GatewayUnavailable { .. }
                | Self::Storage { .. }
        )
    }
}
