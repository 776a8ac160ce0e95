//! Input validation for billing operations.
//!
//! Checks identifiers and free-form inputs before they reach storage or the
//! payment processor.

use super::error::{BillingError, Result};

/// Maximum length for account IDs.
const MAX_ACCOUNT_ID_LENGTH: usize = 256;

/// Maximum length for code issuers.
const MAX_ISSUER_LENGTH: usize = 128;

/// Custom code prefixes are 2 to 8 alphanumerics.
const MIN_PREFIX_LENGTH: usize = 2;
const MAX_PREFIX_LENGTH: usize = 8;

/// Validate an account ID.
///
/// Account IDs must:
/// - Not be empty
/// - Not exceed 256 characters
/// - Contain only alphanumeric characters, underscores, and hyphens
pub fn validate_account_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(BillingError::validation("account_id", "account_id cannot be empty"));
    }

    if id.len() > MAX_ACCOUNT_ID_LENGTH {
        return Err(BillingError::validation(
            "account_id",
            format!("account_id exceeds maximum length of {}", MAX_ACCOUNT_ID_LENGTH),
        ));
    }

    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(BillingError::validation(
            "account_id",
            format!(
                "account_id {} contains invalid characters (only alphanumeric, underscore, and hyphen allowed)",
                sanitize_for_error(id)
            ),
        ));
    }

    Ok(())
}

/// Validate the issuer recorded on generated codes.
pub fn validate_issuer(issuer: &str) -> Result<()> {
    let trimmed = issuer.trim();
    if trimmed.is_empty() {
        return Err(BillingError::validation("issuer", "issuer cannot be empty"));
    }
    if trimmed.len() > MAX_ISSUER_LENGTH {
        return Err(BillingError::validation(
            "issuer",
            format!("issuer exceeds maximum length of {}", MAX_ISSUER_LENGTH),
        ));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(BillingError::validation("issuer", "issuer contains control characters"));
    }
    Ok(())
}

/// Normalize and validate a custom code prefix.
///
/// Returns the uppercase prefix.
pub fn validate_code_prefix(prefix: &str) -> Result<String> {
    let normalized = prefix.trim().to_ascii_uppercase();
    if !is_code_prefix(&normalized) {
        return Err(BillingError::validation(
            "prefix",
            format!(
                "prefix must be {}-{} letters or digits, got {}",
                MIN_PREFIX_LENGTH,
                MAX_PREFIX_LENGTH,
                sanitize_for_error(prefix)
            ),
        ));
    }
    Ok(normalized)
}

/// Whether `prefix` is a well-formed uppercase code prefix.
pub(crate) fn is_code_prefix(prefix: &str) -> bool {
    (MIN_PREFIX_LENGTH..=MAX_PREFIX_LENGTH).contains(&prefix.len())
        && prefix
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Validate a consumed duration in seconds.
pub fn validate_seconds(seconds: f64) -> Result<()> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(BillingError::validation(
            "seconds",
            "seconds must be a non-negative number",
        ));
    }
    Ok(())
}

/// Truncate a string for inclusion in error messages.
fn truncate_for_error(s: &str) -> String {
    const MAX_ERROR_LEN: usize = 32;
    if s.len() <= MAX_ERROR_LEN {
        s.to_string()
    } else {
        let cut = s
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|i| *i <= MAX_ERROR_LEN)
            .last()
            .unwrap_or(0);
        format!("{}...", &s[..cut])
    }
}

/// Remove characters that could be dangerous in logs or responses.
fn sanitize_for_error(s: &str) -> String {
    truncate_for_error(s)
        .chars()
        .map(|c| if c.is_ascii_graphic() { c } else { '?' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_account_id() {
        assert!(validate_account_id("user_123").is_ok());
        assert!(validate_account_id("a-b-c").is_ok());
        assert!(validate_account_id("").is_err());
        assert!(validate_account_id("user<script>").is_err());
        assert!(validate_account_id(&"a".repeat(257)).is_err());
    }

    #[test]
    fn test_validate_issuer() {
        assert!(validate_issuer("admin@example.com").is_ok());
        assert!(validate_issuer("   ").is_err());
        assert!(validate_issuer("bad\u{0007}issuer").is_err());
    }

    #[test]
    fn test_validate_code_prefix() {
        assert_eq!(validate_code_prefix(" promo ").unwrap(), "PROMO");
        assert_eq!(validate_code_prefix("x9").unwrap(), "X9");
        assert!(validate_code_prefix("A").is_err());
        assert!(validate_code_prefix("TOOLONGPFX").is_err());
        assert!(validate_code_prefix("AB-C").is_err());
    }

    #[test]
    fn test_validate_seconds() {
        assert!(validate_seconds(0.0).is_ok());
        assert!(validate_seconds(125.5).is_ok());
        assert!(validate_seconds(-1.0).is_err());
        assert!(validate_seconds(f64::NAN).is_err());
        assert!(validate_seconds(f64::INFINITY).is_err());
    }

    #[test]
    fn test_sanitize_for_error() {
        assert_eq!(sanitize_for_error("ab\ncd"), "ab?cd");
        assert!(sanitize_for_error(&"x".repeat(100)).ends_with("..."));
    }
}
