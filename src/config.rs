use std::fmt::Display;
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::billing::codes::{DEFAULT_CODE_VALIDITY_DAYS, MAX_CODES_PER_BATCH};
use crate::billing::gateway::DEFAULT_SIGNATURE_TOLERANCE_SECS;
use crate::billing::{CheckoutConfig, PlanCatalog, PlanId, StripeSignatureVerifier};
use crate::error::TidemarkError;

/// Main configuration for a Tidemark deployment
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub billing: BillingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

/// Billing settings: processor references, code limits and checkout policy.
#[derive(Debug, Deserialize, Serialize)]
pub struct BillingConfig {
    /// Webhook endpoint secret. Never serialized.
    #[serde(skip)]
    pub webhook_secret: Option<SecretString>,
    /// Accepted clock skew for webhook signatures.
    #[serde(default = "default_signature_tolerance")]
    pub signature_tolerance_secs: i64,
    #[serde(default)]
    pub pro_price_ref: Option<String>,
    #[serde(default)]
    pub pro_plus_price_ref: Option<String>,
    #[serde(default)]
    pub test_price_ref: Option<String>,
    #[serde(default = "default_code_validity_days")]
    pub code_validity_days: u32,
    #[serde(default = "default_max_codes_per_batch")]
    pub max_codes_per_batch: u32,
    /// Let checkout sell plans flagged `non_production`.
    #[serde(default)]
    pub allow_non_production_plans: bool,
    /// Domains accepted for checkout redirect URLs (empty = any HTTPS URL).
    #[serde(default)]
    pub allowed_redirect_domains: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            webhook_secret: None,
            signature_tolerance_secs: default_signature_tolerance(),
            pro_price_ref: None,
            pro_plus_price_ref: None,
            test_price_ref: None,
            code_validity_days: default_code_validity_days(),
            max_codes_per_batch: default_max_codes_per_batch(),
            allow_non_production_plans: false,
            allowed_redirect_domains: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

fn default_signature_tolerance() -> i64 {
    DEFAULT_SIGNATURE_TOLERANCE_SECS
}

fn default_code_validity_days() -> u32 {
    DEFAULT_CODE_VALIDITY_DAYS
}

fn default_max_codes_per_batch() -> u32 {
    MAX_CODES_PER_BATCH
}

impl BillingConfig {
    /// The standard catalog with configured price references applied.
    #[must_use]
    pub fn plan_catalog(&self) -> PlanCatalog {
        let mut catalog = PlanCatalog::standard();
        let overrides = [
            (PlanId::Pro, &self.pro_price_ref),
            (PlanId::ProPlus, &self.pro_plus_price_ref),
            (PlanId::Test, &self.test_price_ref),
        ];
        for (plan, price_ref) in overrides {
            if let Some(price_ref) = price_ref {
                catalog.set_price_ref(plan, price_ref.clone());
            }
        }
        catalog
    }

    #[must_use]
    pub fn checkout_config(&self) -> CheckoutConfig {
        CheckoutConfig::new()
            .allowed_redirect_domains(self.allowed_redirect_domains.iter().cloned())
            .allow_non_production_plans(self.allow_non_production_plans)
    }

    /// A verifier for the configured webhook secret, if one is set.
    #[must_use]
    pub fn signature_verifier(&self) -> Option<StripeSignatureVerifier> {
        self.webhook_secret.as_ref().map(|secret| {
            StripeSignatureVerifier::new(secret.expose_secret().to_string())
                .with_tolerance(self.signature_tolerance_secs)
        })
    }
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
    /// Environment values that could not be parsed, reported by `build()`.
    env_errors: Vec<String>,
}

/// Look up `TIDEMARK_{key}`, then `{key}`. Returns the variable name that matched.
fn env_lookup(key: &str) -> Option<(String, String)> {
    let prefixed = format!("TIDEMARK_{}", key);
    if let Ok(value) = std::env::var(&prefixed) {
        return Some((prefixed, value));
    }
    std::env::var(key).ok().map(|value| (key.to_string(), value))
}

/// Booleans accept `true`/`false`, `1`/`0` and `yes`/`no`.
fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            env_errors: Vec::new(),
        }
    }

    fn env_string(&self, key: &str) -> Option<String> {
        env_lookup(key).map(|(_, value)| value)
    }

    fn env_parsed<T>(&mut self, key: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let (name, value) = env_lookup(key)?;
        match value.trim().parse() {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                self.env_errors.push(format!("{}={:?}: {}", name, value, err));
                None
            }
        }
    }

    fn env_flag(&mut self, key: &str) -> Option<bool> {
        let (name, value) = env_lookup(key)?;
        let flag = parse_flag(&value);
        if flag.is_none() {
            self.env_errors.push(format!("{}={:?}: expected a boolean", name, value));
        }
        flag
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.billing.webhook_secret = Some(SecretString::from(secret.into()));
        self
    }

    pub fn with_price_ref(mut self, plan: PlanId, price_ref: impl Into<String>) -> Self {
        let price_ref = Some(price_ref.into());
        match plan {
            PlanId::Pro => self.config.billing.pro_price_ref = price_ref,
            PlanId::ProPlus => self.config.billing.pro_plus_price_ref = price_ref,
            PlanId::Test => self.config.billing.test_price_ref = price_ref,
            PlanId::Free | PlanId::Enterprise => {
                tracing::warn!(plan = %plan, "plan is not sold through checkout, ignoring price ref");
            }
        }
        self
    }

    pub fn with_code_validity_days(mut self, days: u32) -> Self {
        self.config.billing.code_validity_days = days;
        self
    }

    pub fn with_max_codes_per_batch(mut self, max: u32) -> Self {
        self.config.billing.max_codes_per_batch = max;
        self
    }

    pub fn with_non_production_plans(mut self, allow: bool) -> Self {
        self.config.billing.allow_non_production_plans = allow;
        self
    }

    pub fn with_redirect_domain(mut self, domain: impl Into<String>) -> Self {
        self.config.billing.allowed_redirect_domains.push(domain.into());
        self
    }

    /// Load configuration from environment variables with TIDEMARK_ prefix
    ///
    /// Each setting reads `TIDEMARK_{NAME}` and falls back to `{NAME}`. Values
    /// that do not parse are left at their current setting and make `build()`
    /// fail.
    pub fn from_env(mut self) -> Self {
        if let Some(level) = self.env_string("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = self.env_flag("LOG_JSON") {
            self.config.logging.json = json;
        }

        if let Some(secret) = self.env_string("STRIPE_WEBHOOK_SECRET") {
            self.config.billing.webhook_secret = Some(SecretString::from(secret));
        }
        if let Some(secs) = self.env_parsed("SIGNATURE_TOLERANCE_SECS") {
            self.config.billing.signature_tolerance_secs = secs;
        }
        if let Some(price) = self.env_string("STRIPE_PRO_PRICE_ID") {
            self.config.billing.pro_price_ref = Some(price);
        }
        if let Some(price) = self.env_string("STRIPE_PRO_PLUS_PRICE_ID") {
            self.config.billing.pro_plus_price_ref = Some(price);
        }
        if let Some(price) = self.env_string("STRIPE_TEST_PRICE_ID") {
            self.config.billing.test_price_ref = Some(price);
        }
        if let Some(days) = self.env_parsed("CODE_VALIDITY_DAYS") {
            self.config.billing.code_validity_days = days;
        }
        if let Some(max) = self.env_parsed("MAX_CODES_PER_BATCH") {
            self.config.billing.max_codes_per_batch = max;
        }
        if let Some(allow) = self.env_flag("ALLOW_NON_PRODUCTION_PLANS") {
            self.config.billing.allow_non_production_plans = allow;
        }
        if let Some(domains) = self.env_string("REDIRECT_DOMAINS") {
            self.config.billing.allowed_redirect_domains = domains
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect();
        }

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns an error if an environment value did not parse, the log level
    /// is unknown, the code limits are out of range, the signature tolerance
    /// is negative or the webhook secret is empty.
    pub fn build(self) -> crate::error::Result<Config> {
        if !self.env_errors.is_empty() {
            return Err(TidemarkError::config(format!(
                "Invalid environment configuration: {}",
                self.env_errors.join("; ")
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(TidemarkError::config(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        let billing = &self.config.billing;
        if billing.code_validity_days == 0 {
            return Err(TidemarkError::config("Code validity must be at least one day"));
        }
        if billing.max_codes_per_batch == 0 || billing.max_codes_per_batch > MAX_CODES_PER_BATCH {
            return Err(TidemarkError::config(format!(
                "Codes per batch must be between 1 and {}",
                MAX_CODES_PER_BATCH
            )));
        }
        if billing.signature_tolerance_secs < 0 {
            return Err(TidemarkError::config("Signature tolerance must not be negative"));
        }
        if billing
            .webhook_secret
            .as_ref()
            .is_some_and(|s| s.expose_secret().trim().is_empty())
        {
            return Err(TidemarkError::config("Webhook secret must not be empty"));
        }

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_build() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.billing.code_validity_days, 30);
        assert_eq!(config.billing.max_codes_per_batch, 100);
        assert!(config.billing.signature_verifier().is_none());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(ConfigBuilder::new().with_log_level("loud").build().is_err());
        assert!(ConfigBuilder::new().with_code_validity_days(0).build().is_err());
        assert!(ConfigBuilder::new().with_max_codes_per_batch(101).build().is_err());
        assert!(ConfigBuilder::new().with_webhook_secret("  ").build().is_err());
    }

    #[test]
    fn test_price_refs_applied_to_catalog() {
        let config = ConfigBuilder::new()
            .with_price_ref(PlanId::Pro, "price_live_pro")
            .build()
            .unwrap();
        let catalog = config.billing.plan_catalog();

        assert_eq!(
            catalog.find_by_price_ref("price_live_pro").map(|p| p.id),
            Some(PlanId::Pro)
        );
        assert!(catalog.find_by_price_ref("price_pro_monthly").is_none());
    }

    #[test]
    fn test_secret_not_in_debug_output() {
        let config = ConfigBuilder::new()
            .with_webhook_secret("whsec_supersecret")
            .build()
            .unwrap();
        assert!(!format!("{:?}", config).contains("whsec_supersecret"));
        assert!(config.billing.signature_verifier().is_some());
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" 1 "), Some(true));
        assert_eq!(parse_flag("no"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_env_lookup_prefers_prefixed_name() {
        unsafe {
            std::env::set_var("TIDEMARK_CONFIG_LOOKUP_VAR", "prefixed");
            std::env::set_var("CONFIG_LOOKUP_VAR", "plain");
            std::env::set_var("CONFIG_FALLBACK_VAR", "plain");
        }
        assert_eq!(
            env_lookup("CONFIG_LOOKUP_VAR"),
            Some(("TIDEMARK_CONFIG_LOOKUP_VAR".to_string(), "prefixed".to_string()))
        );
        assert_eq!(
            env_lookup("CONFIG_FALLBACK_VAR"),
            Some(("CONFIG_FALLBACK_VAR".to_string(), "plain".to_string()))
        );
        assert_eq!(env_lookup("CONFIG_MISSING_VAR"), None);
        unsafe {
            std::env::remove_var("TIDEMARK_CONFIG_LOOKUP_VAR");
            std::env::remove_var("CONFIG_LOOKUP_VAR");
            std::env::remove_var("CONFIG_FALLBACK_VAR");
        }
    }

    #[test]
    fn test_from_env_typed_values() {
        unsafe {
            std::env::set_var("TIDEMARK_CODE_VALIDITY_DAYS", "14");
            std::env::set_var("TIDEMARK_ALLOW_NON_PRODUCTION_PLANS", "yes");
            std::env::set_var("TIDEMARK_REDIRECT_DOMAINS", "example.com, app.test ,");
        }
        let config = ConfigBuilder::new().from_env().build().unwrap();
        assert_eq!(config.billing.code_validity_days, 14);
        assert!(config.billing.allow_non_production_plans);
        assert_eq!(config.billing.allowed_redirect_domains, vec!["example.com", "app.test"]);

        unsafe {
            std::env::set_var("TIDEMARK_CODE_VALIDITY_DAYS", "two weeks");
        }
        let err = ConfigBuilder::new().from_env().build().unwrap_err();
        assert!(err.to_string().contains("TIDEMARK_CODE_VALIDITY_DAYS"));

        unsafe {
            std::env::remove_var("TIDEMARK_CODE_VALIDITY_DAYS");
            std::env::remove_var("TIDEMARK_ALLOW_NON_PRODUCTION_PLANS");
            std::env::remove_var("TIDEMARK_REDIRECT_DOMAINS");
        }
    }

    #[test]
    fn test_checkout_config_from_billing() {
        let config = ConfigBuilder::new()
            .with_redirect_domain("example.com")
            .with_non_production_plans(true)
            .build()
            .unwrap();
        let checkout = config.billing.checkout_config();

        assert!(checkout.allow_non_production_plans);
        assert!(checkout.validate_redirect_url("https://app.example.com/done").is_ok());
        assert!(checkout.validate_redirect_url("https://evil.test/done").is_err());
    }
}
