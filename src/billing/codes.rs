//! Redemption codes.
//!
//! Single-use offline codes of the form `<PREFIX>-XXXX-XXXX` that grant a
//! plan when redeemed. The prefix names the plan (`SKP` for pro, `SKPP` for
//! pro+) unless the issuer chose a custom one, in which case the plan comes
//! from the stored code.
//!
//! Redemption goes through the [`ReconciliationEngine`]: the code's used flip
//! and the grant are committed together, so two concurrent redemptions of
//! the same code cannot both succeed.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use super::audit::{BillingAuditEvent, BillingAuditLogger, TracingAuditLogger};
use super::entitlement::{Entitlement, PlanId};
use super::error::{BillingError, Result};
use super::events::CodeRedeemed;
use super::reconcile::{ReconcileOutcome, ReconciliationEngine};
use super::storage::AccountStore;
use super::validation::{is_code_prefix, validate_account_id, validate_code_prefix, validate_issuer};

/// Characters used in the random segments.
pub const CODE_ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Default lifetime of a freshly generated code.
pub const DEFAULT_CODE_VALIDITY_DAYS: u32 = 30;

/// Largest batch a single generate call may produce.
pub const MAX_CODES_PER_BATCH: u32 = 100;

const SEGMENT_LEN: usize = 4;

/// Bound on regeneration rounds when candidates collide with stored codes.
const MAX_GENERATION_ROUNDS: u32 = 5;

/// A stored redemption code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
    pub code: String,
    pub plan_type: PlanId,
    pub is_used: bool,
    pub used_by: Option<String>,
    pub used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub issuer: String,
    pub created_at: DateTime<Utc>,
}

impl Code {
    /// Codes expire lazily: past `expires_at` they can no longer be redeemed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Trim and upper-case user input.
#[must_use]
pub fn normalize_code(text: &str) -> String {
    text.trim().to_ascii_uppercase()
}

/// Result of a syntactic code check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatCheck {
    pub valid: bool,
    /// Plan named by a known prefix. `None` for custom prefixes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_type: Option<PlanId>,
}

/// Result of checking whether a code could be redeemed right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_type: Option<PlanId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CodeValidation {
    fn valid(code: &Code) -> Self {
        Self {
            valid: true,
            plan_type: Some(code.plan_type),
            expires_at: Some(code.expires_at),
            error: None,
            reason: None,
        }
    }

    fn invalid(err: &BillingError) -> Self {
        Self {
            valid: false,
            plan_type: None,
            expires_at: None,
            error: Some(err.code()),
            reason: Some(err.to_string()),
        }
    }
}

/// A successful redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redemption {
    pub code: String,
    pub plan_type: PlanId,
    /// Expiry of the redeemed code.
    pub expires_at: DateTime<Utc>,
    pub entitlement: Entitlement,
}

/// Usage counts for a set of codes.
///
/// `expired` counts unused codes past expiry; `total = used + unused + expired`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanCodeStats {
    pub total: u64,
    pub used: u64,
    pub unused: u64,
    pub expired: u64,
}

impl PlanCodeStats {
    fn count(&mut self, code: &Code, now: DateTime<Utc>) {
        self.total += 1;
        if code.is_used {
            self.used += 1;
        } else if code.is_expired(now) {
            self.expired += 1;
        } else {
            self.unused += 1;
        }
    }
}

/// Code statistics per plan and overall.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodeStats {
    pub by_plan: BTreeMap<PlanId, PlanCodeStats>,
    pub totals: PlanCodeStats,
}

/// Issues, validates and redeems codes.
pub struct CodeRegistry<S: AccountStore, A: BillingAuditLogger = TracingAuditLogger> {
    engine: Arc<ReconciliationEngine<S, A>>,
    validity_days: u32,
    max_batch: u32,
}

impl<S: AccountStore, A: BillingAuditLogger> CodeRegistry<S, A> {
    #[must_use]
    pub fn new(engine: Arc<ReconciliationEngine<S, A>>) -> Self {
        Self {
            engine,
            validity_days: DEFAULT_CODE_VALIDITY_DAYS,
            max_batch: MAX_CODES_PER_BATCH,
        }
    }

    /// Set how long new codes stay redeemable.
    #[must_use]
    pub fn with_validity_days(mut self, days: u32) -> Self {
        self.validity_days = days.max(1);
        self
    }

    /// Lower the batch limit. Values above the hard limit are clamped.
    #[must_use]
    pub fn with_max_batch(mut self, max_batch: u32) -> Self {
        self.max_batch = max_batch.clamp(1, MAX_CODES_PER_BATCH);
        self
    }

    /// Syntactic check only: `<PREFIX>-XXXX-XXXX` after trimming and upper-casing.
    #[must_use]
    pub fn validate_format(&self, text: &str) -> FormatCheck {
        let normalized = normalize_code(text);
        let mut parts = normalized.split('-');

        let (Some(prefix), Some(first), Some(second), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return FormatCheck { valid: false, plan_type: None };
        };

        if !is_code_prefix(prefix) || !is_segment(first) || !is_segment(second) {
            return FormatCheck { valid: false, plan_type: None };
        }

        FormatCheck {
            valid: true,
            plan_type: self
                .engine
                .catalog()
                .find_by_code_prefix(prefix)
                .map(|p| p.id),
        }
    }

    /// Check a code against the store without redeeming it.
    ///
    /// Client-side problems come back as an invalid result; only storage
    /// failures are errors.
    pub async fn validate(&self, text: &str) -> Result<CodeValidation> {
        match self.redeemable(&normalize_code(text), Utc::now()).await {
            Ok(code) => Ok(CodeValidation::valid(&code)),
            Err(err) if err.is_client_error() => Ok(CodeValidation::invalid(&err)),
            Err(err) => Err(err),
        }
    }

    /// Generate and store a single code.
    pub async fn generate(
        &self,
        plan: PlanId,
        issuer: &str,
        custom_prefix: Option<&str>,
    ) -> Result<Code> {
        let mut codes = self.generate_multiple(plan, issuer, 1, custom_prefix).await?;
        codes
            .pop()
            .ok_or_else(|| BillingError::storage("no code generated"))
    }

    /// Generate and store `count` codes for `plan`.
    pub async fn generate_multiple(
        &self,
        plan: PlanId,
        issuer: &str,
        count: u32,
        custom_prefix: Option<&str>,
    ) -> Result<Vec<Code>> {
        if count == 0 || count > self.max_batch {
            return Err(BillingError::validation(
                "count",
                format!("count must be between 1 and {}", self.max_batch),
            ));
        }
        validate_issuer(issuer)?;
        let prefix = self.prefix_for(plan, custom_prefix)?;

        let wanted = count as usize;
        let mut accepted: Vec<String> = Vec::with_capacity(wanted);
        let mut seen: HashSet<String> = HashSet::with_capacity(wanted);

        for _round in 0..MAX_GENERATION_ROUNDS {
            for candidate in random_codes(&prefix, wanted - accepted.len()) {
                if !seen.insert(candidate.clone()) {
                    continue;
                }
                if self.engine.store().get_code(&candidate).await?.is_some() {
                    continue;
                }
                accepted.push(candidate);
            }
            if accepted.len() == wanted {
                break;
            }
        }

        if accepted.len() < wanted {
            return Err(BillingError::storage(format!(
                "could not generate {} unique codes with prefix {}",
                wanted, prefix
            )));
        }

        let now = Utc::now();
        let expires_at = now + Duration::days(i64::from(self.validity_days));
        let issuer = issuer.trim().to_string();
        let codes: Vec<Code> = accepted
            .into_iter()
            .map(|code| Code {
                code,
                plan_type: plan,
                is_used: false,
                used_by: None,
                used_at: None,
                expires_at,
                issuer: issuer.clone(),
                created_at: now,
            })
            .collect();

        self.engine.store().insert_codes(&codes).await?;

        tracing::info!(
            plan = %plan,
            count = codes.len(),
            prefix = %prefix,
            "redemption codes generated"
        );
        self.engine
            .audit()
            .log(BillingAuditEvent::CodesGenerated {
                issuer,
                plan,
                count: codes.len(),
            })
            .await;

        Ok(codes)
    }

    /// Redeem a code for an account.
    ///
    /// Checks run in order: format, existence, already used, expired.
    pub async fn redeem(&self, text: &str, account_id: &str) -> Result<Redemption> {
        validate_account_id(account_id)?;
        let normalized = normalize_code(text);
        let code = self.redeemable(&normalized, Utc::now()).await?;

        let outcome = self
            .engine
            .redeem(CodeRedeemed {
                code: code.code.clone(),
                account_id: account_id.to_string(),
                plan: code.plan_type,
                code_expires_at: code.expires_at,
            })
            .await
            .map_err(|err| match err {
                BillingError::UserResolution { .. } => BillingError::NotFound {
                    resource: "account",
                    id: account_id.to_string(),
                },
                other => other,
            })?;

        let entitlement = match outcome {
            ReconcileOutcome::Applied { entitlement, .. }
            | ReconcileOutcome::Unchanged { entitlement, .. } => entitlement,
            ReconcileOutcome::AlreadyApplied { .. } | ReconcileOutcome::Deferred { .. } => {
                return Err(BillingError::AlreadyUsed { code: code.code });
            }
        };

        tracing::info!(
            account_id = %account_id,
            plan = %code.plan_type,
            "redemption code applied"
        );
        self.engine
            .audit()
            .log(BillingAuditEvent::CodeRedeemed {
                code: code.code.clone(),
                account_id: account_id.to_string(),
                plan: code.plan_type,
            })
            .await;

        Ok(Redemption {
            code: code.code,
            plan_type: code.plan_type,
            expires_at: code.expires_at,
            entitlement,
        })
    }

    /// Aggregate counts over every stored code.
    pub async fn stats(&self) -> Result<CodeStats> {
        let now = Utc::now();
        let mut stats = CodeStats::default();
        for code in self.engine.store().list_codes().await? {
            stats.by_plan.entry(code.plan_type).or_default().count(&code, now);
            stats.totals.count(&code, now);
        }
        Ok(stats)
    }

    async fn redeemable(&self, normalized: &str, now: DateTime<Utc>) -> Result<Code> {
        if !self.validate_format(normalized).valid {
            return Err(BillingError::validation("code", "code format is invalid"));
        }

        let code = self
            .engine
            .store()
            .get_code(normalized)
            .await?
            .ok_or_else(|| BillingError::NotFound {
                resource: "code",
                id: normalized.to_string(),
            })?;

        if code.is_used {
            return Err(BillingError::AlreadyUsed { code: code.code });
        }
        if code.is_expired(now) {
            return Err(BillingError::Expired {
                code: code.code,
                expired_at: code.expires_at,
            });
        }
        Ok(code)
    }

    fn prefix_for(&self, plan: PlanId, custom_prefix: Option<&str>) -> Result<String> {
        let catalog = self.engine.catalog();
        let config = catalog.require(plan)?;
        if !config.is_redeemable() {
            return Err(BillingError::validation(
                "plan_type",
                format!("plan {} cannot be issued as codes", plan),
            ));
        }

        match custom_prefix {
            Some(custom) => {
                let prefix = validate_code_prefix(custom)?;
                if let Some(owner) = catalog.find_by_code_prefix(&prefix) {
                    if owner.id != plan {
                        return Err(BillingError::validation(
                            "prefix",
                            format!("prefix {} is reserved for {}", prefix, owner.id),
                        ));
                    }
                }
                Ok(prefix)
            }
            None => config.code_prefix.clone().ok_or_else(|| {
                BillingError::validation("prefix", format!("plan {} has no default prefix", plan))
            }),
        }
    }
}

fn is_segment(segment: &str) -> bool {
    segment.len() == SEGMENT_LEN
        && segment
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

fn random_segment<R: Rng>(rng: &mut R) -> String {
    (0..SEGMENT_LEN)
        .map(|_| char::from(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())]))
        .collect()
}

fn random_codes(prefix: &str, count: usize) -> Vec<String> {
    let mut rng = OsRng;
    (0..count)
        .map(|_| {
            format!(
                "{}-{}-{}",
                prefix,
                random_segment(&mut rng),
                random_segment(&mut rng)
            )
        })
        .collect()
}
