//! Billing storage abstraction.
//!
//! [`AccountStore`] persists account aggregates, redemption codes and the
//! processed-event ledger. Writes are optimistic: callers read an account,
//! compute its next state and commit with the version they read. The ledger
//! entry for the causing event is written in the same commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::codes::Code;
use super::entitlement::Account;
use super::error::Result;

/// Result of a compare-and-save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The account and ledger entry were written.
    Saved,
    /// The stored version no longer matches; re-read and retry.
    VersionConflict,
    /// The idempotency key was already in the ledger; nothing was written.
    AlreadyProcessed,
}

/// Result of committing a code redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedemptionCommit {
    /// Code flipped to used and the account written, with the updated code.
    Committed(Code),
    /// Another redemption flipped the code first.
    CodeAlreadyUsed,
    /// The code does not exist.
    CodeNotFound,
    /// The account version moved; re-read and retry.
    VersionConflict,
}

/// Trait for account, code and ledger persistence.
///
/// Implementations must make [`compare_and_save_account`](Self::compare_and_save_account)
/// and [`commit_redemption`](Self::commit_redemption) atomic: either every
/// write in the call lands or none does.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Insert a new account. Fails if the id is taken.
    async fn create_account(&self, account: &Account) -> Result<()>;

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>>;

    async fn find_by_customer_ref(&self, customer_ref: &str) -> Result<Option<Account>>;

    /// Case-insensitive email lookup.
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>>;

    /// Write `account` if the stored version equals `expected_version`.
    ///
    /// When `idempotency_key` is given it is checked and recorded in the
    /// same commit; a key already present short-circuits with
    /// [`SaveOutcome::AlreadyProcessed`].
    async fn compare_and_save_account(
        &self,
        account: &Account,
        expected_version: u64,
        idempotency_key: Option<&str>,
    ) -> Result<SaveOutcome>;

    /// Check whether an idempotency key has been recorded.
    async fn is_event_processed(&self, idempotency_key: &str) -> Result<bool>;

    /// Insert freshly generated codes. Fails without writing if any already exists.
    async fn insert_codes(&self, codes: &[Code]) -> Result<()>;

    async fn get_code(&self, code: &str) -> Result<Option<Code>>;

    async fn list_codes(&self) -> Result<Vec<Code>>;

    /// Flip `code` to used by `account.id` and write `account`, atomically.
    ///
    /// The code flip is conditional on the code still being unused and the
    /// account write on `expected_version`. The ledger records `code:<CODE>`.
    async fn commit_redemption(
        &self,
        code: &str,
        account: &Account,
        expected_version: u64,
        used_at: DateTime<Utc>,
    ) -> Result<RedemptionCommit>;

    /// Clean up ledger entries older than the given number of days.
    ///
    /// Returns the number of entries removed.
    async fn cleanup_old_events(&self, older_than_days: u32) -> Result<usize> {
        let _ = older_than_days;
        Ok(0)
    }
}

pub use memory::MemoryAccountStore;

/// In-memory store.
pub mod memory {
    use super::*;
    use crate::billing::error::BillingError;
    use crate::billing::events::redemption_key;
    use chrono::Duration;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    /// In-memory account store.
    ///
    /// All state sits behind one lock so the multi-record commits are atomic.
    /// Wraps data in Arc for cheap cloning.
    #[derive(Default, Clone)]
    pub struct MemoryAccountStore {
        inner: Arc<RwLock<MemoryState>>,
    }

    #[derive(Default)]
    struct MemoryState {
        accounts: HashMap<String, Account>,
        codes: HashMap<String, Code>,
        processed_events: HashMap<String, DateTime<Utc>>,
    }

    impl MemoryState {
        fn record(&mut self, key: &str, at: DateTime<Utc>) {
            self.processed_events.insert(key.to_string(), at);
        }
    }

    impl MemoryAccountStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Snapshot of the ledger keys.
        pub async fn processed_keys(&self) -> Vec<String> {
            self.inner.read().await.processed_events.keys().cloned().collect()
        }

        /// Overwrite an account regardless of version. For seeding fixtures.
        pub async fn put_account(&self, account: Account) {
            self.inner
                .write()
                .await
                .accounts
                .insert(account.id.clone(), account);
        }
    }

    #[async_trait]
    impl AccountStore for MemoryAccountStore {
        async fn create_account(&self, account: &Account) -> Result<()> {
            let mut state = self.inner.write().await;
            if state.accounts.contains_key(&account.id) {
                return Err(BillingError::validation(
                    "account_id",
                    format!("account {} already exists", account.id),
                ));
            }
            state.accounts.insert(account.id.clone(), account.clone());
            Ok(())
        }

        async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
            Ok(self.inner.read().await.accounts.get(account_id).cloned())
        }

        async fn find_by_customer_ref(&self, customer_ref: &str) -> Result<Option<Account>> {
            let state = self.inner.read().await;
            Ok(state
                .accounts
                .values()
                .find(|a| a.entitlement.external_customer_ref.as_deref() == Some(customer_ref))
                .cloned())
        }

        async fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
            let state = self.inner.read().await;
            Ok(state
                .accounts
                .values()
                .find(|a| a.email.eq_ignore_ascii_case(email))
                .cloned())
        }

        async fn compare_and_save_account(
            &self,
            account: &Account,
            expected_version: u64,
            idempotency_key: Option<&str>,
        ) -> Result<SaveOutcome> {
            let mut state = self.inner.write().await;

            if let Some(key) = idempotency_key {
                if state.processed_events.contains_key(key) {
                    return Ok(SaveOutcome::AlreadyProcessed);
                }
            }

            match state.accounts.get(&account.id) {
                Some(current) if current.version == expected_version => {}
                Some(_) => return Ok(SaveOutcome::VersionConflict),
                None => {
                    return Err(BillingError::NotFound {
                        resource: "account",
                        id: account.id.clone(),
                    });
                }
            }

            state.accounts.insert(account.id.clone(), account.clone());
            if let Some(key) = idempotency_key {
                state.record(key, account.updated_at);
            }
            Ok(SaveOutcome::Saved)
        }

        async fn is_event_processed(&self, idempotency_key: &str) -> Result<bool> {
            Ok(self
                .inner
                .read()
                .await
                .processed_events
                .contains_key(idempotency_key))
        }

        async fn insert_codes(&self, codes: &[Code]) -> Result<()> {
            let mut state = self.inner.write().await;
            if let Some(dup) = codes.iter().find(|c| state.codes.contains_key(&c.code)) {
                return Err(BillingError::validation(
                    "code",
                    format!("code {} already exists", dup.code),
                ));
            }
            for code in codes {
                state.codes.insert(code.code.clone(), code.clone());
            }
            Ok(())
        }

        async fn get_code(&self, code: &str) -> Result<Option<Code>> {
            Ok(self.inner.read().await.codes.get(code).cloned())
        }

        async fn list_codes(&self) -> Result<Vec<Code>> {
            Ok(self.inner.read().await.codes.values().cloned().collect())
        }

        async fn commit_redemption(
            &self,
            code: &str,
            account: &Account,
            expected_version: u64,
            used_at: DateTime<Utc>,
        ) -> Result<RedemptionCommit> {
            let mut state = self.inner.write().await;

            match state.codes.get(code) {
                None => return Ok(RedemptionCommit::CodeNotFound),
                Some(c) if c.is_used => return Ok(RedemptionCommit::CodeAlreadyUsed),
                Some(_) => {}
            }

            match state.accounts.get(&account.id) {
                Some(current) if current.version == expected_version => {}
                Some(_) => return Ok(RedemptionCommit::VersionConflict),
                None => {
                    return Err(BillingError::NotFound {
                        resource: "account",
                        id: account.id.clone(),
                    });
                }
            }

            let Some(stored) = state.codes.get_mut(code) else {
                return Ok(RedemptionCommit::CodeNotFound);
            };
            stored.is_used = true;
            stored.used_by = Some(account.id.clone());
            stored.used_at = Some(used_at);
            let updated = stored.clone();

            state.accounts.insert(account.id.clone(), account.clone());
            state.record(&redemption_key(code), used_at);

            Ok(RedemptionCommit::Committed(updated))
        }

        async fn cleanup_old_events(&self, older_than_days: u32) -> Result<usize> {
            let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
            let mut state = self.inner.write().await;
            let before = state.processed_events.len();
            state.processed_events.retain(|_, at| *at >= cutoff);
            Ok(before - state.processed_events.len())
        }
    }
}
