//! SeaORM-backed account storage.
//!
//! Persists accounts, redemption codes and the processed-event ledger.
//! Multi-record writes run inside one database transaction.
//!
//! # Example
//!
//! ```rust,ignore
//! use tidemark::billing::{PlanCatalog, ReconciliationEngine, SeaOrmAccountStore};
//!
//! let store = SeaOrmAccountStore::new(db.clone());
//! let engine = ReconciliationEngine::new(store, PlanCatalog::standard());
//! ```

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait, TryInsertResult,
    sea_query::{Expr, Func, OnConflict},
};

use super::codes::Code;
use super::entitlement::{Account, Entitlement, EntitlementStatus, PlanId, UsageStats};
use super::error::{BillingError, Result};
use super::events::redemption_key;
use super::storage::{AccountStore, RedemptionCommit, SaveOutcome};

// =============================================================================
// SeaORM Entities
// =============================================================================

mod entity {
    use sea_orm::entity::prelude::*;

    // -------------------------------------------------------------------------
    // Account Entity
    // -------------------------------------------------------------------------
    pub mod account {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "tidemark_accounts")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub id: String,
            pub email: String,
            pub plan: String,
            pub status: String,
            pub start_date: DateTimeWithTimeZone,
            pub end_date: Option<DateTimeWithTimeZone>,
            pub tokens: i32,
            pub minutes_left: i64,
            #[sea_orm(indexed)]
            pub external_customer_ref: Option<String>,
            pub external_subscription_ref: Option<String>,
            pub sessions_completed: i64,
            pub total_minutes_used: i64,
            pub last_session_at: Option<DateTimeWithTimeZone>,
            /// Optimistic-locking counter checked by compare_and_save_account.
            pub version: i64,
            pub created_at: DateTimeWithTimeZone,
            pub updated_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    // -------------------------------------------------------------------------
    // Redemption Code Entity
    // -------------------------------------------------------------------------
    pub mod redemption_code {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "tidemark_redemption_codes")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub code: String,
            pub plan_type: String,
            pub is_used: bool,
            pub used_by: Option<String>,
            pub used_at: Option<DateTimeWithTimeZone>,
            pub expires_at: DateTimeWithTimeZone,
            pub issuer: String,
            pub created_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    // -------------------------------------------------------------------------
    // Processed Event Entity
    // -------------------------------------------------------------------------
    pub mod processed_event {
        use super::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "tidemark_processed_events")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub idempotency_key: String,
            pub processed_at: DateTimeWithTimeZone,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{account, processed_event, redemption_code};

// =============================================================================
// Helper Functions
// =============================================================================

/// Convert i64 to u64 safely (negative values become 0).
#[inline]
fn i64_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Convert u64 to i64 safely (values > i64::MAX become i64::MAX).
#[inline]
fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Convert i32 to u32 safely (negative values become 0).
#[inline]
fn i32_to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// Convert u32 to i32 safely (values > i32::MAX become i32::MAX).
#[inline]
fn u32_to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Convert u64 to usize safely (values > usize::MAX become usize::MAX).
#[inline]
fn u64_to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

#[inline]
fn to_db_time(value: DateTime<Utc>) -> DateTime<FixedOffset> {
    value.fixed_offset()
}

#[inline]
fn from_db_time(value: DateTime<FixedOffset>) -> DateTime<Utc> {
    value.with_timezone(&Utc)
}

fn parse_plan(value: &str) -> Result<PlanId> {
    value
        .parse()
        .map_err(|_| BillingError::storage(format!("unknown plan in database: {}", value)))
}

/// Convert a database row to an [`Account`].
fn model_to_account(model: account::Model) -> Result<Account> {
    let status = EntitlementStatus::parse(&model.status).ok_or_else(|| {
        BillingError::storage(format!("unknown status in database: {}", model.status))
    })?;

    Ok(Account {
        entitlement: Entitlement {
            plan: parse_plan(&model.plan)?,
            status,
            start_date: from_db_time(model.start_date),
            end_date: model.end_date.map(from_db_time),
            tokens: i32_to_u32(model.tokens),
            minutes_left: model.minutes_left,
            external_customer_ref: model.external_customer_ref,
            external_subscription_ref: model.external_subscription_ref,
        },
        usage: UsageStats {
            sessions_completed: i64_to_u64(model.sessions_completed),
            total_minutes_used: i64_to_u64(model.total_minutes_used),
            last_session_at: model.last_session_at.map(from_db_time),
        },
        id: model.id,
        email: model.email,
        version: i64_to_u64(model.version),
        created_at: from_db_time(model.created_at),
        updated_at: from_db_time(model.updated_at),
    })
}

fn account_to_active_model(account: &Account) -> account::ActiveModel {
    let ent = &account.entitlement;
    account::ActiveModel {
        id: Set(account.id.clone()),
        email: Set(account.email.clone()),
        plan: Set(ent.plan.as_str().to_string()),
        status: Set(ent.status.as_str().to_string()),
        start_date: Set(to_db_time(ent.start_date)),
        end_date: Set(ent.end_date.map(to_db_time)),
        tokens: Set(u32_to_i32(ent.tokens)),
        minutes_left: Set(ent.minutes_left),
        external_customer_ref: Set(ent.external_customer_ref.clone()),
        external_subscription_ref: Set(ent.external_subscription_ref.clone()),
        sessions_completed: Set(u64_to_i64(account.usage.sessions_completed)),
        total_minutes_used: Set(u64_to_i64(account.usage.total_minutes_used)),
        last_session_at: Set(account.usage.last_session_at.map(to_db_time)),
        version: Set(u64_to_i64(account.version)),
        created_at: Set(to_db_time(account.created_at)),
        updated_at: Set(to_db_time(account.updated_at)),
    }
}

fn model_to_code(model: redemption_code::Model) -> Result<Code> {
    Ok(Code {
        plan_type: parse_plan(&model.plan_type)?,
        code: model.code,
        is_used: model.is_used,
        used_by: model.used_by,
        used_at: model.used_at.map(from_db_time),
        expires_at: from_db_time(model.expires_at),
        issuer: model.issuer,
        created_at: from_db_time(model.created_at),
    })
}

fn code_to_active_model(code: &Code) -> redemption_code::ActiveModel {
    redemption_code::ActiveModel {
        code: Set(code.code.clone()),
        plan_type: Set(code.plan_type.as_str().to_string()),
        is_used: Set(code.is_used),
        used_by: Set(code.used_by.clone()),
        used_at: Set(code.used_at.map(to_db_time)),
        expires_at: Set(to_db_time(code.expires_at)),
        issuer: Set(code.issuer.clone()),
        created_at: Set(to_db_time(code.created_at)),
    }
}

/// Build a conditional UPDATE for an account with version check.
fn build_account_update(
    account: &Account,
    expected_version: u64,
) -> sea_orm::UpdateMany<account::Entity> {
    let ent = &account.entitlement;
    account::Entity::update_many()
        .col_expr(account::Column::Email, Expr::value(&account.email))
        .col_expr(account::Column::Plan, Expr::value(ent.plan.as_str()))
        .col_expr(account::Column::Status, Expr::value(ent.status.as_str()))
        .col_expr(account::Column::StartDate, Expr::value(to_db_time(ent.start_date)))
        .col_expr(account::Column::EndDate, Expr::value(ent.end_date.map(to_db_time)))
        .col_expr(account::Column::Tokens, Expr::value(u32_to_i32(ent.tokens)))
        .col_expr(account::Column::MinutesLeft, Expr::value(ent.minutes_left))
        .col_expr(
            account::Column::ExternalCustomerRef,
            Expr::value(ent.external_customer_ref.clone()),
        )
        .col_expr(
            account::Column::ExternalSubscriptionRef,
            Expr::value(ent.external_subscription_ref.clone()),
        )
        .col_expr(
            account::Column::SessionsCompleted,
            Expr::value(u64_to_i64(account.usage.sessions_completed)),
        )
        .col_expr(
            account::Column::TotalMinutesUsed,
            Expr::value(u64_to_i64(account.usage.total_minutes_used)),
        )
        .col_expr(
            account::Column::LastSessionAt,
            Expr::value(account.usage.last_session_at.map(to_db_time)),
        )
        .col_expr(account::Column::Version, Expr::value(u64_to_i64(account.version)))
        .col_expr(account::Column::UpdatedAt, Expr::value(to_db_time(account.updated_at)))
        .filter(account::Column::Id.eq(account.id.as_str()))
        .filter(account::Column::Version.eq(u64_to_i64(expected_version)))
}

/// Record an idempotency key inside `txn`. Returns false if it was already present.
async fn record_key(txn: &DatabaseTransaction, key: &str, at: DateTime<Utc>) -> Result<bool> {
    let event = processed_event::ActiveModel {
        idempotency_key: Set(key.to_string()),
        processed_at: Set(to_db_time(at)),
    };

    let result = processed_event::Entity::insert(event)
        .on_conflict(
            OnConflict::column(processed_event::Column::IdempotencyKey)
                .do_nothing()
                .to_owned(),
        )
        .do_nothing()
        .exec(txn)
        .await
        .map_err(BillingError::storage)?;

    Ok(!matches!(result, TryInsertResult::Conflicted))
}

async fn rollback(txn: DatabaseTransaction) -> Result<()> {
    txn.rollback().await.map_err(BillingError::storage)
}

// =============================================================================
// SeaOrmAccountStore
// =============================================================================

/// SeaORM-backed store implementing [`AccountStore`].
///
/// Optimistic locking uses the `version` column; the ledger row for the
/// causing event is inserted in the same transaction as the account write.
#[derive(Clone, Debug)]
pub struct SeaOrmAccountStore {
    db: DatabaseConnection,
}

impl SeaOrmAccountStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Get a reference to the underlying database connection.
    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Why a version-filtered update matched no rows: a missing account is an
    /// error, anything else is a conflict.
    async fn explain_miss(txn: &DatabaseTransaction, account_id: &str) -> Result<()> {
        let exists = account::Entity::find_by_id(account_id)
            .one(txn)
            .await
            .map_err(BillingError::storage)?;
        if exists.is_none() {
            return Err(BillingError::NotFound {
                resource: "account",
                id: account_id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AccountStore for SeaOrmAccountStore {
    async fn create_account(&self, account: &Account) -> Result<()> {
        tracing::debug!(account_id = %account.id, "creating account");

        let existing = account::Entity::find_by_id(account.id.as_str())
            .one(&self.db)
            .await
            .map_err(BillingError::storage)?;
        if existing.is_some() {
            return Err(BillingError::validation(
                "account_id",
                format!("account {} already exists", account.id),
            ));
        }

        account_to_active_model(account)
            .insert(&self.db)
            .await
            .map_err(BillingError::storage)?;
        Ok(())
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        tracing::debug!(account_id = %account_id, "fetching account");

        account::Entity::find_by_id(account_id)
            .one(&self.db)
            .await
            .map_err(BillingError::storage)?
            .map(model_to_account)
            .transpose()
    }

    async fn find_by_customer_ref(&self, customer_ref: &str) -> Result<Option<Account>> {
        account::Entity::find()
            .filter(account::Column::ExternalCustomerRef.eq(customer_ref))
            .one(&self.db)
            .await
            .map_err(BillingError::storage)?
            .map(model_to_account)
            .transpose()
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Account>> {
        account::Entity::find()
            .filter(
                Expr::expr(Func::lower(Expr::col(account::Column::Email)))
                    .eq(email.to_lowercase()),
            )
            .one(&self.db)
            .await
            .map_err(BillingError::storage)?
            .map(model_to_account)
            .transpose()
    }

    async fn compare_and_save_account(
        &self,
        account: &Account,
        expected_version: u64,
        idempotency_key: Option<&str>,
    ) -> Result<SaveOutcome> {
        tracing::debug!(
            account_id = %account.id,
            expected_version,
            new_version = account.version,
            idempotency_key = ?idempotency_key,
            "compare and save account"
        );

        let txn = self.db.begin().await.map_err(BillingError::storage)?;

        if let Some(key) = idempotency_key {
            if !record_key(&txn, key, account.updated_at).await? {
                rollback(txn).await?;
                return Ok(SaveOutcome::AlreadyProcessed);
            }
        }

        let update_result = build_account_update(account, expected_version)
            .exec(&txn)
            .await
            .map_err(BillingError::storage)?;

        if update_result.rows_affected == 0 {
            let missing = Self::explain_miss(&txn, &account.id).await;
            rollback(txn).await?;
            missing?;
            tracing::debug!(
                account_id = %account.id,
                expected_version,
                "version mismatch - concurrent modification detected"
            );
            return Ok(SaveOutcome::VersionConflict);
        }

        txn.commit().await.map_err(BillingError::storage)?;
        Ok(SaveOutcome::Saved)
    }

    async fn is_event_processed(&self, idempotency_key: &str) -> Result<bool> {
        let event = processed_event::Entity::find_by_id(idempotency_key)
            .one(&self.db)
            .await
            .map_err(BillingError::storage)?;

        Ok(event.is_some())
    }

    async fn insert_codes(&self, codes: &[Code]) -> Result<()> {
        if codes.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = codes.len(), "inserting codes");

        let txn = self.db.begin().await.map_err(BillingError::storage)?;

        let existing = redemption_code::Entity::find()
            .filter(redemption_code::Column::Code.is_in(codes.iter().map(|c| c.code.clone())))
            .one(&txn)
            .await
            .map_err(BillingError::storage)?;
        if let Some(dup) = existing {
            rollback(txn).await?;
            return Err(BillingError::validation(
                "code",
                format!("code {} already exists", dup.code),
            ));
        }

        redemption_code::Entity::insert_many(codes.iter().map(code_to_active_model))
            .exec(&txn)
            .await
            .map_err(BillingError::storage)?;

        txn.commit().await.map_err(BillingError::storage)?;
        Ok(())
    }

    async fn get_code(&self, code: &str) -> Result<Option<Code>> {
        redemption_code::Entity::find_by_id(code)
            .one(&self.db)
            .await
            .map_err(BillingError::storage)?
            .map(model_to_code)
            .transpose()
    }

    async fn list_codes(&self) -> Result<Vec<Code>> {
        redemption_code::Entity::find()
            .order_by_asc(redemption_code::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(BillingError::storage)?
            .into_iter()
            .map(model_to_code)
            .collect()
    }

    async fn commit_redemption(
        &self,
        code: &str,
        account: &Account,
        expected_version: u64,
        used_at: DateTime<Utc>,
    ) -> Result<RedemptionCommit> {
        tracing::debug!(
            code = %code,
            account_id = %account.id,
            expected_version,
            "committing redemption"
        );

        let txn = self.db.begin().await.map_err(BillingError::storage)?;

        let Some(stored) = redemption_code::Entity::find_by_id(code)
            .one(&txn)
            .await
            .map_err(BillingError::storage)?
        else {
            rollback(txn).await?;
            return Ok(RedemptionCommit::CodeNotFound);
        };

        let flipped = redemption_code::Entity::update_many()
            .col_expr(redemption_code::Column::IsUsed, Expr::value(true))
            .col_expr(redemption_code::Column::UsedBy, Expr::value(account.id.as_str()))
            .col_expr(redemption_code::Column::UsedAt, Expr::value(to_db_time(used_at)))
            .filter(redemption_code::Column::Code.eq(code))
            .filter(redemption_code::Column::IsUsed.eq(false))
            .exec(&txn)
            .await
            .map_err(BillingError::storage)?;
        if flipped.rows_affected == 0 {
            rollback(txn).await?;
            return Ok(RedemptionCommit::CodeAlreadyUsed);
        }

        let update_result = build_account_update(account, expected_version)
            .exec(&txn)
            .await
            .map_err(BillingError::storage)?;
        if update_result.rows_affected == 0 {
            let missing = Self::explain_miss(&txn, &account.id).await;
            rollback(txn).await?;
            missing?;
            return Ok(RedemptionCommit::VersionConflict);
        }

        if !record_key(&txn, &redemption_key(code), used_at).await? {
            rollback(txn).await?;
            return Ok(RedemptionCommit::CodeAlreadyUsed);
        }

        txn.commit().await.map_err(BillingError::storage)?;

        let mut updated = model_to_code(stored)?;
        updated.is_used = true;
        updated.used_by = Some(account.id.clone());
        updated.used_at = Some(used_at);
        Ok(RedemptionCommit::Committed(updated))
    }

    async fn cleanup_old_events(&self, older_than_days: u32) -> Result<usize> {
        self.cleanup_old_events_batched(older_than_days, None).await
    }
}

impl SeaOrmAccountStore {
    /// Delete old ledger entries in batches to avoid long table locks.
    ///
    /// `batch_size` of `None` deletes everything in one statement; `Some(0)`
    /// is a no-op. Returns the total number of deleted entries.
    pub async fn cleanup_old_events_batched(
        &self,
        older_than_days: u32,
        batch_size: Option<u32>,
    ) -> Result<usize> {
        tracing::debug!(older_than_days, batch_size = ?batch_size, "cleaning up old events");

        let cutoff = to_db_time(Utc::now() - chrono::Duration::days(i64::from(older_than_days)));

        let batch_size = match batch_size {
            Some(0) => return Ok(0),
            Some(size) => size,
            None => {
                let result = processed_event::Entity::delete_many()
                    .filter(processed_event::Column::ProcessedAt.lt(cutoff))
                    .exec(&self.db)
                    .await
                    .map_err(BillingError::storage)?;

                let deleted = u64_to_usize(result.rows_affected);
                tracing::info!(deleted, "cleaned up old ledger entries");
                return Ok(deleted);
            }
        };

        let mut total_deleted: usize = 0;
        loop {
            let keys: Vec<String> = processed_event::Entity::find()
                .filter(processed_event::Column::ProcessedAt.lt(cutoff))
                .limit(u64::from(batch_size))
                .all(&self.db)
                .await
                .map_err(BillingError::storage)?
                .into_iter()
                .map(|e| e.idempotency_key)
                .collect();

            if keys.is_empty() {
                break;
            }
            let batch_count = keys.len();

            let result = processed_event::Entity::delete_many()
                .filter(processed_event::Column::IdempotencyKey.is_in(keys))
                .exec(&self.db)
                .await
                .map_err(BillingError::storage)?;
            total_deleted = total_deleted.saturating_add(u64_to_usize(result.rows_affected));

            if batch_count < batch_size as usize {
                break;
            }
        }

        tracing::info!(deleted = total_deleted, "cleaned up old ledger entries");
        Ok(total_deleted)
    }
}

// =============================================================================
// Tests
// =============================================================================
