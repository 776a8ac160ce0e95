//! Tidemark - entitlement reconciliation for subscription billing
//!
//! Tidemark keeps one authoritative answer to "what may this account use
//! right now" while payment processor webhooks, manual checkout
//! verification, redemption codes and usage metering all try to change it.
//!
//! # Features
//!
//! - **Plans**: a typed catalog of tiers, allotments and processor prices
//! - **Codes**: batch generation and single-use redemption of plan codes
//! - **Usage**: per-session minute metering with metered top-ups
//! - **Checkout**: processor checkout sessions behind a `PaymentGateway` trait
//! - **Webhooks**: signature verification, typed payload parsing and
//!   idempotent reconciliation
//! - **Database**: SeaORM-backed account store (`database` feature)
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tidemark::ConfigBuilder;
//! use tidemark::billing::{MemoryAccountStore, ReconciliationEngine, UsageMeter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tidemark::TidemarkError> {
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     tidemark::init_tracing_with_config(&config);
//!
//!     let engine = Arc::new(ReconciliationEngine::new(
//!         MemoryAccountStore::new(),
//!         config.billing.plan_catalog(),
//!     ));
//!     engine.create_account("user_1", "user1@example.com").await?;
//!
//!     let meter = UsageMeter::new(engine);
//!     meter.consume("user_1", 90.0).await?;
//!     Ok(())
//! }
//! ```

pub mod billing;
mod config;
mod error;

// Re-exports for public API
pub use config::{BillingConfig, Config, ConfigBuilder, LoggingConfig};
pub use error::{ErrorResponse, Result, TidemarkError};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main().
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "tidemark=debug")
/// - `TIDEMARK_LOG_JSON`: Set to "true" for JSON formatted logs
///
/// Audit events are emitted under the `billing::audit` target, so
/// `RUST_LOG=info,billing::audit=info` keeps them while muting the rest.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("TIDEMARK_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing with a custom configuration
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
