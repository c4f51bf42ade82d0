//! Retail ledger engine: transactions, balances and reconciliation for a
//! small shop.
//!
//! The transaction log is the single source of truth. Product quantities,
//! customer/supplier balances and the treasury figure are cached aggregates
//! folded from it; `snapshot::verify_ledger` replays the log to prove the
//! caches honest. Every operation commits through one SQLite write
//! transaction, so a failed call leaves nothing behind.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod audit;
pub mod db;
pub mod error;
pub mod inventory;
pub mod models;
pub mod parties;
pub mod purchases;
pub mod quotations;
pub mod returns;
pub mod sales;
pub mod shifts;
pub mod snapshot;
pub mod treasury;

pub use db::LedgerState;
pub use error::LedgerError;
pub use models::{
    CartLine, CartTotals, Customer, CustomerType, Operator, PartyKind, PaymentMethod, Product,
    Quotation, Shift, StoreSettings, Supplier, Transaction, TransactionKind, TransactionStatus,
};

/// Initialize structured console logging for the embedding application.
/// Respects `RUST_LOG`; defaults to `info` for this crate.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,retail_ledger=debug"));
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .init();
}
