//! Error taxonomy for the ledger engine.
//!
//! Every public operation returns `Result<_, LedgerError>`. All variants are
//! local, synchronous and recoverable; a failed operation leaves the ledger
//! untouched (operations commit through a single SQLite transaction).

use thiserror::Error;

/// Domain and storage errors surfaced to the UI shell.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Strict mode is on and one or more cart lines exceed available stock.
    /// Carries the product names of the offending lines.
    #[error("insufficient stock for: {}", .0.join(", "))]
    InsufficientStock(Vec<String>),

    /// A sale, quotation conversion or shift close found no open shift.
    #[error("no open shift")]
    NoOpenShift,

    /// `open_shift` while another shift is still open.
    #[error("a shift is already open (id {0})")]
    ShiftAlreadyOpen(i64),

    /// A shift-scoped operation named a shift that is not the open one.
    #[error("shift {0} is not open")]
    ShiftNotOpen(i64),

    /// One or more lines are priced below cost and the intent did not carry
    /// the acknowledgment flag. Carries the product names.
    #[error("below-cost sale not acknowledged for: {}", .0.join(", "))]
    BelowCostUnconfirmed(Vec<String>),

    /// Deferred sale would push the customer past the credit limit and the
    /// intent did not carry the acknowledgment flag.
    #[error("credit limit exceeded: debt would reach {projected_debt:.2} against limit {credit_limit:.2}")]
    CreditLimitExceeded {
        projected_debt: f64,
        credit_limit: f64,
    },

    /// Deferred payment without a due date.
    #[error("deferred payment requires a due date")]
    MissingDueDate,

    /// Consumer-type customers may never buy on deferred terms.
    #[error("consumer customers cannot use deferred payment")]
    ConsumerCannotDefer,

    /// Reversal target missing, of the wrong kind, not completed, or
    /// already reversed.
    #[error("invalid reversal: {0}")]
    InvalidReversal(String),

    /// Approve/reject on a transaction that is not pending.
    #[error("invalid approval transition: {0}")]
    InvalidApproval(String),

    /// Sale or quotation with an empty cart.
    #[error("cart is empty")]
    EmptyCart,

    /// Entity lookup failure: `NotFound(kind, id)`.
    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    /// Catch-all precondition failure (negative amount, deferred settlement…).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Recomputed balances disagree with the cached aggregate columns.
    #[error("ledger integrity check failed:\n{0}")]
    DataIntegrity(String),

    /// Underlying SQLite failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The connection mutex was poisoned by a panicking thread.
    #[error("ledger state lock poisoned")]
    StatePoisoned,
}

impl LedgerError {
    /// Stable machine-readable code for the UI shell to key messages on.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InsufficientStock(_) => "insufficient_stock",
            LedgerError::NoOpenShift => "no_open_shift",
            LedgerError::ShiftAlreadyOpen(_) => "shift_already_open",
            LedgerError::ShiftNotOpen(_) => "shift_not_open",
            LedgerError::BelowCostUnconfirmed(_) => "below_cost_unconfirmed",
            LedgerError::CreditLimitExceeded { .. } => "credit_limit_exceeded",
            LedgerError::MissingDueDate => "missing_due_date",
            LedgerError::ConsumerCannotDefer => "consumer_cannot_defer",
            LedgerError::InvalidReversal(_) => "invalid_reversal",
            LedgerError::InvalidApproval(_) => "invalid_approval",
            LedgerError::EmptyCart => "empty_cart",
            LedgerError::NotFound(..) => "not_found",
            LedgerError::InvalidInput(_) => "invalid_input",
            LedgerError::DataIntegrity(_) => "data_integrity",
            LedgerError::Storage(_) => "storage",
            LedgerError::StatePoisoned => "state_poisoned",
        }
    }
}
