//! Treasury: the money ledger.
//!
//! The cash balance is never stored; it is always folded from the opening
//! balance plus the completed, non-deferred transaction log. Expenses above
//! the approval threshold park as pending and stay out of the fold until
//! approved.

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::info;

use crate::db::{self, LedgerState};
use crate::error::LedgerError;
use crate::models::{
    Operator, PartyKind, PaymentMethod, Transaction, TransactionKind, TransactionStatus,
};

// ---------------------------------------------------------------------------
// Balance fold
// ---------------------------------------------------------------------------

/// Signed treasury effect of one transaction. Pending/rejected rows and
/// deferred payment methods contribute nothing; shift markers and stock
/// adjustments are informational only.
pub(crate) fn treasury_effect(tx: &Transaction) -> f64 {
    if tx.status != TransactionStatus::Completed || tx.payment_method.is_deferred() {
        return 0.0;
    }
    match tx.kind {
        TransactionKind::Sale | TransactionKind::Capital => tx.amount,
        TransactionKind::Purchase | TransactionKind::Expense | TransactionKind::Withdrawal => {
            -tx.amount
        }
        // Money flows back out on a customer return, back in on a
        // supplier return.
        TransactionKind::Return => match tx.related_party {
            Some(PartyKind::Supplier) => tx.amount,
            _ => -tx.amount,
        },
        TransactionKind::Settlement => match tx.related_party {
            Some(PartyKind::Supplier) => -tx.amount,
            _ => tx.amount,
        },
        TransactionKind::Adjustment
        | TransactionKind::ShiftOpen
        | TransactionKind::ShiftClose => 0.0,
    }
}

/// Current treasury balance: opening balance plus the fold of the full log.
pub fn cash_balance(state: &LedgerState) -> Result<f64, LedgerError> {
    let conn = state.lock()?;
    cash_balance_tx(&conn)
}

pub(crate) fn cash_balance_tx(conn: &Connection) -> Result<f64, LedgerError> {
    let settings = db::load_settings(conn)?;
    let folded: f64 = db::list_transactions(conn)?
        .iter()
        .map(treasury_effect)
        .sum();
    Ok(settings.opening_balance + folded)
}

// ---------------------------------------------------------------------------
// Expenses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewExpense {
    pub amount: f64,
    pub category: String,
    pub description: String,
    pub payment_method: PaymentMethod,
}

/// Record an expense. Amounts above the approval threshold (when the
/// threshold is non-zero) are stored pending and take no treasury effect
/// until approved.
pub fn record_expense(
    state: &LedgerState,
    input: &NewExpense,
    operator: &Operator,
) -> Result<Transaction, LedgerError> {
    if input.amount <= 0.0 {
        return Err(LedgerError::InvalidInput("expense amount must be positive".into()));
    }
    if input.payment_method.is_deferred() {
        return Err(LedgerError::InvalidInput(
            "expenses cannot use the deferred payment method".into(),
        ));
    }
    let conn = state.lock()?;
    let settings = db::load_settings(&conn)?;
    let threshold = settings.expense_approval_threshold;
    let status = if threshold > 0.0 && input.amount > threshold {
        TransactionStatus::Pending
    } else {
        TransactionStatus::Completed
    };
    let shift_id = crate::shifts::active_shift_tx(&conn)?.map(|s| s.id);
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<Transaction, LedgerError> {
        let id = db::take_reference_id(&conn, TransactionKind::Expense)?;
        let tx = Transaction {
            id,
            kind: TransactionKind::Expense,
            date: now.clone(),
            amount: input.amount,
            payment_method: input.payment_method,
            description: input.description.clone(),
            category: Some(input.category.clone()),
            related_party: None,
            related_id: None,
            items: None,
            status,
            due_date: None,
            is_direct_sale: false,
            shift_id,
            reverses: None,
        };
        db::insert_transaction(&conn, &tx)?;
        crate::audit::log_activity(
            &conn,
            operator,
            "expense.record",
            &format!("{} {} ({})", tx.id, input.amount, input.category),
        )?;
        Ok(tx)
    })();

    match result {
        Ok(tx) => {
            conn.execute_batch("COMMIT")?;
            info!(
                tx_id = %tx.id,
                amount = input.amount,
                status = tx.status.as_str(),
                "Expense recorded"
            );
            Ok(tx)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// All expenses still waiting for approval, oldest first.
pub fn pending_expenses(state: &LedgerState) -> Result<Vec<Transaction>, LedgerError> {
    let conn = state.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM transactions
         WHERE kind = 'expense' AND status = 'pending' ORDER BY rowid ASC",
        crate::models::TX_COLUMNS
    ))?;
    let rows = stmt.query_map([], Transaction::from_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

fn resolve_pending_expense(
    state: &LedgerState,
    id: &str,
    to: TransactionStatus,
    operator: &Operator,
) -> Result<Transaction, LedgerError> {
    let conn = state.lock()?;
    let tx = db::get_transaction(&conn, id)?;
    if tx.kind != TransactionKind::Expense {
        return Err(LedgerError::InvalidApproval(format!(
            "{id} is not an expense"
        )));
    }
    if tx.status != TransactionStatus::Pending {
        return Err(LedgerError::InvalidApproval(format!(
            "{id} is already {}",
            tx.status.as_str()
        )));
    }

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<(), LedgerError> {
        // The only permitted mutation of a stored transaction.
        conn.execute(
            "UPDATE transactions SET status = ?1 WHERE id = ?2",
            params![to, id],
        )?;
        let action = match to {
            TransactionStatus::Completed => "expense.approve",
            _ => "expense.reject",
        };
        crate::audit::log_activity(&conn, operator, action, id)?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            info!(tx_id = id, status = to.as_str(), "Expense resolved");
            db::get_transaction(&conn, id)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Approve a pending expense; it starts counting against the treasury.
pub fn approve_expense(
    state: &LedgerState,
    id: &str,
    operator: &Operator,
) -> Result<Transaction, LedgerError> {
    resolve_pending_expense(state, id, TransactionStatus::Completed, operator)
}

/// Reject a pending expense; the row stays for audit but never affects
/// any balance.
pub fn reject_expense(
    state: &LedgerState,
    id: &str,
    operator: &Operator,
) -> Result<Transaction, LedgerError> {
    resolve_pending_expense(state, id, TransactionStatus::Rejected, operator)
}

// ---------------------------------------------------------------------------
// Debt settlement
// ---------------------------------------------------------------------------

/// Settle part or all of a party's debt in received/paid money.
///
/// Customer settlements bring cash in and raise the customer balance toward
/// zero; supplier settlements pay cash out and lower what we owe.
pub fn settle_debt(
    state: &LedgerState,
    party: PartyKind,
    party_id: i64,
    amount: f64,
    method: PaymentMethod,
    operator: &Operator,
) -> Result<Transaction, LedgerError> {
    if amount <= 0.0 {
        return Err(LedgerError::InvalidInput("settlement amount must be positive".into()));
    }
    if method.is_deferred() {
        return Err(LedgerError::InvalidInput(
            "a settlement is a money movement, it cannot be deferred".into(),
        ));
    }
    let conn = state.lock()?;
    let party_name = match party {
        PartyKind::Customer => crate::parties::get_customer_tx(&conn, party_id)?.name,
        PartyKind::Supplier => crate::parties::get_supplier_tx(&conn, party_id)?.name,
    };
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<Transaction, LedgerError> {
        match party {
            PartyKind::Customer => {
                conn.execute(
                    "UPDATE customers SET balance = balance + ?1, updated_at = ?2 WHERE id = ?3",
                    params![amount, now, party_id],
                )?;
            }
            PartyKind::Supplier => {
                conn.execute(
                    "UPDATE suppliers SET balance = balance - ?1, updated_at = ?2 WHERE id = ?3",
                    params![amount, now, party_id],
                )?;
            }
        }

        let id = db::take_reference_id(&conn, TransactionKind::Settlement)?;
        let tx = Transaction {
            id,
            kind: TransactionKind::Settlement,
            date: now.clone(),
            amount,
            payment_method: method,
            description: format!("debt settlement: {party_name}"),
            category: None,
            related_party: Some(party),
            related_id: Some(party_id),
            items: None,
            status: TransactionStatus::Completed,
            due_date: None,
            is_direct_sale: false,
            shift_id: None,
            reverses: None,
        };
        db::insert_transaction(&conn, &tx)?;
        crate::audit::log_activity(
            &conn,
            operator,
            "debt.settle",
            &format!("{} {} {} {}", tx.id, party.as_str(), party_id, amount),
        )?;
        Ok(tx)
    })();

    match result {
        Ok(tx) => {
            conn.execute_batch("COMMIT")?;
            info!(tx_id = %tx.id, party = party.as_str(), party_id, amount, "Debt settled");
            Ok(tx)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Capital movements
// ---------------------------------------------------------------------------

fn record_capital_movement(
    state: &LedgerState,
    kind: TransactionKind,
    amount: f64,
    description: &str,
    operator: &Operator,
) -> Result<Transaction, LedgerError> {
    if amount <= 0.0 {
        return Err(LedgerError::InvalidInput("amount must be positive".into()));
    }
    let conn = state.lock()?;
    let shift_id = crate::shifts::active_shift_tx(&conn)?.map(|s| s.id);
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<Transaction, LedgerError> {
        let id = db::take_reference_id(&conn, kind)?;
        let tx = Transaction {
            id,
            kind,
            date: now.clone(),
            amount,
            payment_method: PaymentMethod::Cash,
            description: description.to_string(),
            category: None,
            related_party: None,
            related_id: None,
            items: None,
            status: TransactionStatus::Completed,
            due_date: None,
            is_direct_sale: false,
            shift_id,
            reverses: None,
        };
        db::insert_transaction(&conn, &tx)?;
        let action = match kind {
            TransactionKind::Capital => "capital.inject",
            _ => "capital.withdraw",
        };
        crate::audit::log_activity(&conn, operator, action, &format!("{} {amount}", tx.id))?;
        Ok(tx)
    })();

    match result {
        Ok(tx) => {
            conn.execute_batch("COMMIT")?;
            info!(tx_id = %tx.id, kind = kind.as_str(), amount, "Capital movement recorded");
            Ok(tx)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Owner puts money into the business.
pub fn record_capital_injection(
    state: &LedgerState,
    amount: f64,
    description: &str,
    operator: &Operator,
) -> Result<Transaction, LedgerError> {
    record_capital_movement(state, TransactionKind::Capital, amount, description, operator)
}

/// Owner takes money out of the business.
pub fn record_owner_withdrawal(
    state: &LedgerState,
    amount: f64,
    description: &str,
    operator: &Operator,
) -> Result<Transaction, LedgerError> {
    record_capital_movement(state, TransactionKind::Withdrawal, amount, description, operator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LedgerState;
    use crate::models::CustomerType;
    use crate::parties::{add_customer, add_supplier, NewCustomer, NewSupplier};

    fn op() -> Operator {
        Operator::new(1, "admin")
    }

    fn set_opening_balance(state: &LedgerState, amount: f64) {
        let conn = state.lock().unwrap();
        let mut s = db::load_settings(&conn).unwrap();
        s.opening_balance = amount;
        db::save_settings(&conn, &s).unwrap();
    }

    fn expense(amount: f64) -> NewExpense {
        NewExpense {
            amount,
            category: "rent".into(),
            description: "monthly rent".into(),
            payment_method: PaymentMethod::Cash,
        }
    }

    #[test]
    fn test_balance_starts_at_opening_balance() {
        let state = LedgerState::open_in_memory().unwrap();
        set_opening_balance(&state, 50000.0);
        assert_eq!(cash_balance(&state).unwrap(), 50000.0);
    }

    #[test]
    fn test_completed_expense_lowers_balance() {
        let state = LedgerState::open_in_memory().unwrap();
        set_opening_balance(&state, 10000.0);
        record_expense(&state, &expense(1500.0), &op()).unwrap();
        assert!((cash_balance(&state).unwrap() - 8500.0).abs() < 0.001);
    }

    #[test]
    fn test_expense_above_threshold_parks_pending() {
        let state = LedgerState::open_in_memory().unwrap();
        set_opening_balance(&state, 10000.0);
        {
            let conn = state.lock().unwrap();
            let mut s = db::load_settings(&conn).unwrap();
            s.expense_approval_threshold = 2000.0;
            db::save_settings(&conn, &s).unwrap();
        }
        let tx = record_expense(&state, &expense(5000.0), &op()).unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        // Pending money has not left yet.
        assert_eq!(cash_balance(&state).unwrap(), 10000.0);

        approve_expense(&state, &tx.id, &op()).unwrap();
        assert!((cash_balance(&state).unwrap() - 5000.0).abs() < 0.001);
    }

    #[test]
    fn test_rejected_expense_never_counts() {
        let state = LedgerState::open_in_memory().unwrap();
        set_opening_balance(&state, 10000.0);
        {
            let conn = state.lock().unwrap();
            let mut s = db::load_settings(&conn).unwrap();
            s.expense_approval_threshold = 2000.0;
            db::save_settings(&conn, &s).unwrap();
        }
        let tx = record_expense(&state, &expense(3000.0), &op()).unwrap();
        reject_expense(&state, &tx.id, &op()).unwrap();
        assert_eq!(cash_balance(&state).unwrap(), 10000.0);

        // Terminal states cannot be re-resolved.
        let err = approve_expense(&state, &tx.id, &op()).unwrap_err();
        assert_eq!(err.code(), "invalid_approval");
    }

    #[test]
    fn test_small_expense_skips_approval_when_threshold_set() {
        let state = LedgerState::open_in_memory().unwrap();
        {
            let conn = state.lock().unwrap();
            let mut s = db::load_settings(&conn).unwrap();
            s.expense_approval_threshold = 2000.0;
            db::save_settings(&conn, &s).unwrap();
        }
        let tx = record_expense(&state, &expense(500.0), &op()).unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert!(pending_expenses(&state).unwrap().is_empty());
    }

    #[test]
    fn test_customer_settlement_brings_cash_in() {
        let state = LedgerState::open_in_memory().unwrap();
        set_opening_balance(&state, 1000.0);
        let c = add_customer(
            &state,
            &NewCustomer {
                name: "site".into(),
                phone: String::new(),
                customer_type: CustomerType::Business,
                opening_balance: -400.0,
                credit_limit: 0.0,
            },
            &op(),
        )
        .unwrap();

        settle_debt(&state, PartyKind::Customer, c.id, 400.0, PaymentMethod::Cash, &op()).unwrap();
        assert_eq!(crate::parties::get_customer(&state, c.id).unwrap().balance, 0.0);
        assert!((cash_balance(&state).unwrap() - 1400.0).abs() < 0.001);
    }

    #[test]
    fn test_supplier_settlement_pays_cash_out() {
        let state = LedgerState::open_in_memory().unwrap();
        set_opening_balance(&state, 5000.0);
        let s = add_supplier(
            &state,
            &NewSupplier {
                name: "factory".into(),
                phone: String::new(),
                opening_balance: 3000.0,
            },
            &op(),
        )
        .unwrap();

        settle_debt(&state, PartyKind::Supplier, s.id, 1000.0, PaymentMethod::Instapay, &op())
            .unwrap();
        assert_eq!(crate::parties::get_supplier(&state, s.id).unwrap().balance, 2000.0);
        assert!((cash_balance(&state).unwrap() - 4000.0).abs() < 0.001);
    }

    #[test]
    fn test_deferred_settlement_rejected() {
        let state = LedgerState::open_in_memory().unwrap();
        let c = add_customer(
            &state,
            &NewCustomer {
                name: "x".into(),
                phone: String::new(),
                customer_type: CustomerType::Business,
                opening_balance: -100.0,
                credit_limit: 0.0,
            },
            &op(),
        )
        .unwrap();
        let err = settle_debt(
            &state,
            PartyKind::Customer,
            c.id,
            100.0,
            PaymentMethod::Deferred,
            &op(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[test]
    fn test_capital_injection_and_withdrawal() {
        let state = LedgerState::open_in_memory().unwrap();
        set_opening_balance(&state, 1000.0);
        let inj = record_capital_injection(&state, 20000.0, "owner top-up", &op()).unwrap();
        assert!(inj.id.starts_with("CAP-"));
        let wd = record_owner_withdrawal(&state, 3000.0, "owner draw", &op()).unwrap();
        assert!(wd.id.starts_with("WDR-"));
        assert!((cash_balance(&state).unwrap() - 18000.0).abs() < 0.001);
    }
}
