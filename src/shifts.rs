//! Cashier shift sessions and drawer reconciliation.
//!
//! At most one shift is open at a time. Cash-method sales and completed
//! cash expenses/withdrawals recorded while a shift is open feed the
//! expected-drawer figure checked at close.

use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::db::{self, LedgerState};
use crate::error::LedgerError;
use crate::models::{
    Operator, PaymentMethod, Shift, ShiftStatus, Transaction, TransactionKind, TransactionStatus,
};

/// Close-of-shift report: the closed shift plus the cash variance
/// (counted minus expected).
#[derive(Debug, Clone)]
pub struct ShiftCloseReport {
    pub shift: Shift,
    pub expected_cash: f64,
    pub counted_cash: f64,
    pub variance: f64,
}

const SHIFT_COLUMNS: &str = "id, user_id, user_name, start_time, end_time, start_cash, \
     end_cash, expected_cash, total_sales, sales_by_method, status";

fn map_shift(row: &rusqlite::Row<'_>) -> rusqlite::Result<Shift> {
    let by_method_json: String = row.get(9)?;
    let sales_by_method: BTreeMap<PaymentMethod, f64> = serde_json::from_str(&by_method_json)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, e.into())
        })?;
    Ok(Shift {
        id: row.get(0)?,
        user_id: row.get(1)?,
        user_name: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
        start_cash: row.get(5)?,
        end_cash: row.get(6)?,
        expected_cash: row.get(7)?,
        total_sales: row.get(8)?,
        sales_by_method,
        status: row.get(10)?,
    })
}

/// The currently open shift, if any.
pub fn active_shift(state: &LedgerState) -> Result<Option<Shift>, LedgerError> {
    let conn = state.lock()?;
    active_shift_tx(&conn)
}

pub(crate) fn active_shift_tx(conn: &Connection) -> Result<Option<Shift>, LedgerError> {
    conn.query_row(
        &format!("SELECT {SHIFT_COLUMNS} FROM shifts WHERE status = 'open'"),
        [],
        map_shift,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_shift(state: &LedgerState, id: i64) -> Result<Shift, LedgerError> {
    let conn = state.lock()?;
    get_shift_tx(&conn, id)
}

pub(crate) fn get_shift_tx(conn: &Connection, id: i64) -> Result<Shift, LedgerError> {
    conn.query_row(
        &format!("SELECT {SHIFT_COLUMNS} FROM shifts WHERE id = ?1"),
        params![id],
        map_shift,
    )
    .optional()?
    .ok_or_else(|| LedgerError::NotFound("shift", id.to_string()))
}

/// Open a shift with a counted starting float. Fails with `ShiftAlreadyOpen`
/// when another shift is still open.
pub fn open_shift(
    state: &LedgerState,
    start_cash: f64,
    operator: &Operator,
) -> Result<Shift, LedgerError> {
    if start_cash < 0.0 {
        return Err(LedgerError::InvalidInput("start cash is negative".into()));
    }
    let conn = state.lock()?;
    if let Some(open) = active_shift_tx(&conn)? {
        return Err(LedgerError::ShiftAlreadyOpen(open.id));
    }
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<Shift, LedgerError> {
        conn.execute(
            "INSERT INTO shifts (user_id, user_name, start_time, start_cash, status)
             VALUES (?1, ?2, ?3, ?4, 'open')",
            params![operator.id, operator.name, now, start_cash],
        )?;
        let shift_id = conn.last_insert_rowid();

        // Marker row so the log alone tells the full story of the day.
        let id = db::take_reference_id(&conn, TransactionKind::ShiftOpen)?;
        let tx = Transaction {
            id,
            kind: TransactionKind::ShiftOpen,
            date: now.clone(),
            amount: start_cash,
            payment_method: PaymentMethod::Cash,
            description: format!("shift opened by {}", operator.name),
            category: None,
            related_party: None,
            related_id: None,
            items: None,
            status: TransactionStatus::Completed,
            due_date: None,
            is_direct_sale: false,
            shift_id: Some(shift_id),
            reverses: None,
        };
        db::insert_transaction(&conn, &tx)?;
        crate::audit::log_activity(
            &conn,
            operator,
            "shift.open",
            &format!("shift {shift_id}, start cash {start_cash}"),
        )?;
        get_shift_tx(&conn, shift_id)
    })();

    match result {
        Ok(shift) => {
            conn.execute_batch("COMMIT")?;
            info!(shift_id = shift.id, start_cash, "Shift opened");
            Ok(shift)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Expected drawer cash for a shift: starting float plus cash-method sales,
/// minus completed cash expenses and withdrawals recorded during it.
pub(crate) fn expected_cash_tx(conn: &Connection, shift: &Shift) -> Result<f64, LedgerError> {
    let cash_sales = shift
        .sales_by_method
        .get(&PaymentMethod::Cash)
        .copied()
        .unwrap_or(0.0);
    let cash_out: f64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM transactions
         WHERE shift_id = ?1
           AND kind IN ('expense', 'withdrawal')
           AND payment_method = 'cash'
           AND status = 'completed'",
        params![shift.id],
        |row| row.get(0),
    )?;
    Ok(shift.start_cash + cash_sales - cash_out)
}

/// Close the open shift against a counted drawer amount.
///
/// The shift row keeps both figures; the report carries the variance so the
/// caller can surface over/short without recomputing.
pub fn close_shift(
    state: &LedgerState,
    counted_cash: f64,
    operator: &Operator,
) -> Result<ShiftCloseReport, LedgerError> {
    let conn = state.lock()?;
    let shift = active_shift_tx(&conn)?.ok_or(LedgerError::NoOpenShift)?;
    let expected = expected_cash_tx(&conn, &shift)?;
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<Shift, LedgerError> {
        conn.execute(
            "UPDATE shifts SET status = 'closed', end_time = ?1, end_cash = ?2,
                    expected_cash = ?3, updated_at = ?1
             WHERE id = ?4",
            params![now, counted_cash, expected, shift.id],
        )?;

        let id = db::take_reference_id(&conn, TransactionKind::ShiftClose)?;
        let tx = Transaction {
            id,
            kind: TransactionKind::ShiftClose,
            date: now.clone(),
            amount: counted_cash,
            payment_method: PaymentMethod::Cash,
            description: format!(
                "shift closed by {} (expected {expected:.2}, counted {counted_cash:.2})",
                operator.name
            ),
            category: None,
            related_party: None,
            related_id: None,
            items: None,
            status: TransactionStatus::Completed,
            due_date: None,
            is_direct_sale: false,
            shift_id: Some(shift.id),
            reverses: None,
        };
        db::insert_transaction(&conn, &tx)?;
        crate::audit::log_activity(
            &conn,
            operator,
            "shift.close",
            &format!(
                "shift {}, expected {expected:.2}, counted {counted_cash:.2}",
                shift.id
            ),
        )?;
        get_shift_tx(&conn, shift.id)
    })();

    match result {
        Ok(closed) => {
            conn.execute_batch("COMMIT")?;
            let variance = counted_cash - expected;
            if variance.abs() > 0.001 {
                tracing::warn!(
                    shift_id = closed.id,
                    expected,
                    counted_cash,
                    variance,
                    "Shift closed with cash variance"
                );
            } else {
                info!(shift_id = closed.id, counted_cash, "Shift closed");
            }
            Ok(ShiftCloseReport {
                shift: closed,
                expected_cash: expected,
                counted_cash,
                variance,
            })
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Fold a completed sale into the open shift's running totals. Called inside
/// the sale's write transaction.
pub(crate) fn record_sale_for_shift(
    conn: &Connection,
    shift_id: i64,
    amount: f64,
    method: PaymentMethod,
) -> Result<(), LedgerError> {
    let shift = get_shift_tx(conn, shift_id)?;
    if shift.status != ShiftStatus::Open {
        return Err(LedgerError::ShiftNotOpen(shift_id));
    }
    let mut by_method = shift.sales_by_method;
    *by_method.entry(method).or_insert(0.0) += amount;
    let by_method_json = serde_json::to_string(&by_method)
        .map_err(|e| LedgerError::InvalidInput(format!("serialize shift totals: {e}")))?;
    conn.execute(
        "UPDATE shifts SET total_sales = total_sales + ?1, sales_by_method = ?2,
                updated_at = ?3
         WHERE id = ?4",
        params![amount, by_method_json, Utc::now().to_rfc3339(), shift_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LedgerState;

    fn op() -> Operator {
        Operator::new(7, "cashier")
    }

    #[test]
    fn test_open_then_second_open_fails() {
        let state = LedgerState::open_in_memory().unwrap();
        let shift = open_shift(&state, 1000.0, &op()).unwrap();
        assert_eq!(shift.status, ShiftStatus::Open);
        assert_eq!(shift.start_cash, 1000.0);

        let err = open_shift(&state, 500.0, &op()).unwrap_err();
        assert_eq!(err.code(), "shift_already_open");
    }

    #[test]
    fn test_open_writes_marker_transaction() {
        let state = LedgerState::open_in_memory().unwrap();
        let shift = open_shift(&state, 1000.0, &op()).unwrap();
        let conn = state.lock().unwrap();
        let txs = crate::db::list_transactions(&conn).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].kind, TransactionKind::ShiftOpen);
        assert!(txs[0].id.starts_with("SHF-"));
        assert_eq!(txs[0].shift_id, Some(shift.id));
    }

    #[test]
    fn test_close_without_open_fails() {
        let state = LedgerState::open_in_memory().unwrap();
        let err = close_shift(&state, 0.0, &op()).unwrap_err();
        assert_eq!(err.code(), "no_open_shift");
    }

    #[test]
    fn test_expected_cash_and_variance() {
        let state = LedgerState::open_in_memory().unwrap();
        let shift = open_shift(&state, 1000.0, &op()).unwrap();
        {
            let conn = state.lock().unwrap();
            record_sale_for_shift(&conn, shift.id, 650.0, PaymentMethod::Cash).unwrap();
            record_sale_for_shift(&conn, shift.id, 300.0, PaymentMethod::Wallet).unwrap();
        }
        // Wallet sales never sit in the drawer.
        let report = close_shift(&state, 1600.0, &op()).unwrap();
        assert!((report.expected_cash - 1650.0).abs() < 0.001);
        assert!((report.variance - -50.0).abs() < 0.001);
        assert_eq!(report.shift.status, ShiftStatus::Closed);
        assert_eq!(report.shift.total_sales, 950.0);
    }

    #[test]
    fn test_cash_expense_during_shift_lowers_expected_cash() {
        let state = LedgerState::open_in_memory().unwrap();
        open_shift(&state, 1000.0, &op()).unwrap();
        let exp = crate::treasury::record_expense(
            &state,
            &crate::treasury::NewExpense {
                amount: 200.0,
                category: "supplies".into(),
                description: "drawer cash spent on tape".into(),
                payment_method: PaymentMethod::Cash,
            },
            &op(),
        )
        .unwrap();
        assert!(exp.shift_id.is_some());

        let report = close_shift(&state, 800.0, &op()).unwrap();
        assert!((report.expected_cash - 800.0).abs() < 0.001);
        assert!(report.variance.abs() < 0.001);
    }

    #[test]
    fn test_reopen_after_close_allowed() {
        let state = LedgerState::open_in_memory().unwrap();
        open_shift(&state, 100.0, &op()).unwrap();
        close_shift(&state, 100.0, &op()).unwrap();
        let again = open_shift(&state, 200.0, &op()).unwrap();
        assert_eq!(again.start_cash, 200.0);
        assert!(active_shift(&state).unwrap().is_some());
    }
}
