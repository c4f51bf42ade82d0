//! Reversals: full returns of sales and purchases.
//!
//! The original row is never touched. A reversal appends a `return`
//! transaction pointing back at it via `reverses` and applies the exact
//! inverse of the original's stock, balance and treasury effects.

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::info;

use crate::db::{self, LedgerState};
use crate::error::LedgerError;
use crate::models::{
    Operator, PartyKind, Transaction, TransactionKind, TransactionStatus,
};

fn already_reversed(conn: &Connection, id: &str) -> Result<bool, LedgerError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM transactions WHERE reverses = ?1",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Reverse a completed sale or purchase in full.
pub fn reverse_transaction(
    state: &LedgerState,
    original_id: &str,
    operator: &Operator,
) -> Result<Transaction, LedgerError> {
    let conn = state.lock()?;
    let original = db::get_transaction(&conn, original_id)?;

    match original.kind {
        TransactionKind::Sale | TransactionKind::Purchase => {}
        other => {
            return Err(LedgerError::InvalidReversal(format!(
                "cannot reverse a {other} transaction"
            )))
        }
    }
    if original.status != TransactionStatus::Completed {
        return Err(LedgerError::InvalidReversal(format!(
            "{original_id} is {}, only completed transactions can be reversed",
            original.status.as_str()
        )));
    }
    if already_reversed(&conn, original_id)? {
        return Err(LedgerError::InvalidReversal(format!(
            "{original_id} has already been reversed"
        )));
    }

    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<Transaction, LedgerError> {
        // Undo the stock movement. Direct sales never moved stock, so their
        // reversal moves none back.
        if let Some(items) = &original.items {
            if !original.is_direct_sale {
                let sign = match original.kind {
                    TransactionKind::Sale => 1.0,
                    _ => -1.0,
                };
                for line in items {
                    conn.execute(
                        "UPDATE products SET quantity = quantity + ?1, updated_at = ?2
                         WHERE id = ?3",
                        params![sign * line.quantity, now, line.product_id],
                    )?;
                }
            }
        }

        // Undo the debt posting for deferred originals. Paid originals are
        // handled by the treasury fold on the return row itself.
        if original.payment_method.is_deferred() {
            match (original.kind, original.related_party, original.related_id) {
                (TransactionKind::Sale, Some(PartyKind::Customer), Some(cid)) => {
                    conn.execute(
                        "UPDATE customers SET balance = balance + ?1, updated_at = ?2
                         WHERE id = ?3",
                        params![original.amount, now, cid],
                    )?;
                }
                (TransactionKind::Purchase, Some(PartyKind::Supplier), Some(sid)) => {
                    conn.execute(
                        "UPDATE suppliers SET balance = balance - ?1, updated_at = ?2
                         WHERE id = ?3",
                        params![original.amount, now, sid],
                    )?;
                }
                _ => {
                    return Err(LedgerError::DataIntegrity(format!(
                        "deferred transaction {original_id} has no related party"
                    )))
                }
            }
        }

        let id = db::take_reference_id(&conn, TransactionKind::Return)?;
        let tx = Transaction {
            id,
            kind: TransactionKind::Return,
            date: now.clone(),
            amount: original.amount,
            payment_method: original.payment_method,
            description: format!("reversal of {original_id}"),
            category: None,
            related_party: original.related_party,
            related_id: original.related_id,
            items: original.items.clone(),
            status: TransactionStatus::Completed,
            due_date: None,
            is_direct_sale: original.is_direct_sale,
            shift_id: None,
            reverses: Some(original_id.to_string()),
        };
        db::insert_transaction(&conn, &tx)?;
        crate::audit::log_activity(
            &conn,
            operator,
            "transaction.reverse",
            &format!("{} reverses {original_id}", tx.id),
        )?;
        Ok(tx)
    })();

    match result {
        Ok(tx) => {
            conn.execute_batch("COMMIT")?;
            info!(tx_id = %tx.id, original = original_id, "Transaction reversed");
            Ok(tx)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LedgerState;
    use crate::inventory::{add_product, get_product, NewProduct};
    use crate::models::{CartLine, CustomerType, PaymentMethod};
    use crate::parties::{add_customer, add_supplier, NewCustomer, NewSupplier};
    use crate::purchases::{complete_purchase, PurchaseIntent};
    use crate::sales::{complete_sale, SaleIntent};

    fn op() -> Operator {
        Operator::new(1, "admin")
    }

    fn seed_product(state: &LedgerState, qty: f64) -> i64 {
        add_product(
            state,
            &NewProduct {
                sku: "CRN-001".into(),
                name: "cornice".into(),
                category: "moulding".into(),
                opening_quantity: qty,
                cost_price: 45.0,
                sell_price: 65.0,
                unit: "meter".into(),
                min_stock_alert: 0.0,
            },
            &op(),
        )
        .unwrap()
        .id
    }

    fn line(pid: i64, qty: f64) -> CartLine {
        CartLine {
            product_id: pid,
            name: "cornice".into(),
            quantity: qty,
            cost_price: 45.0,
            sell_price: 65.0,
            discount: 0.0,
        }
    }

    fn sell(state: &LedgerState, pid: i64, cid: i64, method: PaymentMethod) -> Transaction {
        complete_sale(
            state,
            &SaleIntent {
                customer_id: cid,
                items: vec![line(pid, 2.0)],
                payment_method: method,
                due_date: if method.is_deferred() {
                    Some("2026-09-30".into())
                } else {
                    None
                },
                is_direct_sale: false,
                below_cost_ack: false,
                credit_limit_ack: false,
            },
            &op(),
        )
        .unwrap()
    }

    #[test]
    fn test_reversing_cash_sale_restores_everything() {
        let state = LedgerState::open_in_memory().unwrap();
        let pid = seed_product(&state, 100.0);
        let cid = add_customer(
            &state,
            &NewCustomer {
                name: "c".into(),
                phone: String::new(),
                customer_type: CustomerType::Consumer,
                opening_balance: 0.0,
                credit_limit: 0.0,
            },
            &op(),
        )
        .unwrap()
        .id;

        crate::shifts::open_shift(&state, 0.0, &op()).unwrap();
        let sale = sell(&state, pid, cid, PaymentMethod::Cash);
        assert_eq!(get_product(&state, pid).unwrap().quantity, 98.0);
        assert!((crate::treasury::cash_balance(&state).unwrap() - 130.0).abs() < 0.001);

        let ret = reverse_transaction(&state, &sale.id, &op()).unwrap();
        assert!(ret.id.starts_with("RET-"));
        assert_eq!(ret.reverses.as_deref(), Some(sale.id.as_str()));
        assert_eq!(get_product(&state, pid).unwrap().quantity, 100.0);
        assert!(crate::treasury::cash_balance(&state).unwrap().abs() < 0.001);
    }

    #[test]
    fn test_reversing_deferred_sale_clears_debt() {
        let state = LedgerState::open_in_memory().unwrap();
        let pid = seed_product(&state, 100.0);
        let cid = add_customer(
            &state,
            &NewCustomer {
                name: "b".into(),
                phone: String::new(),
                customer_type: CustomerType::Business,
                opening_balance: 0.0,
                credit_limit: 0.0,
            },
            &op(),
        )
        .unwrap()
        .id;

        crate::shifts::open_shift(&state, 0.0, &op()).unwrap();
        let sale = sell(&state, pid, cid, PaymentMethod::Deferred);
        assert_eq!(crate::parties::get_customer(&state, cid).unwrap().balance, -130.0);

        reverse_transaction(&state, &sale.id, &op()).unwrap();
        assert_eq!(crate::parties::get_customer(&state, cid).unwrap().balance, 0.0);
        // Deferred both ways: treasury never moved.
        assert!(crate::treasury::cash_balance(&state).unwrap().abs() < 0.001);
    }

    #[test]
    fn test_reversing_purchase_returns_stock_and_cash() {
        let state = LedgerState::open_in_memory().unwrap();
        let pid = seed_product(&state, 10.0);
        let sid = add_supplier(
            &state,
            &NewSupplier {
                name: "factory".into(),
                phone: String::new(),
                opening_balance: 0.0,
            },
            &op(),
        )
        .unwrap()
        .id;

        let purchase = complete_purchase(
            &state,
            &PurchaseIntent {
                supplier_id: sid,
                items: vec![line(pid, 20.0)],
                payment_method: PaymentMethod::Cash,
                due_date: None,
            },
            &op(),
        )
        .unwrap();
        assert_eq!(get_product(&state, pid).unwrap().quantity, 30.0);

        reverse_transaction(&state, &purchase.id, &op()).unwrap();
        assert_eq!(get_product(&state, pid).unwrap().quantity, 10.0);
        assert!(crate::treasury::cash_balance(&state).unwrap().abs() < 0.001);
    }

    #[test]
    fn test_double_reversal_rejected() {
        let state = LedgerState::open_in_memory().unwrap();
        let pid = seed_product(&state, 100.0);
        let cid = add_customer(
            &state,
            &NewCustomer {
                name: "c".into(),
                phone: String::new(),
                customer_type: CustomerType::Consumer,
                opening_balance: 0.0,
                credit_limit: 0.0,
            },
            &op(),
        )
        .unwrap()
        .id;
        crate::shifts::open_shift(&state, 0.0, &op()).unwrap();
        let sale = sell(&state, pid, cid, PaymentMethod::Cash);
        reverse_transaction(&state, &sale.id, &op()).unwrap();
        let err = reverse_transaction(&state, &sale.id, &op()).unwrap_err();
        assert_eq!(err.code(), "invalid_reversal");
    }

    #[test]
    fn test_only_sales_and_purchases_reversible() {
        let state = LedgerState::open_in_memory().unwrap();
        let exp = crate::treasury::record_expense(
            &state,
            &crate::treasury::NewExpense {
                amount: 100.0,
                category: "misc".into(),
                description: String::new(),
                payment_method: PaymentMethod::Cash,
            },
            &op(),
        )
        .unwrap();
        let err = reverse_transaction(&state, &exp.id, &op()).unwrap_err();
        assert_eq!(err.code(), "invalid_reversal");
    }

    #[test]
    fn test_direct_sale_reversal_leaves_stock_alone() {
        let state = LedgerState::open_in_memory().unwrap();
        let pid = seed_product(&state, 5.0);
        let cid = add_customer(
            &state,
            &NewCustomer {
                name: "c".into(),
                phone: String::new(),
                customer_type: CustomerType::Consumer,
                opening_balance: 0.0,
                credit_limit: 0.0,
            },
            &op(),
        )
        .unwrap()
        .id;
        crate::shifts::open_shift(&state, 0.0, &op()).unwrap();
        let sale = complete_sale(
            &state,
            &SaleIntent {
                customer_id: cid,
                items: vec![line(pid, 3.0)],
                payment_method: PaymentMethod::Cash,
                due_date: None,
                is_direct_sale: true,
                below_cost_ack: false,
                credit_limit_ack: false,
            },
            &op(),
        )
        .unwrap();
        assert_eq!(get_product(&state, pid).unwrap().quantity, 5.0);
        reverse_transaction(&state, &sale.id, &op()).unwrap();
        assert_eq!(get_product(&state, pid).unwrap().quantity, 5.0);
    }
}
