//! Purchase receiving: stock in from a supplier.

use chrono::Utc;
use rusqlite::params;
use tracing::info;

use crate::db::{self, LedgerState};
use crate::error::LedgerError;
use crate::models::{
    CartLine, Operator, PartyKind, PaymentMethod, Transaction, TransactionKind, TransactionStatus,
};

#[derive(Debug, Clone)]
pub struct PurchaseIntent {
    pub supplier_id: i64,
    pub items: Vec<CartLine>,
    pub payment_method: PaymentMethod,
    pub due_date: Option<String>,
}

/// Receive a purchase: stock in on every line, money out (or supplier debt
/// up when deferred), one purchase transaction appended. Priced at cost.
pub fn complete_purchase(
    state: &LedgerState,
    intent: &PurchaseIntent,
    operator: &Operator,
) -> Result<Transaction, LedgerError> {
    if intent.items.is_empty() {
        return Err(LedgerError::EmptyCart);
    }
    let conn = state.lock()?;
    let supplier = crate::parties::get_supplier_tx(&conn, intent.supplier_id)?;
    let total: f64 = intent
        .items
        .iter()
        .map(|l| l.cost_price * l.quantity)
        .sum();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<Transaction, LedgerError> {
        for line in &intent.items {
            let changed = conn.execute(
                "UPDATE products SET quantity = quantity + ?1, updated_at = ?2 WHERE id = ?3",
                params![line.quantity, now, line.product_id],
            )?;
            if changed == 0 {
                return Err(LedgerError::NotFound("product", line.product_id.to_string()));
            }
        }

        if intent.payment_method.is_deferred() {
            conn.execute(
                "UPDATE suppliers SET balance = balance + ?1, updated_at = ?2 WHERE id = ?3",
                params![total, now, supplier.id],
            )?;
        }

        let id = db::take_reference_id(&conn, TransactionKind::Purchase)?;
        let tx = Transaction {
            id,
            kind: TransactionKind::Purchase,
            date: now.clone(),
            amount: total,
            payment_method: intent.payment_method,
            description: format!("purchase from {}", supplier.name),
            category: None,
            related_party: Some(PartyKind::Supplier),
            related_id: Some(supplier.id),
            items: Some(intent.items.clone()),
            status: TransactionStatus::Completed,
            due_date: intent.due_date.clone(),
            is_direct_sale: false,
            shift_id: None,
            reverses: None,
        };
        db::insert_transaction(&conn, &tx)?;
        crate::audit::log_activity(
            &conn,
            operator,
            "purchase.complete",
            &format!("{} from {} ({})", tx.id, supplier.name, total),
        )?;
        Ok(tx)
    })();

    match result {
        Ok(tx) => {
            conn.execute_batch("COMMIT")?;
            info!(tx_id = %tx.id, amount = total, "Purchase completed");
            Ok(tx)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}
