//! Product catalog and stock adjustments.
//!
//! Stock quantities are cached aggregates; they are mutated only through the
//! operations in this crate (sale, purchase, return, adjustment) so the
//! transaction log can always reproduce them.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::db::{self, LedgerState};
use crate::error::LedgerError;
use crate::models::{
    CartLine, Operator, PaymentMethod, Product, Transaction, TransactionKind, TransactionStatus,
};

#[derive(Debug, Clone)]
pub struct NewProduct {
    pub sku: String,
    pub name: String,
    pub category: String,
    pub opening_quantity: f64,
    pub cost_price: f64,
    pub sell_price: f64,
    pub unit: String,
    pub min_stock_alert: f64,
}

pub fn add_product(
    state: &LedgerState,
    input: &NewProduct,
    operator: &Operator,
) -> Result<Product, LedgerError> {
    if input.sku.trim().is_empty() {
        return Err(LedgerError::InvalidInput("product sku is empty".into()));
    }
    let conn = state.lock()?;
    conn.execute(
        "INSERT INTO products (sku, name, category, quantity, opening_quantity,
                               cost_price, sell_price, unit, min_stock_alert)
         VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, ?7, ?8)",
        params![
            input.sku,
            input.name,
            input.category,
            input.opening_quantity,
            input.cost_price,
            input.sell_price,
            input.unit,
            input.min_stock_alert
        ],
    )?;
    let id = conn.last_insert_rowid();
    crate::audit::log_activity(&conn, operator, "product.add", &input.sku)?;
    info!(product_id = id, sku = %input.sku, "Product added");
    get_product_tx(&conn, id)
}

pub fn get_product(state: &LedgerState, id: i64) -> Result<Product, LedgerError> {
    let conn = state.lock()?;
    get_product_tx(&conn, id)
}

pub(crate) fn get_product_tx(conn: &Connection, id: i64) -> Result<Product, LedgerError> {
    conn.query_row(
        "SELECT id, sku, name, category, quantity, opening_quantity,
                cost_price, sell_price, unit, min_stock_alert
         FROM products WHERE id = ?1",
        params![id],
        map_product,
    )
    .optional()?
    .ok_or_else(|| LedgerError::NotFound("product", id.to_string()))
}

pub fn list_products(state: &LedgerState) -> Result<Vec<Product>, LedgerError> {
    let conn = state.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, sku, name, category, quantity, opening_quantity,
                cost_price, sell_price, unit, min_stock_alert
         FROM products ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([], map_product)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

/// Products at or below their minimum stock alert level.
pub fn low_stock_products(state: &LedgerState) -> Result<Vec<Product>, LedgerError> {
    let conn = state.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, sku, name, category, quantity, opening_quantity,
                cost_price, sell_price, unit, min_stock_alert
         FROM products WHERE quantity <= min_stock_alert ORDER BY quantity ASC",
    )?;
    let rows = stmt.query_map([], map_product)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

fn map_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        sku: row.get(1)?,
        name: row.get(2)?,
        category: row.get(3)?,
        quantity: row.get(4)?,
        opening_quantity: row.get(5)?,
        cost_price: row.get(6)?,
        sell_price: row.get(7)?,
        unit: row.get(8)?,
        min_stock_alert: row.get(9)?,
    })
}

// ---------------------------------------------------------------------------
// Stock adjustment
// ---------------------------------------------------------------------------

/// Apply a signed quantity diff to a product and log an `adjustment`
/// transaction carrying the reason.
///
/// Adjustments are the authorized escape hatch for correcting drift, so they
/// are never blocked by strict mode and may take stock negative.
pub fn record_stock_adjustment(
    state: &LedgerState,
    product_id: i64,
    quantity_diff: f64,
    reason: &str,
    operator: &Operator,
) -> Result<Transaction, LedgerError> {
    if quantity_diff == 0.0 {
        return Err(LedgerError::InvalidInput("adjustment diff is zero".into()));
    }
    let conn = state.lock()?;
    let product = get_product_tx(&conn, product_id)?;
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<Transaction, LedgerError> {
        conn.execute(
            "UPDATE products SET quantity = quantity + ?1, updated_at = ?2 WHERE id = ?3",
            params![quantity_diff, now, product_id],
        )?;

        let id = db::take_reference_id(&conn, TransactionKind::Adjustment)?;
        let tx = Transaction {
            id,
            kind: TransactionKind::Adjustment,
            date: now.clone(),
            amount: quantity_diff.abs() * product.cost_price,
            payment_method: PaymentMethod::Cash,
            description: reason.to_string(),
            category: None,
            related_party: None,
            related_id: None,
            // Single signed line so replay can fold the diff.
            items: Some(vec![CartLine {
                product_id,
                name: product.name.clone(),
                quantity: quantity_diff,
                cost_price: product.cost_price,
                sell_price: product.sell_price,
                discount: 0.0,
            }]),
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
            "stock.adjust",
            &format!("{} {:+} ({})", product.sku, quantity_diff, reason),
        )?;
        Ok(tx)
    })();

    match result {
        Ok(tx) => {
            conn.execute_batch("COMMIT")?;
            info!(
                product_id,
                diff = quantity_diff,
                tx_id = %tx.id,
                "Stock adjustment recorded"
            );
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

    fn op() -> Operator {
        Operator::new(1, "admin")
    }

    fn seed_product(state: &LedgerState, sku: &str, qty: f64) -> Product {
        add_product(
            state,
            &NewProduct {
                sku: sku.into(),
                name: format!("product {sku}"),
                category: "test".into(),
                opening_quantity: qty,
                cost_price: 45.0,
                sell_price: 65.0,
                unit: "meter".into(),
                min_stock_alert: 5.0,
            },
            &op(),
        )
        .unwrap()
    }

    #[test]
    fn test_adjustment_applies_signed_diff() {
        let state = LedgerState::open_in_memory().unwrap();
        let p = seed_product(&state, "CRN-001", 150.0);

        record_stock_adjustment(&state, p.id, -10.0, "damage in transport", &op()).unwrap();
        assert_eq!(get_product(&state, p.id).unwrap().quantity, 140.0);

        record_stock_adjustment(&state, p.id, 4.0, "annual count surplus", &op()).unwrap();
        assert_eq!(get_product(&state, p.id).unwrap().quantity, 144.0);
    }

    #[test]
    fn test_adjustment_may_go_negative_even_in_strict_mode() {
        let state = LedgerState::open_in_memory().unwrap();
        {
            let conn = state.lock().unwrap();
            let mut s = crate::db::load_settings(&conn).unwrap();
            s.prevent_negative_stock = true;
            crate::db::save_settings(&conn, &s).unwrap();
        }
        let p = seed_product(&state, "GLU-001", 5.0);
        record_stock_adjustment(&state, p.id, -8.0, "write-off", &op()).unwrap();
        assert_eq!(get_product(&state, p.id).unwrap().quantity, -3.0);
    }

    #[test]
    fn test_adjustment_logs_transaction_with_signed_line() {
        let state = LedgerState::open_in_memory().unwrap();
        let p = seed_product(&state, "WPN-012", 300.0);
        let tx = record_stock_adjustment(&state, p.id, -12.0, "shrinkage", &op()).unwrap();
        assert_eq!(tx.kind, TransactionKind::Adjustment);
        assert!(tx.id.starts_with("ADJ-"));
        assert_eq!(tx.amount, 12.0 * 45.0);
        let line = &tx.items.as_ref().unwrap()[0];
        assert_eq!(line.quantity, -12.0);
        assert_eq!(line.product_id, p.id);
    }

    #[test]
    fn test_zero_diff_rejected() {
        let state = LedgerState::open_in_memory().unwrap();
        let p = seed_product(&state, "LGT-005", 20.0);
        let err = record_stock_adjustment(&state, p.id, 0.0, "noop", &op()).unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[test]
    fn test_low_stock_query() {
        let state = LedgerState::open_in_memory().unwrap();
        seed_product(&state, "OK-1", 100.0);
        let low = seed_product(&state, "LOW-1", 3.0);
        let listed = low_stock_products(&state).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, low.id);
    }
}
