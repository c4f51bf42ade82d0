//! Sale completion: the cart checkout path.
//!
//! One call validates the cart, prices it, moves stock, posts customer debt
//! for deferred invoices, folds the open shift's totals and appends the sale
//! transaction, all inside one write transaction.

use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::info;

use crate::db::{self, LedgerState};
use crate::error::LedgerError;
use crate::models::{
    cart_totals, CartLine, CustomerType, Operator, PartyKind, PaymentMethod, Transaction,
    TransactionKind, TransactionStatus,
};

/// Everything the caller decides about a sale. The engine assigns the
/// invoice id; any caller-supplied numbering is ignored.
#[derive(Debug, Clone)]
pub struct SaleIntent {
    pub customer_id: i64,
    pub items: Vec<CartLine>,
    pub payment_method: PaymentMethod,
    pub due_date: Option<String>,
    /// Direct sales are invoiced without touching stock (services, special
    /// orders shipped straight from the supplier).
    pub is_direct_sale: bool,
    /// Operator confirmed selling lines below cost.
    pub below_cost_ack: bool,
    /// Operator confirmed exceeding the customer's credit limit.
    pub credit_limit_ack: bool,
}

/// Complete a sale.
pub fn complete_sale(
    state: &LedgerState,
    intent: &SaleIntent,
    operator: &Operator,
) -> Result<Transaction, LedgerError> {
    let conn = state.lock()?;

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = execute_sale(&conn, intent, operator);

    match result {
        Ok(tx) => {
            conn.execute_batch("COMMIT")?;
            info!(
                invoice = %tx.id,
                amount = tx.amount,
                method = tx.payment_method.as_str(),
                "Sale completed"
            );
            Ok(tx)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Validate and write a sale inside the caller's open write transaction.
/// Quotation conversion reuses this so a conversion is one atomic unit.
pub(crate) fn execute_sale(
    conn: &Connection,
    intent: &SaleIntent,
    operator: &Operator,
) -> Result<Transaction, LedgerError> {
    if intent.items.is_empty() {
        return Err(LedgerError::EmptyCart);
    }

    let settings = db::load_settings(conn)?;
    let customer = crate::parties::get_customer_tx(conn, intent.customer_id)?;
    let totals = cart_totals(&intent.items, settings.tax_rate);

    // Below-cost lines need an explicit operator confirmation.
    let below_cost: Vec<String> = intent
        .items
        .iter()
        .filter(|l| l.final_price() < l.cost_price)
        .map(|l| l.name.clone())
        .collect();
    if !below_cost.is_empty() && !intent.below_cost_ack {
        return Err(LedgerError::BelowCostUnconfirmed(below_cost));
    }

    if intent.payment_method.is_deferred() {
        if customer.customer_type == CustomerType::Consumer {
            return Err(LedgerError::ConsumerCannotDefer);
        }
        if intent.due_date.is_none() {
            return Err(LedgerError::MissingDueDate);
        }
        let projected_debt = customer.debt() + totals.total;
        if customer.credit_limit > 0.0 && projected_debt > customer.credit_limit {
            if !intent.credit_limit_ack {
                return Err(LedgerError::CreditLimitExceeded {
                    projected_debt,
                    credit_limit: customer.credit_limit,
                });
            }
            tracing::warn!(
                customer_id = customer.id,
                projected_debt,
                credit_limit = customer.credit_limit,
                "Credit limit exceeded with operator override"
            );
        }
    }

    let now = Utc::now().to_rfc3339();

    // Stock: verify before touching anything. The check sums requested
    // quantity per product first; a cart may carry several lines for the
    // same product. Direct sales never move stock.
    if !intent.is_direct_sale && settings.prevent_negative_stock {
        let mut requested: BTreeMap<i64, f64> = BTreeMap::new();
        for line in &intent.items {
            *requested.entry(line.product_id).or_insert(0.0) += line.quantity;
        }
        let mut short = Vec::new();
        for (product_id, quantity) in &requested {
            let product = crate::inventory::get_product_tx(conn, *product_id)?;
            if product.quantity < *quantity {
                short.push(format!(
                    "{} (have {}, need {})",
                    product.name, product.quantity, quantity
                ));
            }
        }
        if !short.is_empty() {
            return Err(LedgerError::InsufficientStock(short));
        }
    }

    // Every sale is recorded against the open shift.
    let shift = crate::shifts::active_shift_tx(conn)?.ok_or(LedgerError::NoOpenShift)?;

    if !intent.is_direct_sale {
        for line in &intent.items {
            let changed = conn.execute(
                "UPDATE products SET quantity = quantity - ?1, updated_at = ?2 WHERE id = ?3",
                params![line.quantity, now, line.product_id],
            )?;
            if changed == 0 {
                return Err(LedgerError::NotFound("product", line.product_id.to_string()));
            }
        }
    }

    if intent.payment_method.is_deferred() {
        conn.execute(
            "UPDATE customers SET balance = balance - ?1, updated_at = ?2 WHERE id = ?3",
            params![totals.total, now, customer.id],
        )?;
    }

    crate::shifts::record_sale_for_shift(conn, shift.id, totals.total, intent.payment_method)?;
    let shift_id = Some(shift.id);

    let id = db::take_invoice_number(conn)?;
    let tx = Transaction {
        id,
        kind: TransactionKind::Sale,
        date: now,
        amount: totals.total,
        payment_method: intent.payment_method,
        description: format!("sale to {}", customer.name),
        category: None,
        related_party: Some(PartyKind::Customer),
        related_id: Some(customer.id),
        items: Some(intent.items.clone()),
        status: TransactionStatus::Completed,
        due_date: intent.due_date.clone(),
        is_direct_sale: intent.is_direct_sale,
        shift_id,
        reverses: None,
    };
    db::insert_transaction(conn, &tx)?;
    crate::audit::log_activity(
        conn,
        operator,
        "sale.complete",
        &format!("invoice {} for {} ({})", tx.id, customer.name, totals.total),
    )?;
    Ok(tx)
}
