//! Quotations: priced offers that may later become sales.
//!
//! A quotation freezes prices at creation time. Conversion replays the
//! frozen lines through the normal sale path and flips the quotation to
//! `converted` in the same write transaction, so a quotation can become at
//! most one invoice.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::db::{self, LedgerState};
use crate::error::LedgerError;
use crate::models::{
    cart_totals, CartLine, Operator, PaymentMethod, Quotation, QuotationStatus, Transaction,
};
use crate::sales::SaleIntent;

/// How a quotation should be invoiced at conversion time. Payment terms are
/// decided here, not at quotation time; prices are not.
#[derive(Debug, Clone)]
pub struct ConversionTerms {
    pub payment_method: PaymentMethod,
    pub due_date: Option<String>,
    pub below_cost_ack: bool,
    pub credit_limit_ack: bool,
}

fn map_quotation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Quotation> {
    let items_json: String = row.get(4)?;
    let items: Vec<CartLine> = serde_json::from_str(&items_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Quotation {
        id: row.get(0)?,
        date: row.get(1)?,
        customer_id: row.get(2)?,
        customer_name: row.get(3)?,
        items,
        total_amount: row.get(5)?,
        status: row.get(6)?,
    })
}

const QUO_COLUMNS: &str = "id, date, customer_id, customer_name, items, total_amount, status";

pub fn get_quotation(state: &LedgerState, id: &str) -> Result<Quotation, LedgerError> {
    let conn = state.lock()?;
    get_quotation_tx(&conn, id)
}

fn get_quotation_tx(conn: &Connection, id: &str) -> Result<Quotation, LedgerError> {
    conn.query_row(
        &format!("SELECT {QUO_COLUMNS} FROM quotations WHERE id = ?1"),
        params![id],
        map_quotation,
    )
    .optional()?
    .ok_or_else(|| LedgerError::NotFound("quotation", id.to_string()))
}

pub fn list_quotations(state: &LedgerState) -> Result<Vec<Quotation>, LedgerError> {
    let conn = state.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {QUO_COLUMNS} FROM quotations ORDER BY rowid ASC"
    ))?;
    let rows = stmt.query_map([], map_quotation)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

/// Create a quotation for a customer, freezing today's prices and totals.
pub fn create_quotation(
    state: &LedgerState,
    customer_id: i64,
    items: &[CartLine],
    operator: &Operator,
) -> Result<Quotation, LedgerError> {
    if items.is_empty() {
        return Err(LedgerError::EmptyCart);
    }
    let conn = state.lock()?;
    let customer = crate::parties::get_customer_tx(&conn, customer_id)?;
    let settings = db::load_settings(&conn)?;
    let totals = cart_totals(items, settings.tax_rate);
    let items_json = serde_json::to_string(items)
        .map_err(|e| LedgerError::InvalidInput(format!("serialize quotation items: {e}")))?;
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<Quotation, LedgerError> {
        // Quotations are not transactions but share the reference sequence.
        let id = {
            let mut settings = db::load_settings(&conn)?;
            let n = settings.next_reference_number;
            settings.next_reference_number = n + 1;
            db::save_settings(&conn, &settings)?;
            format!("QUO-{n}")
        };
        conn.execute(
            "INSERT INTO quotations (id, date, customer_id, customer_name, items,
                                     total_amount, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
            params![id, now, customer.id, customer.name, items_json, totals.total],
        )?;
        crate::audit::log_activity(
            &conn,
            operator,
            "quotation.create",
            &format!("{id} for {} ({})", customer.name, totals.total),
        )?;
        get_quotation_tx(&conn, &id)
    })();

    match result {
        Ok(q) => {
            conn.execute_batch("COMMIT")?;
            info!(quotation = %q.id, total = q.total_amount, "Quotation created");
            Ok(q)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Convert a pending quotation into a sale at its frozen prices.
pub fn convert_quotation(
    state: &LedgerState,
    id: &str,
    terms: &ConversionTerms,
    operator: &Operator,
) -> Result<Transaction, LedgerError> {
    let conn = state.lock()?;
    let quotation = get_quotation_tx(&conn, id)?;
    if quotation.status != QuotationStatus::Pending {
        return Err(LedgerError::InvalidInput(format!(
            "quotation {id} is already {}",
            quotation.status.as_str()
        )));
    }

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<Transaction, LedgerError> {
        let intent = SaleIntent {
            customer_id: quotation.customer_id,
            items: quotation.items.clone(),
            payment_method: terms.payment_method,
            due_date: terms.due_date.clone(),
            is_direct_sale: false,
            below_cost_ack: terms.below_cost_ack,
            credit_limit_ack: terms.credit_limit_ack,
        };
        let tx = crate::sales::execute_sale(&conn, &intent, operator)?;
        conn.execute(
            "UPDATE quotations SET status = 'converted' WHERE id = ?1",
            params![id],
        )?;
        crate::audit::log_activity(
            &conn,
            operator,
            "quotation.convert",
            &format!("{id} became invoice {}", tx.id),
        )?;
        Ok(tx)
    })();

    match result {
        Ok(tx) => {
            conn.execute_batch("COMMIT")?;
            info!(quotation = id, invoice = %tx.id, "Quotation converted");
            Ok(tx)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}
