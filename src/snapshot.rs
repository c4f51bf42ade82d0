//! Snapshot backup, restore and ledger verification.
//!
//! A snapshot is one JSON document holding every collection plus settings.
//! Restore replaces the entire database contents atomically and refuses
//! documents whose cached aggregates disagree with a replay of their own
//! transaction log.

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::db::{self, LedgerState};
use crate::error::LedgerError;
use crate::models::{
    ActivityLogEntry, Customer, PartyKind, Product, Quotation, Shift, StoreSettings, Supplier,
    Transaction, TransactionKind, TransactionStatus, User,
};

pub const SNAPSHOT_VERSION: u32 = 1;

const BALANCE_TOLERANCE: f64 = 0.001;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDocument {
    pub version: u32,
    /// Unique id of this export, for naming backup files and de-duplication.
    pub snapshot_id: uuid::Uuid,
    pub exported_at: String,
    pub settings: StoreSettings,
    pub products: Vec<Product>,
    pub customers: Vec<Customer>,
    pub suppliers: Vec<Supplier>,
    pub transactions: Vec<Transaction>,
    pub shifts: Vec<Shift>,
    pub quotations: Vec<Quotation>,
    pub users: Vec<User>,
    pub activity_log: Vec<ActivityLogEntry>,
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

pub fn export_snapshot(state: &LedgerState) -> Result<SnapshotDocument, LedgerError> {
    let conn = state.lock()?;

    let settings = db::load_settings(&conn)?;
    let transactions = db::list_transactions(&conn)?;

    let mut stmt = conn.prepare(
        "SELECT id, sku, name, category, quantity, opening_quantity,
                cost_price, sell_price, unit, min_stock_alert
         FROM products ORDER BY id ASC",
    )?;
    let products = stmt
        .query_map([], |row| {
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
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, name, phone, customer_type, balance, opening_balance, credit_limit
         FROM customers ORDER BY id ASC",
    )?;
    let customers = stmt
        .query_map([], |row| {
            Ok(Customer {
                id: row.get(0)?,
                name: row.get(1)?,
                phone: row.get(2)?,
                customer_type: row.get(3)?,
                balance: row.get(4)?,
                opening_balance: row.get(5)?,
                credit_limit: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, name, phone, balance, opening_balance FROM suppliers ORDER BY id ASC",
    )?;
    let suppliers = stmt
        .query_map([], |row| {
            Ok(Supplier {
                id: row.get(0)?,
                name: row.get(1)?,
                phone: row.get(2)?,
                balance: row.get(3)?,
                opening_balance: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, user_id, user_name, start_time, end_time, start_cash, end_cash,
                expected_cash, total_sales, sales_by_method, status
         FROM shifts ORDER BY id ASC",
    )?;
    let shifts = stmt
        .query_map([], |row| {
            let by_method: String = row.get(9)?;
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
                sales_by_method: serde_json::from_str(&by_method).unwrap_or_default(),
                status: row.get(10)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, date, customer_id, customer_name, items, total_amount, status
         FROM quotations ORDER BY rowid ASC",
    )?;
    let quotations = stmt
        .query_map([], |row| {
            let items: String = row.get(4)?;
            Ok(Quotation {
                id: row.get(0)?,
                date: row.get(1)?,
                customer_id: row.get(2)?,
                customer_name: row.get(3)?,
                items: serde_json::from_str(&items).unwrap_or_default(),
                total_amount: row.get(5)?,
                status: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare("SELECT id, username, role, name FROM users ORDER BY id ASC")?;
    let users = stmt
        .query_map([], |row| {
            Ok(User {
                id: row.get(0)?,
                username: row.get(1)?,
                role: row.get(2)?,
                name: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT id, date, user_id, user_name, action, details
         FROM activity_log ORDER BY id ASC",
    )?;
    let activity_log = stmt
        .query_map([], |row| {
            Ok(ActivityLogEntry {
                id: row.get(0)?,
                date: row.get(1)?,
                user_id: row.get(2)?,
                user_name: row.get(3)?,
                action: row.get(4)?,
                details: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    info!(
        transactions = transactions.len(),
        products = products.len(),
        "Snapshot exported"
    );

    Ok(SnapshotDocument {
        version: SNAPSHOT_VERSION,
        snapshot_id: uuid::Uuid::new_v4(),
        exported_at: Utc::now().to_rfc3339(),
        settings,
        products,
        customers,
        suppliers,
        transactions,
        shifts,
        quotations,
        users,
        activity_log,
    })
}

// ---------------------------------------------------------------------------
// Replay verification
// ---------------------------------------------------------------------------

/// Recompute every cached aggregate from opening values plus the transaction
/// log and report where the cache disagrees. An empty report means the
/// ledger is internally consistent.
pub fn verify_ledger(state: &LedgerState) -> Result<Vec<String>, LedgerError> {
    let conn = state.lock()?;
    replay_discrepancies(&conn)
}

fn replay_discrepancies(conn: &Connection) -> Result<Vec<String>, LedgerError> {
    use std::collections::HashMap;

    let transactions = db::list_transactions(conn)?;

    let mut stmt =
        conn.prepare("SELECT id, name, opening_quantity, quantity FROM products")?;
    let mut stock: HashMap<i64, (String, f64, f64)> = HashMap::new();
    for row in stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
        ))
    })? {
        let (id, name, opening, cached) = row?;
        stock.insert(id, (name, opening, cached));
    }

    let mut stmt =
        conn.prepare("SELECT id, name, opening_balance, balance FROM customers")?;
    let mut customer_balances: HashMap<i64, (String, f64, f64)> = HashMap::new();
    for row in stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
        ))
    })? {
        let (id, name, opening, cached) = row?;
        customer_balances.insert(id, (name, opening, cached));
    }

    let mut stmt =
        conn.prepare("SELECT id, name, opening_balance, balance FROM suppliers")?;
    let mut supplier_balances: HashMap<i64, (String, f64, f64)> = HashMap::new();
    for row in stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
        ))
    })? {
        let (id, name, opening, cached) = row?;
        supplier_balances.insert(id, (name, opening, cached));
    }

    // Replayed values start at the opening figures.
    let mut replayed_stock: HashMap<i64, f64> =
        stock.iter().map(|(id, (_, o, _))| (*id, *o)).collect();
    let mut replayed_customers: HashMap<i64, f64> = customer_balances
        .iter()
        .map(|(id, (_, o, _))| (*id, *o))
        .collect();
    let mut replayed_suppliers: HashMap<i64, f64> = supplier_balances
        .iter()
        .map(|(id, (_, o, _))| (*id, *o))
        .collect();

    for tx in &transactions {
        if tx.status != TransactionStatus::Completed {
            continue;
        }

        // Stock effect.
        if !tx.is_direct_sale {
            if let Some(items) = &tx.items {
                let sign = match (tx.kind, tx.related_party) {
                    (TransactionKind::Sale, _) => Some(-1.0),
                    (TransactionKind::Purchase, _) => Some(1.0),
                    (TransactionKind::Return, Some(PartyKind::Customer)) => Some(1.0),
                    (TransactionKind::Return, Some(PartyKind::Supplier)) => Some(-1.0),
                    (TransactionKind::Adjustment, _) => Some(1.0),
                    _ => None,
                };
                if let Some(sign) = sign {
                    for line in items {
                        if let Some(q) = replayed_stock.get_mut(&line.product_id) {
                            *q += sign * line.quantity;
                        }
                    }
                }
            }
        }

        // Party balance effect (deferred invoices and settlements).
        match (tx.kind, tx.related_party, tx.related_id) {
            (TransactionKind::Sale, Some(PartyKind::Customer), Some(cid))
                if tx.payment_method.is_deferred() =>
            {
                if let Some(b) = replayed_customers.get_mut(&cid) {
                    *b -= tx.amount;
                }
            }
            (TransactionKind::Return, Some(PartyKind::Customer), Some(cid))
                if tx.payment_method.is_deferred() =>
            {
                if let Some(b) = replayed_customers.get_mut(&cid) {
                    *b += tx.amount;
                }
            }
            (TransactionKind::Settlement, Some(PartyKind::Customer), Some(cid)) => {
                if let Some(b) = replayed_customers.get_mut(&cid) {
                    *b += tx.amount;
                }
            }
            (TransactionKind::Purchase, Some(PartyKind::Supplier), Some(sid))
                if tx.payment_method.is_deferred() =>
            {
                if let Some(b) = replayed_suppliers.get_mut(&sid) {
                    *b += tx.amount;
                }
            }
            (TransactionKind::Return, Some(PartyKind::Supplier), Some(sid))
                if tx.payment_method.is_deferred() =>
            {
                if let Some(b) = replayed_suppliers.get_mut(&sid) {
                    *b -= tx.amount;
                }
            }
            (TransactionKind::Settlement, Some(PartyKind::Supplier), Some(sid)) => {
                if let Some(b) = replayed_suppliers.get_mut(&sid) {
                    *b -= tx.amount;
                }
            }
            _ => {}
        }
    }

    let mut discrepancies = Vec::new();
    for (id, (name, _, cached)) in &stock {
        let replayed = replayed_stock[id];
        if (replayed - cached).abs() > BALANCE_TOLERANCE {
            discrepancies.push(format!(
                "product {name}: cached quantity {cached}, replay gives {replayed}"
            ));
        }
    }
    for (id, (name, _, cached)) in &customer_balances {
        let replayed = replayed_customers[id];
        if (replayed - cached).abs() > BALANCE_TOLERANCE {
            discrepancies.push(format!(
                "customer {name}: cached balance {cached}, replay gives {replayed}"
            ));
        }
    }
    for (id, (name, _, cached)) in &supplier_balances {
        let replayed = replayed_suppliers[id];
        if (replayed - cached).abs() > BALANCE_TOLERANCE {
            discrepancies.push(format!(
                "supplier {name}: cached balance {cached}, replay gives {replayed}"
            ));
        }
    }

    if !discrepancies.is_empty() {
        warn!(count = discrepancies.len(), "Ledger replay found discrepancies");
    }
    Ok(discrepancies)
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

/// Replace the entire database contents with a snapshot, atomically.
///
/// The document is replay-verified after loading; an inconsistent snapshot
/// rolls everything back and leaves the current data untouched.
pub fn import_snapshot(state: &LedgerState, doc: &SnapshotDocument) -> Result<(), LedgerError> {
    if doc.version != SNAPSHOT_VERSION {
        return Err(LedgerError::InvalidInput(format!(
            "unsupported snapshot version {}",
            doc.version
        )));
    }
    let conn = state.lock()?;

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> Result<(), LedgerError> {
        conn.execute_batch(
            "DELETE FROM transactions;
             DELETE FROM products;
             DELETE FROM customers;
             DELETE FROM suppliers;
             DELETE FROM shifts;
             DELETE FROM quotations;
             DELETE FROM users;
             DELETE FROM activity_log;
             DELETE FROM settings;",
        )?;

        db::save_settings(&conn, &doc.settings)?;

        for p in &doc.products {
            conn.execute(
                "INSERT INTO products (id, sku, name, category, quantity, opening_quantity,
                                       cost_price, sell_price, unit, min_stock_alert)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    p.id,
                    p.sku,
                    p.name,
                    p.category,
                    p.quantity,
                    p.opening_quantity,
                    p.cost_price,
                    p.sell_price,
                    p.unit,
                    p.min_stock_alert
                ],
            )?;
        }
        for c in &doc.customers {
            conn.execute(
                "INSERT INTO customers (id, name, phone, customer_type, balance,
                                        opening_balance, credit_limit)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    c.id,
                    c.name,
                    c.phone,
                    c.customer_type,
                    c.balance,
                    c.opening_balance,
                    c.credit_limit
                ],
            )?;
        }
        for s in &doc.suppliers {
            conn.execute(
                "INSERT INTO suppliers (id, name, phone, balance, opening_balance)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![s.id, s.name, s.phone, s.balance, s.opening_balance],
            )?;
        }
        for sh in &doc.shifts {
            let by_method = serde_json::to_string(&sh.sales_by_method)
                .map_err(|e| LedgerError::InvalidInput(format!("serialize shift: {e}")))?;
            conn.execute(
                "INSERT INTO shifts (id, user_id, user_name, start_time, end_time,
                                     start_cash, end_cash, expected_cash, total_sales,
                                     sales_by_method, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    sh.id,
                    sh.user_id,
                    sh.user_name,
                    sh.start_time,
                    sh.end_time,
                    sh.start_cash,
                    sh.end_cash,
                    sh.expected_cash,
                    sh.total_sales,
                    by_method,
                    sh.status
                ],
            )?;
        }
        for tx in &doc.transactions {
            db::insert_transaction(&conn, tx)?;
        }
        for q in &doc.quotations {
            let items = serde_json::to_string(&q.items)
                .map_err(|e| LedgerError::InvalidInput(format!("serialize quotation: {e}")))?;
            conn.execute(
                "INSERT INTO quotations (id, date, customer_id, customer_name, items,
                                         total_amount, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    q.id,
                    q.date,
                    q.customer_id,
                    q.customer_name,
                    items,
                    q.total_amount,
                    q.status
                ],
            )?;
        }
        for u in &doc.users {
            conn.execute(
                "INSERT INTO users (id, username, role, name) VALUES (?1, ?2, ?3, ?4)",
                params![u.id, u.username, u.role, u.name],
            )?;
        }
        for entry in &doc.activity_log {
            conn.execute(
                "INSERT INTO activity_log (id, date, user_id, user_name, action, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.id,
                    entry.date,
                    entry.user_id,
                    entry.user_name,
                    entry.action,
                    entry.details
                ],
            )?;
        }

        let discrepancies = replay_discrepancies(&conn)?;
        if !discrepancies.is_empty() {
            return Err(LedgerError::DataIntegrity(discrepancies.join("; ")));
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")?;
            info!(
                transactions = doc.transactions.len(),
                "Snapshot imported"
            );
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}
