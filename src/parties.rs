//! Customer and supplier ledgers.
//!
//! Balances here are cached aggregate columns; the transaction log is ground
//! truth. `snapshot::verify_ledger` asserts the two agree.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::db::LedgerState;
use crate::error::LedgerError;
use crate::models::{Customer, CustomerType, Operator, Supplier};

// ---------------------------------------------------------------------------
// Customers
// ---------------------------------------------------------------------------

/// Input for a new customer. The opening balance becomes the fixed replay
/// starting point; the live balance starts equal to it.
#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub name: String,
    pub phone: String,
    pub customer_type: CustomerType,
    pub opening_balance: f64,
    pub credit_limit: f64,
}

pub fn add_customer(
    state: &LedgerState,
    input: &NewCustomer,
    operator: &Operator,
) -> Result<Customer, LedgerError> {
    if input.name.trim().is_empty() {
        return Err(LedgerError::InvalidInput("customer name is empty".into()));
    }
    let conn = state.lock()?;
    conn.execute(
        "INSERT INTO customers (name, phone, customer_type, balance, opening_balance, credit_limit)
         VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
        params![
            input.name,
            input.phone,
            input.customer_type,
            input.opening_balance,
            input.credit_limit
        ],
    )?;
    let id = conn.last_insert_rowid();
    crate::audit::log_activity(&conn, operator, "customer.add", &input.name)?;
    info!(customer_id = id, name = %input.name, "Customer added");
    get_customer_tx(&conn, id)
}

pub fn get_customer(state: &LedgerState, id: i64) -> Result<Customer, LedgerError> {
    let conn = state.lock()?;
    get_customer_tx(&conn, id)
}

pub(crate) fn get_customer_tx(conn: &Connection, id: i64) -> Result<Customer, LedgerError> {
    conn.query_row(
        "SELECT id, name, phone, customer_type, balance, opening_balance, credit_limit
         FROM customers WHERE id = ?1",
        params![id],
        map_customer,
    )
    .optional()?
    .ok_or_else(|| LedgerError::NotFound("customer", id.to_string()))
}

pub fn list_customers(state: &LedgerState) -> Result<Vec<Customer>, LedgerError> {
    let conn = state.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, name, phone, customer_type, balance, opening_balance, credit_limit
         FROM customers ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([], map_customer)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

fn map_customer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        customer_type: row.get(3)?,
        balance: row.get(4)?,
        opening_balance: row.get(5)?,
        credit_limit: row.get(6)?,
    })
}

/// Total money customers owe the business (sum of debt magnitudes).
pub fn total_receivables(state: &LedgerState) -> Result<f64, LedgerError> {
    let conn = state.lock()?;
    let total: f64 = conn.query_row(
        "SELECT COALESCE(SUM(-balance), 0) FROM customers WHERE balance < 0",
        [],
        |row| row.get(0),
    )?;
    Ok(total)
}

// ---------------------------------------------------------------------------
// Suppliers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewSupplier {
    pub name: String,
    pub phone: String,
    pub opening_balance: f64,
}

pub fn add_supplier(
    state: &LedgerState,
    input: &NewSupplier,
    operator: &Operator,
) -> Result<Supplier, LedgerError> {
    if input.name.trim().is_empty() {
        return Err(LedgerError::InvalidInput("supplier name is empty".into()));
    }
    let conn = state.lock()?;
    conn.execute(
        "INSERT INTO suppliers (name, phone, balance, opening_balance)
         VALUES (?1, ?2, ?3, ?3)",
        params![input.name, input.phone, input.opening_balance],
    )?;
    let id = conn.last_insert_rowid();
    crate::audit::log_activity(&conn, operator, "supplier.add", &input.name)?;
    info!(supplier_id = id, name = %input.name, "Supplier added");
    get_supplier_tx(&conn, id)
}

pub fn get_supplier(state: &LedgerState, id: i64) -> Result<Supplier, LedgerError> {
    let conn = state.lock()?;
    get_supplier_tx(&conn, id)
}

pub(crate) fn get_supplier_tx(conn: &Connection, id: i64) -> Result<Supplier, LedgerError> {
    conn.query_row(
        "SELECT id, name, phone, balance, opening_balance FROM suppliers WHERE id = ?1",
        params![id],
        map_supplier,
    )
    .optional()?
    .ok_or_else(|| LedgerError::NotFound("supplier", id.to_string()))
}

pub fn list_suppliers(state: &LedgerState) -> Result<Vec<Supplier>, LedgerError> {
    let conn = state.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, name, phone, balance, opening_balance FROM suppliers ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([], map_supplier)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

fn map_supplier(row: &rusqlite::Row<'_>) -> rusqlite::Result<Supplier> {
    Ok(Supplier {
        id: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        balance: row.get(3)?,
        opening_balance: row.get(4)?,
    })
}

/// Total money the business owes suppliers.
pub fn total_payables(state: &LedgerState) -> Result<f64, LedgerError> {
    let conn = state.lock()?;
    let total: f64 = conn.query_row(
        "SELECT COALESCE(SUM(balance), 0) FROM suppliers WHERE balance > 0",
        [],
        |row| row.get(0),
    )?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LedgerState;

    fn op() -> Operator {
        Operator::new(1, "admin")
    }

    #[test]
    fn test_add_and_get_customer() {
        let state = LedgerState::open_in_memory().unwrap();
        let c = add_customer(
            &state,
            &NewCustomer {
                name: "Decor Office".into(),
                phone: "01012345678".into(),
                customer_type: CustomerType::Business,
                opening_balance: -5000.0,
                credit_limit: 10000.0,
            },
            &op(),
        )
        .unwrap();
        assert_eq!(c.balance, -5000.0);
        assert_eq!(c.debt(), 5000.0);
        let fetched = get_customer(&state, c.id).unwrap();
        assert_eq!(fetched.name, "Decor Office");
        assert_eq!(fetched.customer_type, CustomerType::Business);
    }

    #[test]
    fn test_missing_customer_is_not_found() {
        let state = LedgerState::open_in_memory().unwrap();
        let err = get_customer(&state, 42).unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn test_receivables_and_payables_roll_ups() {
        let state = LedgerState::open_in_memory().unwrap();
        add_customer(
            &state,
            &NewCustomer {
                name: "a".into(),
                phone: String::new(),
                customer_type: CustomerType::Business,
                opening_balance: -3000.0,
                credit_limit: 0.0,
            },
            &op(),
        )
        .unwrap();
        add_customer(
            &state,
            &NewCustomer {
                name: "b".into(),
                phone: String::new(),
                customer_type: CustomerType::Consumer,
                opening_balance: 200.0, // credit, not debt
                credit_limit: 0.0,
            },
            &op(),
        )
        .unwrap();
        add_supplier(
            &state,
            &NewSupplier {
                name: "factory".into(),
                phone: String::new(),
                opening_balance: 12000.0,
            },
            &op(),
        )
        .unwrap();

        assert_eq!(total_receivables(&state).unwrap(), 3000.0);
        assert_eq!(total_payables(&state).unwrap(), 12000.0);
    }
}
