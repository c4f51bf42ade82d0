//! SQLite storage layer for the ledger.
//!
//! Uses rusqlite with WAL mode and versioned migrations. All canonical
//! collections live here; operation modules lock the single connection and
//! wrap their writes in `BEGIN IMMEDIATE` so every operation is
//! all-or-nothing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::error::LedgerError;
use crate::models::{StoreSettings, Transaction, TransactionKind, TX_COLUMNS};

/// Shared ledger state: one connection, one writer at a time.
pub struct LedgerState {
    pub(crate) conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

const SETTINGS_KEY: &str = "store";

impl LedgerState {
    /// Open (or create) the ledger database at `path` and run migrations.
    pub fn init(path: &Path) -> Result<LedgerState, LedgerError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| LedgerError::InvalidInput(format!("create data dir: {e}")))?;
        }
        info!("Opening ledger database at {}", path.display());
        let conn = open_and_configure(path)?;
        run_migrations(&conn)?;
        info!("Ledger database ready (schema v{CURRENT_SCHEMA_VERSION})");
        Ok(LedgerState {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    /// In-memory ledger, used by tests and by callers that manage their own
    /// snapshot persistence.
    pub fn open_in_memory() -> Result<LedgerState, LedgerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        run_migrations(&conn)?;
        Ok(LedgerState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Lock the connection, mapping a poisoned mutex to a typed error.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::StatePoisoned)
    }
}

fn open_and_configure(path: &Path) -> Result<Connection, LedgerError> {
    let conn = match Connection::open(path) {
        Ok(c) => c,
        Err(first_err) => {
            // Corrupt file: delete and retry once.
            warn!("Database open failed ({first_err}), deleting and retrying once");
            if path.exists() {
                let _ = fs::remove_file(path);
                let _ = fs::remove_file(path.with_extension("db-wal"));
                let _ = fs::remove_file(path.with_extension("db-shm"));
            }
            Connection::open(path)?
        }
    };

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

fn run_migrations(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!("Migrating ledger schema from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: core collections.
fn migrate_v1(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        "
        -- settings (key/value store, values are JSON)
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS products (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sku TEXT UNIQUE NOT NULL,
            name TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT '',
            quantity REAL NOT NULL DEFAULT 0,
            opening_quantity REAL NOT NULL DEFAULT 0,
            cost_price REAL NOT NULL DEFAULT 0,
            sell_price REAL NOT NULL DEFAULT 0,
            unit TEXT NOT NULL DEFAULT 'piece',
            min_stock_alert REAL NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS customers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            phone TEXT NOT NULL DEFAULT '',
            customer_type TEXT NOT NULL DEFAULT 'consumer',
            balance REAL NOT NULL DEFAULT 0,
            opening_balance REAL NOT NULL DEFAULT 0,
            credit_limit REAL NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS suppliers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            phone TEXT NOT NULL DEFAULT '',
            balance REAL NOT NULL DEFAULT 0,
            opening_balance REAL NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- transactions (append-only; completed rows are never edited)
        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            date TEXT NOT NULL,
            amount REAL NOT NULL,
            payment_method TEXT NOT NULL DEFAULT 'cash',
            description TEXT NOT NULL DEFAULT '',
            category TEXT,
            related_party TEXT,
            related_id INTEGER,
            items TEXT,
            status TEXT NOT NULL DEFAULT 'completed',
            due_date TEXT,
            is_direct_sale INTEGER NOT NULL DEFAULT 0,
            shift_id INTEGER,
            created_at TEXT DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_transactions_kind ON transactions(kind);
        CREATE INDEX IF NOT EXISTS idx_transactions_shift ON transactions(shift_id);
        CREATE INDEX IF NOT EXISTS idx_transactions_related
            ON transactions(related_party, related_id);

        CREATE TABLE IF NOT EXISTS shifts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            user_name TEXT NOT NULL DEFAULT '',
            start_time TEXT NOT NULL,
            end_time TEXT,
            start_cash REAL NOT NULL DEFAULT 0,
            end_cash REAL,
            expected_cash REAL,
            total_sales REAL NOT NULL DEFAULT 0,
            sales_by_method TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'open',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- activity_log (append-only)
        CREATE TABLE IF NOT EXISTS activity_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            user_id INTEGER NOT NULL,
            user_name TEXT NOT NULL DEFAULT '',
            action TEXT NOT NULL,
            details TEXT NOT NULL DEFAULT ''
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    Ok(())
}

/// Migration v2: quotations and users.
fn migrate_v2(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS quotations (
            id TEXT PRIMARY KEY,
            date TEXT NOT NULL,
            customer_id INTEGER NOT NULL,
            customer_name TEXT NOT NULL DEFAULT '',
            items TEXT NOT NULL DEFAULT '[]',
            total_amount REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT UNIQUE NOT NULL,
            role TEXT NOT NULL DEFAULT 'cashier',
            name TEXT NOT NULL DEFAULT ''
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )?;
    Ok(())
}

/// Migration v3: reversal tracking and the single-open-shift guarantee.
fn migrate_v3(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        "
        ALTER TABLE transactions ADD COLUMN reverses TEXT;
        CREATE INDEX IF NOT EXISTS idx_transactions_reverses ON transactions(reverses);

        -- At most one row may have status = 'open'.
        CREATE UNIQUE INDEX IF NOT EXISTS ux_shifts_single_open
            ON shifts(status) WHERE status = 'open';

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Load the store settings, falling back to defaults when unset.
pub fn load_settings(conn: &Connection) -> Result<StoreSettings, LedgerError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![SETTINGS_KEY],
            |row| row.get(0),
        )
        .ok();
    match raw {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| LedgerError::InvalidInput(format!("corrupt settings: {e}"))),
        None => Ok(StoreSettings::default()),
    }
}

/// Persist the store settings.
pub fn save_settings(conn: &Connection, settings: &StoreSettings) -> Result<(), LedgerError> {
    let raw = serde_json::to_string(settings)
        .map_err(|e| LedgerError::InvalidInput(format!("serialize settings: {e}")))?;
    conn.execute(
        "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![SETTINGS_KEY, raw],
    )?;
    Ok(())
}

/// Take the next business-visible invoice number and bump the counter.
/// Must be called inside the caller's write transaction.
pub(crate) fn take_invoice_number(conn: &Connection) -> Result<String, LedgerError> {
    let mut settings = load_settings(conn)?;
    let n = settings.next_invoice_number;
    settings.next_invoice_number = n + 1;
    save_settings(conn, &settings)?;
    Ok(n.to_string())
}

/// Take the next prefixed reference id for a non-sale transaction kind.
/// Must be called inside the caller's write transaction.
pub(crate) fn take_reference_id(
    conn: &Connection,
    kind: TransactionKind,
) -> Result<String, LedgerError> {
    let mut settings = load_settings(conn)?;
    let n = settings.next_reference_number;
    settings.next_reference_number = n + 1;
    save_settings(conn, &settings)?;
    Ok(format!("{}-{n}", kind.ref_prefix()))
}

// ---------------------------------------------------------------------------
// Transaction rows
// ---------------------------------------------------------------------------

/// Append a transaction record. Completed rows are never edited afterwards;
/// the only later mutation is the pending-status approval transition.
pub(crate) fn insert_transaction(conn: &Connection, tx: &Transaction) -> Result<(), LedgerError> {
    let items_json = match &tx.items {
        Some(items) => Some(
            serde_json::to_string(items)
                .map_err(|e| LedgerError::InvalidInput(format!("serialize items: {e}")))?,
        ),
        None => None,
    };
    conn.execute(
        "INSERT INTO transactions (
            id, kind, date, amount, payment_method, description, category,
            related_party, related_id, items, status, due_date,
            is_direct_sale, shift_id, reverses
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            tx.id,
            tx.kind,
            tx.date,
            tx.amount,
            tx.payment_method,
            tx.description,
            tx.category,
            tx.related_party,
            tx.related_id,
            items_json,
            tx.status,
            tx.due_date,
            tx.is_direct_sale as i64,
            tx.shift_id,
            tx.reverses,
        ],
    )?;
    Ok(())
}

/// Fetch a transaction by id.
pub fn get_transaction(conn: &Connection, id: &str) -> Result<Transaction, LedgerError> {
    conn.query_row(
        &format!("SELECT {TX_COLUMNS} FROM transactions WHERE id = ?1"),
        params![id],
        Transaction::from_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            LedgerError::NotFound("transaction", id.to_string())
        }
        other => LedgerError::Storage(other),
    })
}

/// List all transactions in insertion order (replay order).
pub fn list_transactions(conn: &Connection) -> Result<Vec<Transaction>, LedgerError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TX_COLUMNS} FROM transactions ORDER BY rowid ASC"
    ))?;
    let rows = stmt.query_map([], Transaction::from_row)?;
    let mut out = Vec::new();
    for row in rows {
        match row {
            Ok(tx) => out.push(tx),
            Err(e) => warn!("skipping malformed transaction row: {e}"),
        }
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("migrations");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        run_migrations_for_test(&conn);
        conn
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_conn();
        run_migrations(&conn).expect("second run");
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_settings_round_trip() {
        let conn = test_conn();
        let mut s = load_settings(&conn).unwrap();
        assert_eq!(s.next_invoice_number, 1001);
        s.opening_balance = 50000.0;
        s.tax_rate = 14.0;
        save_settings(&conn, &s).unwrap();
        let loaded = load_settings(&conn).unwrap();
        assert_eq!(loaded.opening_balance, 50000.0);
        assert_eq!(loaded.tax_rate, 14.0);
    }

    #[test]
    fn test_invoice_numbers_are_sequential() {
        let conn = test_conn();
        assert_eq!(take_invoice_number(&conn).unwrap(), "1001");
        assert_eq!(take_invoice_number(&conn).unwrap(), "1002");
    }

    #[test]
    fn test_reference_ids_share_one_sequence() {
        let conn = test_conn();
        assert_eq!(
            take_reference_id(&conn, TransactionKind::Expense).unwrap(),
            "EXP-1"
        );
        assert_eq!(
            take_reference_id(&conn, TransactionKind::Purchase).unwrap(),
            "PUR-2"
        );
    }

    #[test]
    fn test_single_open_shift_index() {
        let conn = test_conn();
        conn.execute(
            "INSERT INTO shifts (user_id, user_name, start_time, status)
             VALUES (1, 'a', datetime('now'), 'open')",
            [],
        )
        .unwrap();
        let second = conn.execute(
            "INSERT INTO shifts (user_id, user_name, start_time, status)
             VALUES (2, 'b', datetime('now'), 'open')",
            [],
        );
        assert!(second.is_err(), "second open shift must violate the index");
    }
}
