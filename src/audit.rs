//! Append-only activity log.
//!
//! Every mutating operation stamps who did what. Entries are never updated
//! or deleted.

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::warn;

use crate::db::LedgerState;
use crate::error::LedgerError;
use crate::models::{ActivityLogEntry, Operator};

/// Append an entry inside the caller's write transaction.
pub(crate) fn log_activity(
    conn: &Connection,
    operator: &Operator,
    action: &str,
    details: &str,
) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO activity_log (date, user_id, user_name, action, details)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            Utc::now().to_rfc3339(),
            operator.id,
            operator.name,
            action,
            details
        ],
    )?;
    Ok(())
}

/// Most recent activity entries, newest first.
pub fn recent_activity(
    state: &LedgerState,
    limit: u32,
) -> Result<Vec<ActivityLogEntry>, LedgerError> {
    let conn = state.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, date, user_id, user_name, action, details
         FROM activity_log ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(ActivityLogEntry {
            id: row.get(0)?,
            date: row.get(1)?,
            user_id: row.get(2)?,
            user_name: row.get(3)?,
            action: row.get(4)?,
            details: row.get(5)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        match row {
            Ok(entry) => out.push(entry),
            Err(e) => warn!("skipping malformed activity row: {e}"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn test_log_and_read_back() {
        let state = db::LedgerState::open_in_memory().unwrap();
        let op = Operator::new(1, "admin");
        {
            let conn = state.lock().unwrap();
            log_activity(&conn, &op, "sale", "invoice 1001").unwrap();
            log_activity(&conn, &op, "expense", "EXP-1").unwrap();
        }
        let entries = recent_activity(&state, 10).unwrap();
        assert_eq!(entries.len(), 2);
        // Newest first
        assert_eq!(entries[0].action, "expense");
        assert_eq!(entries[1].action, "sale");
        assert_eq!(entries[1].user_name, "admin");
    }
}
