//! Persistent call store.
//!
//! [`CallStore`] is the only way the ledger touches persisted call records.
//! [`SqliteCallStore`] keeps them in a single `calls` table; timestamps are
//! stored as epoch milliseconds and an open call has a NULL `end_time`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::types::{CallMatch, CallRecord};
use crate::error::Result;

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS calls (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    from_id     TEXT    NOT NULL,
    to_id       TEXT    NOT NULL,
    start_time  INTEGER NOT NULL,
    end_time    INTEGER,
    duration    REAL    NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_calls_from ON calls (from_id, end_time);
CREATE INDEX IF NOT EXISTS idx_calls_to ON calls (to_id, end_time);
";

const SELECT_CALL: &str = "SELECT id, from_id, to_id, start_time, end_time, duration FROM calls";

/// Newest first; the id breaks ties between calls started in the same millisecond.
const NEWEST_FIRST: &str = "ORDER BY start_time DESC, id DESC";

/// Storage backend for call records.
pub trait CallStore: Send + 'static {
    /// Insert an open call and return its id.
    fn insert_open_call(&self, from: &str, to: &str, start_time: DateTime<Utc>) -> Result<i64>;

    /// Most recent open call matching `filter`.
    fn find_open_call(&self, filter: &CallMatch<'_>) -> Result<Option<CallRecord>>;

    /// Most recent call matching `filter`, open or closed.
    fn find_call(&self, filter: &CallMatch<'_>) -> Result<Option<CallRecord>>;

    fn get_call(&self, id: i64) -> Result<Option<CallRecord>>;

    /// Close an open call. Returns false if the call does not exist or is
    /// already closed.
    fn close_call(&self, id: i64, end_time: DateTime<Utc>, duration: f64) -> Result<bool>;

    fn count_calls(&self) -> Result<u64>;

    /// Calls newest first; `None` returns all of them.
    fn list_calls(&self, limit: Option<usize>) -> Result<Vec<CallRecord>>;
}

/// SQLite-backed call store.
pub struct SqliteCallStore {
    conn: Mutex<Connection>,
}

impl SqliteCallStore {
    /// Open (or create) the database at `path`. `":memory:"` opens an
    /// in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        if path == ":memory:" {
            return Self::open_in_memory();
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query_one(&self, filter: &CallMatch<'_>, open_only: bool) -> Result<Option<CallRecord>> {
        let (clause, args) = match filter {
            CallMatch::Between(a, b) => (
                "((from_id = ?1 AND to_id = ?2) OR (from_id = ?2 AND to_id = ?1))",
                vec![*a, *b],
            ),
            CallMatch::Involving(id) => ("(from_id = ?1 OR to_id = ?1)", vec![*id]),
        };
        let open = if open_only { " AND end_time IS NULL" } else { "" };
        let sql = format!("{SELECT_CALL} WHERE {clause}{open} {NEWEST_FIRST} LIMIT 1");

        let conn = self.conn.lock();
        let record = conn
            .query_row(&sql, params_from_iter(args), row_to_record)
            .optional()?;
        Ok(record)
    }
}

impl CallStore for SqliteCallStore {
    fn insert_open_call(&self, from: &str, to: &str, start_time: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO calls (from_id, to_id, start_time, end_time, duration) VALUES (?, ?, ?, NULL, 0)",
            params![from, to, start_time.timestamp_millis()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn find_open_call(&self, filter: &CallMatch<'_>) -> Result<Option<CallRecord>> {
        self.query_one(filter, true)
    }

    fn find_call(&self, filter: &CallMatch<'_>) -> Result<Option<CallRecord>> {
        self.query_one(filter, false)
    }

    fn get_call(&self, id: i64) -> Result<Option<CallRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(&format!("{SELECT_CALL} WHERE id = ?"), params![id], row_to_record)
            .optional()?;
        Ok(record)
    }

    fn close_call(&self, id: i64, end_time: DateTime<Utc>, duration: f64) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE calls SET end_time = ?, duration = ? WHERE id = ? AND end_time IS NULL",
            params![end_time.timestamp_millis(), duration, id],
        )?;
        Ok(changed > 0)
    }

    fn count_calls(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM calls", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn list_calls(&self, limit: Option<usize>) -> Result<Vec<CallRecord>> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(|l| l.min(i64::MAX as usize) as i64).unwrap_or(-1);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{SELECT_CALL} {NEWEST_FIRST} LIMIT ?"))?;
        let rows = stmt.query_map(params![limit], row_to_record)?;

        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?);
        }
        Ok(calls)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<CallRecord> {
    let start_ms: i64 = row.get(3)?;
    let end_ms: Option<i64> = row.get(4)?;
    Ok(CallRecord {
        id: row.get(0)?,
        from: row.get(1)?,
        to: row.get(2)?,
        start_time: from_millis(start_ms),
        end_time: end_ms.map(from_millis),
        duration: row.get(5)?,
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
