//! The synchronous capability interface the bridge drives.
//!
//! This module defines the blocking-shaped operation set of a data-access
//! handle:
//!
//! - [`SyncConnection`] - execute statements, manage transactions, drive
//!   server-side cursors
//! - [`IsolationLevel`] - SQL transaction isolation levels
//! - [`CursorId`] - handle to an open server-side cursor
//!
//! Implementations are plain synchronous code. When one of them needs to wait
//! on I/O it calls `await_only` from `syncbridge-trampoline`, which suspends
//! the surrounding bridge context instead of blocking the scheduler.

use crate::error::Result;
use crate::row::Row;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Read uncommitted: dirty reads, non-repeatable reads, and phantoms possible.
    ReadUncommitted,

    /// Read committed: only committed changes from others are visible.
    #[default]
    ReadCommitted,

    /// Repeatable read: a consistent snapshot for the whole transaction.
    RepeatableRead,

    /// Serializable: transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Identifier of a server-side cursor opened by [`SyncConnection::open_cursor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CursorId(u64);

impl CursorId {
    /// Wrap a driver-assigned cursor number.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The driver-assigned cursor number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// A blocking data-access connection.
///
/// Every method may perform I/O. Callers running inside a bridge context get
/// that I/O serviced by the host scheduler; callers outside of one get
/// whatever the implementation does natively.
///
/// # Example
///
/// ```rust,ignore
/// let affected = conn.execute("UPDATE users SET active = $1", &[Value::Bool(true)])?;
/// conn.begin(IsolationLevel::default())?;
/// conn.execute("INSERT INTO logs (msg) VALUES ($1)", &[Value::from("action")])?;
/// conn.commit()?;
/// ```
pub trait SyncConnection: Send + 'static {
    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    #[allow(clippy::result_large_err)]
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute a query and return every row, fully buffered.
    #[allow(clippy::result_large_err)]
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a query and return the first row, if any.
    #[allow(clippy::result_large_err)]
    fn query_one(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Begin a transaction.
    #[allow(clippy::result_large_err)]
    fn begin(&mut self, isolation: IsolationLevel) -> Result<()>;

    /// Commit the open transaction.
    #[allow(clippy::result_large_err)]
    fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction.
    #[allow(clippy::result_large_err)]
    fn rollback(&mut self) -> Result<()>;

    /// Whether a transaction is currently open.
    fn in_transaction(&self) -> bool;

    /// Open a server-side cursor over a query without materializing it.
    #[allow(clippy::result_large_err)]
    fn open_cursor(&mut self, sql: &str, params: &[Value]) -> Result<CursorId>;

    /// Fetch up to `max_rows` rows from an open cursor. An empty batch means
    /// the cursor is exhausted.
    #[allow(clippy::result_large_err)]
    fn fetch(&mut self, cursor: CursorId, max_rows: usize) -> Result<Vec<Row>>;

    /// Close a server-side cursor.
    #[allow(clippy::result_large_err)]
    fn close_cursor(&mut self, cursor: CursorId) -> Result<()>;

    /// Check that the connection is still usable.
    #[allow(clippy::result_large_err)]
    fn ping(&mut self) -> Result<()>;

    /// Close the connection. Closing twice is not an error.
    #[allow(clippy::result_large_err)]
    fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_default() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_isolation_level_as_sql() {
        assert_eq!(IsolationLevel::ReadUncommitted.as_sql(), "READ UNCOMMITTED");
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
    }

    #[test]
    fn test_cursor_id_roundtrip() {
        let id = CursorId::new(9);
        assert_eq!(id.get(), 9);
        assert!(CursorId::new(1) < id);
    }
}
