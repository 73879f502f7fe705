//! A synchronous connection bound to one scheduling context.

use std::sync::{Arc, Mutex};
use syncbridge_core::connection::{CursorId, IsolationLevel, SyncConnection};
use syncbridge_core::context::ContextId;
use syncbridge_core::error::{BridgeErrorKind, Error, Result};
use syncbridge_core::event::{EventArgs, EventKind, EventTarget, Listeners, dispatch};
use syncbridge_core::{Row, Value};
use syncbridge_pool::PooledConnection;

enum Link<C: SyncConnection> {
    Pooled(PooledConnection<C>),
    Owned(C),
}

/// Cursors abandoned by their owner, closed before the connection's next
/// operation.
#[derive(Debug, Clone, Default)]
pub struct OrphanedCursors {
    inner: Arc<Mutex<Vec<CursorId>>>,
}

impl OrphanedCursors {
    pub fn push(&self, cursor: CursorId) {
        self.inner.lock().expect("lock poisoned").push(cursor);
    }

    fn take(&self) -> Vec<CursorId> {
        std::mem::take(&mut *self.inner.lock().expect("lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The synchronous connection object behind an async connection facade.
///
/// Wraps either a pooled connection or a caller-supplied one, fires execute
/// events, and is the target of connection-level listeners.
pub struct BoundConnection<C: SyncConnection> {
    link: Option<Link<C>>,
    context: ContextId,
    listeners: Listeners,
    orphans: OrphanedCursors,
}

impl<C: SyncConnection> std::fmt::Debug for BoundConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundConnection")
            .field("context", &self.context)
            .field("closed", &self.link.is_none())
            .field("orphaned_cursors", &self.orphans.len())
            .finish_non_exhaustive()
    }
}

impl<C: SyncConnection> BoundConnection<C> {
    /// Wrap a connection checked out of a pool.
    pub fn from_pool(pooled: PooledConnection<C>) -> Self {
        let context = pooled.context();
        Self {
            link: Some(Link::Pooled(pooled)),
            context,
            listeners: Listeners::new(),
            orphans: OrphanedCursors::default(),
        }
    }

    /// Wrap a caller-supplied connection, bound to `context`.
    pub fn from_connection(conn: C, context: ContextId) -> Self {
        Self {
            link: Some(Link::Owned(conn)),
            context,
            listeners: Listeners::new(),
            orphans: OrphanedCursors::default(),
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_none()
    }

    /// Handle used to hand back cursors that were abandoned.
    pub fn orphans(&self) -> OrphanedCursors {
        self.orphans.clone()
    }

    /// Fail unless `ctx` is the context this connection is bound to.
    #[allow(clippy::result_large_err)]
    pub fn check_context(&self, ctx: ContextId) -> Result<()> {
        match &self.link {
            Some(Link::Pooled(pooled)) => pooled.get(ctx).map(|_| ()),
            _ if ctx == self.context => Ok(()),
            _ => Err(Error::bridge(
                BridgeErrorKind::CrossContext,
                format!("connection is bound to {} but was used from {}", self.context, ctx),
            )),
        }
    }

    /// Mark a pooled connection so it is discarded instead of reused.
    pub fn invalidate(&mut self) {
        if let Some(Link::Pooled(pooled)) = &mut self.link {
            pooled.invalidate();
        }
    }

    #[allow(clippy::result_large_err)]
    fn conn(&self) -> Result<&C> {
        match &self.link {
            Some(Link::Pooled(pooled)) => pooled.get(self.context),
            Some(Link::Owned(conn)) => Ok(conn),
            None => Err(closed()),
        }
    }

    #[allow(clippy::result_large_err)]
    fn conn_mut(&mut self) -> Result<&mut C> {
        match &mut self.link {
            Some(Link::Pooled(pooled)) => pooled.get_mut(self.context),
            Some(Link::Owned(conn)) => Ok(conn),
            None => Err(closed()),
        }
    }

    /// Close cursors abandoned since the last operation.
    #[allow(clippy::result_large_err)]
    fn sweep(&mut self) -> Result<()> {
        let orphans = self.orphans.take();
        if orphans.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = orphans.len(), "Closing abandoned cursors");
        let conn = self.conn_mut()?;
        for cursor in orphans {
            conn.close_cursor(cursor)?;
        }
        Ok(())
    }
}

fn closed() -> Error {
    Error::bridge(BridgeErrorKind::UseAfterDispose, "connection is closed")
}

impl<C: SyncConnection> EventTarget for BoundConnection<C> {
    fn listeners(&self) -> &Listeners {
        &self.listeners
    }
}

impl<C: SyncConnection> SyncConnection for BoundConnection<C> {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.sweep()?;
        dispatch(self, &EventArgs::with_statement(EventKind::BeforeExecute, sql))?;
        let affected = self.conn_mut()?.execute(sql, params)?;
        dispatch(self, &EventArgs::with_statement(EventKind::AfterExecute, sql))?;
        Ok(affected)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.sweep()?;
        dispatch(self, &EventArgs::with_statement(EventKind::BeforeExecute, sql))?;
        let rows = self.conn_mut()?.query(sql, params)?;
        dispatch(self, &EventArgs::with_statement(EventKind::AfterExecute, sql))?;
        Ok(rows)
    }

    fn begin(&mut self, isolation: IsolationLevel) -> Result<()> {
        self.sweep()?;
        self.conn_mut()?.begin(isolation)
    }

    fn commit(&mut self) -> Result<()> {
        self.sweep()?;
        dispatch(self, &EventArgs::new(EventKind::BeforeCommit))?;
        self.conn_mut()?.commit()?;
        dispatch(self, &EventArgs::new(EventKind::AfterCommit))
    }

    fn rollback(&mut self) -> Result<()> {
        self.sweep()?;
        self.conn_mut()?.rollback()?;
        dispatch(self, &EventArgs::new(EventKind::AfterRollback))
    }

    fn in_transaction(&self) -> bool {
        self.conn().is_ok_and(|c| c.in_transaction())
    }

    fn open_cursor(&mut self, sql: &str, params: &[Value]) -> Result<CursorId> {
        self.sweep()?;
        dispatch(self, &EventArgs::with_statement(EventKind::BeforeExecute, sql))?;
        let cursor = self.conn_mut()?.open_cursor(sql, params)?;
        dispatch(self, &EventArgs::with_statement(EventKind::AfterExecute, sql))?;
        Ok(cursor)
    }

    fn fetch(&mut self, cursor: CursorId, max_rows: usize) -> Result<Vec<Row>> {
        self.conn_mut()?.fetch(cursor, max_rows)
    }

    fn close_cursor(&mut self, cursor: CursorId) -> Result<()> {
        self.conn_mut()?.close_cursor(cursor)
    }

    fn ping(&mut self) -> Result<()> {
        self.conn_mut()?.ping()
    }

    /// Release the connection.
    ///
    /// Abandoned cursors are closed and an open transaction is rolled back.
    /// A pooled connection goes back to its pool; an owned one is closed.
    /// Closing twice is not an error.
    fn close(&mut self) -> Result<()> {
        if self.link.is_none() {
            return Ok(());
        }
        self.sweep()?;
        if self.in_transaction() {
            self.rollback()?;
        }
        match self.link.take() {
            Some(Link::Pooled(pooled)) => {
                tracing::debug!(id = pooled.id(), "Returning connection to pool");
                pooled.release();
                Ok(())
            }
            Some(Link::Owned(mut conn)) => conn.close(),
            None => Ok(()),
        }
    }
}

impl<C: SyncConnection> Drop for BoundConnection<C> {
    fn drop(&mut self) {
        // No I/O here: a connection left mid-transaction is not reused.
        if let Some(Link::Pooled(pooled)) = &mut self.link {
            if pooled.get(self.context).is_ok_and(|c| c.in_transaction()) {
                tracing::warn!(id = pooled.id(), "Connection dropped inside a transaction");
                pooled.invalidate();
            }
        }
    }
}
