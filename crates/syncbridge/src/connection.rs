//! The asynchronous connection facade.
//!
//! [`AsyncConnection`] owns a [`BoundConnection`] and runs every operation
//! against it inside a bridge context. Each method call is one unit of work:
//! the synchronous connection is moved into the context, the operation runs
//! there (suspending whenever the driver waits on I/O), and the connection is
//! moved back before the call resolves.
//!
//! A facade is bound to the scheduling context it was opened from. Using it
//! from another context fails with a cross-context error before any I/O is
//! attempted, and overlapping two operations on one facade fails with a
//! concurrent-use error.

use crate::handle::HandleSlot;
use crate::stream::AsyncCursor;
use asupersync::{Cx, Outcome};
use syncbridge_core::connection::{IsolationLevel, SyncConnection};
use syncbridge_core::context::ContextId;
use syncbridge_core::error::{Error, Result};
use syncbridge_core::event::{EventTarget, Listeners};
use syncbridge_core::{Row, Value};
use syncbridge_session::{BoundConnection, OrphanedCursors};
use syncbridge_trampoline::Trampoline;

/// An asynchronous handle to one synchronous connection.
pub struct AsyncConnection<C: SyncConnection> {
    slot: HandleSlot<BoundConnection<C>>,
    context: ContextId,
    trampoline: Trampoline,
    listeners: Listeners,
    orphans: OrphanedCursors,
}

impl<C: SyncConnection> std::fmt::Debug for AsyncConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncConnection")
            .field("context", &self.context)
            .field("closed", &self.slot.is_disposed())
            .finish_non_exhaustive()
    }
}

impl<C: SyncConnection> AsyncConnection<C> {
    /// Wrap an already bound synchronous connection.
    pub fn from_bound(bound: BoundConnection<C>, trampoline: Trampoline) -> Self {
        let context = bound.context();
        let listeners = bound.listeners().clone();
        let orphans = bound.orphans();
        Self {
            slot: HandleSlot::new(bound, "connection"),
            context,
            trampoline,
            listeners,
            orphans,
        }
    }

    /// Adopt a caller-supplied synchronous connection, bound to the task that
    /// owns `cx`.
    ///
    /// Closing the facade closes the connection.
    pub fn from_sync(conn: C, cx: &Cx) -> Self {
        Self::from_sync_in(conn, ContextId::of(cx))
    }

    /// Adopt a caller-supplied synchronous connection, bound to `ctx`.
    pub fn from_sync_in(conn: C, ctx: ContextId) -> Self {
        Self::from_bound(
            BoundConnection::from_connection(conn, ctx),
            syncbridge_trampoline::global().clone(),
        )
    }

    /// The context this connection is bound to.
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn is_closed(&self) -> bool {
        self.slot.is_disposed()
    }

    pub(crate) fn orphans(&self) -> &OrphanedCursors {
        &self.orphans
    }

    pub(crate) fn listener_set(&self) -> &Listeners {
        &self.listeners
    }

    /// Run `f` against the bound connection inside a bridge context, after
    /// checking the caller's context.
    pub(crate) async fn with_conn<R, F>(&self, cx: &Cx, f: F) -> Outcome<R, Error>
    where
        R: Send + 'static,
        F: FnOnce(&mut BoundConnection<C>) -> Result<R> + Send + 'static,
    {
        let ctx = ContextId::of(cx);
        self.slot
            .run(&self.trampoline, cx, move |conn| {
                conn.check_context(ctx)?;
                f(conn)
            })
            .await
    }

    /// Execute a statement and return rows affected.
    #[tracing::instrument(level = "debug", skip(self, cx, params))]
    pub async fn execute(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(cx, move |conn| conn.execute(&sql, &params))
            .await
    }

    /// Execute a query and return every row.
    #[tracing::instrument(level = "debug", skip(self, cx, params))]
    pub async fn query(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(cx, move |conn| conn.query(&sql, &params))
            .await
    }

    /// Execute a query and return the first row, if any.
    pub async fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Option<Row>, Error> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(cx, move |conn| conn.query_one(&sql, &params))
            .await
    }

    /// Execute a query and return the first column of the first row.
    pub async fn scalar(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Option<Value>, Error> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(cx, move |conn| {
            Ok(conn
                .query_one(&sql, &params)?
                .and_then(|row| row.into_values().into_iter().next()))
        })
        .await
    }

    /// Begin a transaction at the default isolation level.
    pub async fn begin(&self, cx: &Cx) -> Outcome<AsyncTransaction<'_, C>, Error> {
        self.begin_with(cx, IsolationLevel::default()).await
    }

    /// Begin a transaction at `isolation`.
    pub async fn begin_with(
        &self,
        cx: &Cx,
        isolation: IsolationLevel,
    ) -> Outcome<AsyncTransaction<'_, C>, Error> {
        match self.with_conn(cx, move |conn| conn.begin(isolation)).await {
            Outcome::Ok(()) => Outcome::Ok(AsyncTransaction {
                conn: self,
                active: true,
            }),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Commit the open transaction, if any.
    pub async fn commit(&self, cx: &Cx) -> Outcome<(), Error> {
        self.with_conn(cx, |conn| {
            if conn.in_transaction() {
                conn.commit()?;
            }
            Ok(())
        })
        .await
    }

    /// Roll back the open transaction, if any.
    pub async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        self.with_conn(cx, |conn| {
            if conn.in_transaction() {
                conn.rollback()?;
            }
            Ok(())
        })
        .await
    }

    /// Whether a transaction is open.
    #[allow(clippy::result_large_err)]
    pub fn in_transaction(&self) -> Result<bool> {
        self.slot.with_now(|conn| conn.in_transaction())
    }

    /// Open a server-side cursor and stream its rows.
    ///
    /// The cursor must be closed with [`AsyncCursor::close`]. A cursor that is
    /// dropped instead is closed before the next operation on this connection.
    pub async fn stream(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<AsyncCursor<'_, C>, Error> {
        let sql = sql.to_string();
        let params = params.to_vec();
        match self
            .with_conn(cx, move |conn| conn.open_cursor(&sql, &params))
            .await
        {
            Outcome::Ok(cursor) => Outcome::Ok(AsyncCursor::new(self, cursor)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Run arbitrary synchronous code against the bound connection inside a
    /// bridge context.
    ///
    /// ```rust,ignore
    /// let total = conn
    ///     .run_sync(&cx, |sync_conn| {
    ///         sync_conn.execute("DELETE FROM staging", &[])?;
    ///         sync_conn.execute("INSERT INTO staging SELECT * FROM incoming", &[])
    ///     })
    ///     .await;
    /// ```
    pub async fn run_sync<R, F>(&self, cx: &Cx, f: F) -> Outcome<R, Error>
    where
        R: Send + 'static,
        F: FnOnce(&mut BoundConnection<C>) -> Result<R> + Send + 'static,
    {
        self.with_conn(cx, f).await
    }

    /// Discard the underlying connection instead of returning it to the pool.
    #[allow(clippy::result_large_err)]
    pub fn invalidate(&self) -> Result<()> {
        self.slot.with_now(BoundConnection::invalidate)
    }

    /// Roll back any open transaction, release the connection, and dispose of
    /// this facade.
    ///
    /// Closing twice is not an error; any other use after closing fails with a
    /// use-after-dispose error.
    pub async fn close(&self, cx: &Cx) -> Outcome<(), Error> {
        let ctx = ContextId::of(cx);
        let outcome = self
            .slot
            .run_and_dispose(&self.trampoline, cx, move |conn| {
                conn.check_context(ctx)?;
                conn.close()
            })
            .await;
        tracing::debug!(context = %self.context, "Connection facade closed");
        outcome
    }
}

impl<C: SyncConnection> Drop for AsyncConnection<C> {
    fn drop(&mut self) {
        if !self.slot.is_disposed() {
            tracing::debug!(
                context = %self.context,
                "Connection facade dropped without close; releasing without I/O"
            );
        }
    }
}

/// A transaction open on an [`AsyncConnection`].
///
/// Finish it with [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// A transaction dropped while still active is rolled back when its
/// connection is closed.
pub struct AsyncTransaction<'a, C: SyncConnection> {
    conn: &'a AsyncConnection<C>,
    active: bool,
}

impl<C: SyncConnection> std::fmt::Debug for AsyncTransaction<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTransaction")
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl<C: SyncConnection> AsyncTransaction<'_, C> {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The connection this transaction runs on.
    pub fn connection(&self) -> &AsyncConnection<C> {
        self.conn
    }

    pub async fn execute(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        self.conn.execute(cx, sql, params).await
    }

    pub async fn query(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        self.conn.query(cx, sql, params).await
    }

    pub async fn commit(mut self, cx: &Cx) -> Outcome<(), Error> {
        self.active = false;
        self.conn.with_conn(cx, |conn| conn.commit()).await
    }

    pub async fn rollback(mut self, cx: &Cx) -> Outcome<(), Error> {
        self.active = false;
        self.conn.with_conn(cx, |conn| conn.rollback()).await
    }
}

impl<C: SyncConnection> Drop for AsyncTransaction<'_, C> {
    fn drop(&mut self) {
        if self.active {
            tracing::warn!(
                context = %self.conn.context,
                "Transaction dropped without commit or rollback"
            );
        }
    }
}
