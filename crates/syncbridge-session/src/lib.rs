//! Synchronous sessions and scoped registries for SyncBridge.
//!
//! [`SyncSession`] is a unit of work over a pooled connection. It is plain
//! synchronous code meant to run inside a bridge context: the connection is
//! checked out lazily on the first statement through `await_only`, so the
//! pool's asynchronous acquire becomes a single suspension.
//!
//! [`ScopedRegistry`] keeps one resource per scheduling context, and
//! [`BoundConnection`] is the synchronous connection object that carries
//! connection-level events.

pub mod bound;
pub mod registry;

pub use bound::{BoundConnection, OrphanedCursors};
pub use registry::{ScopedRegistry, ScopedResource};

use asupersync::Cx;
use serde::{Deserialize, Serialize};
use syncbridge_core::connection::{IsolationLevel, SyncConnection};
use syncbridge_core::context::ContextId;
use syncbridge_core::error::{BridgeErrorKind, Error, Result, outcome_into_result};
use syncbridge_core::event::{EventArgs, EventKind, EventTarget, Listeners, dispatch};
use syncbridge_core::{Row, Value};
use syncbridge_pool::{ConnectionManager, Pool};
use syncbridge_trampoline::await_only;

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Begin a transaction automatically before the first statement.
    pub auto_begin: bool,
    /// Isolation level for automatically begun transactions.
    pub isolation: IsolationLevel,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            isolation: IsolationLevel::default(),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// A synchronous unit of work.
///
/// Every method that may touch the database takes the caller's `Cx`, which
/// is used to check a connection out of the pool on first use.
pub struct SyncSession<M>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
{
    pool: Pool<M>,
    config: SessionConfig,
    context: Option<ContextId>,
    connection: Option<BoundConnection<M::Connection>>,
    listeners: Listeners,
    closed: bool,
}

impl<M> std::fmt::Debug for SyncSession<M>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("config", &self.config)
            .field("context", &self.context)
            .field("connection", &self.connection)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<M> SyncSession<M>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
{
    /// Create a session with default configuration.
    pub fn new(pool: Pool<M>) -> Self {
        Self::with_config(pool, SessionConfig::default())
    }

    pub fn with_config(pool: Pool<M>, config: SessionConfig) -> Self {
        Self {
            pool,
            config,
            context: None,
            connection: None,
            listeners: Listeners::new(),
            closed: false,
        }
    }

    /// Bind the session to an explicit scheduling context instead of the
    /// task of the first caller.
    pub fn bind_context(mut self, ctx: ContextId) -> Self {
        self.context = Some(ctx);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The context this session's connection is (or will be) bound to.
    pub fn context(&self) -> Option<ContextId> {
        self.context
    }

    /// Fail if the session is already bound to a context other than `ctx`.
    #[allow(clippy::result_large_err)]
    pub fn check_context(&self, ctx: ContextId) -> Result<()> {
        match self.context {
            Some(bound) if bound != ctx => Err(Error::bridge(
                BridgeErrorKind::CrossContext,
                format!("session is bound to {bound} but was used from {ctx}"),
            )),
            _ => Ok(()),
        }
    }

    pub fn pool(&self) -> &Pool<M> {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether a connection is currently checked out.
    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn in_transaction(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|conn| conn.in_transaction())
    }

    #[allow(clippy::result_large_err)]
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::bridge(
                BridgeErrorKind::UseAfterDispose,
                "session is closed",
            ));
        }
        Ok(())
    }

    /// The session's connection, checked out of the pool on first use.
    ///
    /// Must run inside a bridge context; the checkout suspends it once.
    #[allow(clippy::result_large_err)]
    pub fn connection(&mut self, cx: &Cx) -> Result<&mut BoundConnection<M::Connection>> {
        self.ensure_open()?;
        if self.connection.is_none() {
            let ctx = *self.context.get_or_insert_with(|| ContextId::of(cx));
            let pool = self.pool.clone();
            let acquire_cx = cx.clone();
            let pooled = await_only(async move {
                outcome_into_result(pool.acquire_in(&acquire_cx, ctx).await)
            })?;
            tracing::debug!(id = pooled.id(), %ctx, "Session checked out connection");
            self.connection = Some(BoundConnection::from_pool(pooled));
        }
        self.connection.as_mut().ok_or_else(|| {
            Error::bridge(BridgeErrorKind::UseAfterDispose, "session has no connection")
        })
    }

    #[allow(clippy::result_large_err)]
    fn prepared(&mut self, cx: &Cx) -> Result<&mut BoundConnection<M::Connection>> {
        let auto_begin = self.config.auto_begin;
        let isolation = self.config.isolation;
        let conn = self.connection(cx)?;
        if auto_begin && !conn.in_transaction() {
            conn.begin(isolation)?;
        }
        Ok(conn)
    }

    /// Execute a statement and return rows affected.
    #[allow(clippy::result_large_err)]
    pub fn execute(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Result<u64> {
        self.prepared(cx)?.execute(sql, params)
    }

    /// Execute a query and return every row.
    #[allow(clippy::result_large_err)]
    pub fn query(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.prepared(cx)?.query(sql, params)
    }

    /// Begin a transaction explicitly.
    #[allow(clippy::result_large_err)]
    pub fn begin(&mut self, cx: &Cx) -> Result<()> {
        let isolation = self.config.isolation;
        self.connection(cx)?.begin(isolation)
    }

    /// Commit the current transaction.
    ///
    /// `BeforeCommit` listeners run first and may abort the commit.
    #[allow(clippy::result_large_err)]
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        dispatch(self, &EventArgs::new(EventKind::BeforeCommit))?;
        if let Some(conn) = self.connection.as_mut() {
            if conn.in_transaction() {
                conn.commit()?;
            }
        }
        dispatch(self, &EventArgs::new(EventKind::AfterCommit))
    }

    /// Rollback the current transaction.
    #[allow(clippy::result_large_err)]
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Some(conn) = self.connection.as_mut() {
            if conn.in_transaction() {
                conn.rollback()?;
            }
        }
        dispatch(self, &EventArgs::new(EventKind::AfterRollback))
    }

    /// Mark the checked-out connection so it is not reused.
    pub fn invalidate(&mut self) {
        if let Some(conn) = self.connection.as_mut() {
            conn.invalidate();
        }
    }

    /// Roll back, return the connection to the pool, and close the session.
    ///
    /// Closing twice is not an error.
    #[allow(clippy::result_large_err)]
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.connection.take() {
            Some(mut conn) => conn.close(),
            None => Ok(()),
        }
    }
}

impl<M> EventTarget for SyncSession<M>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
{
    fn listeners(&self) -> &Listeners {
        &self.listeners
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
