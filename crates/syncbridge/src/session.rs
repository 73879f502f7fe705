//! Asynchronous sessions.
//!
//! [`AsyncSession`] drives a [`SyncSession`] through the trampoline: every
//! method runs the corresponding synchronous session method inside a bridge
//! context. The connection is checked out lazily by the synchronous session
//! itself, so the first statement of a session costs one extra suspension.
//!
//! [`AsyncScopedSession`] keeps one [`AsyncSession`] per scope key and proxies
//! the common operations to the session of the calling scope.

use crate::handle::HandleSlot;
use asupersync::{Cx, Outcome};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use syncbridge_core::connection::SyncConnection;
use syncbridge_core::context::ContextId;
use syncbridge_core::error::{Error, Result};
use syncbridge_core::event::{EventTarget, Listeners};
use syncbridge_core::{Row, Value};
use syncbridge_pool::ConnectionManager;
use syncbridge_session::{ScopedRegistry, ScopedResource, SyncSession};
use syncbridge_trampoline::Trampoline;

/// An asynchronous unit of work.
pub struct AsyncSession<M>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
{
    slot: HandleSlot<SyncSession<M>>,
    trampoline: Trampoline,
    listeners: Listeners,
}

impl<M> std::fmt::Debug for AsyncSession<M>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSession")
            .field("closed", &self.slot.is_disposed())
            .finish_non_exhaustive()
    }
}

impl<M> AsyncSession<M>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
{
    /// Wrap a synchronous session.
    pub fn new(session: SyncSession<M>, trampoline: Trampoline) -> Self {
        let listeners = session.listeners().clone();
        Self {
            slot: HandleSlot::new(session, "session"),
            trampoline,
            listeners,
        }
    }

    pub(crate) fn listener_set(&self) -> &Listeners {
        &self.listeners
    }

    pub fn is_closed(&self) -> bool {
        self.slot.is_disposed()
    }

    /// Run `f` against the synchronous session inside a bridge context.
    ///
    /// `f` receives a clone of the caller's `Cx`, which the session uses to
    /// check out its connection.
    pub async fn run_sync<R, F>(&self, cx: &Cx, f: F) -> Outcome<R, Error>
    where
        R: Send + 'static,
        F: FnOnce(&mut SyncSession<M>, &Cx) -> Result<R> + Send + 'static,
    {
        let op_cx = cx.clone();
        let ctx = ContextId::of(cx);
        self.slot
            .run(&self.trampoline, cx, move |session| {
                session.check_context(ctx)?;
                f(session, &op_cx)
            })
            .await
    }

    /// Execute a statement and return rows affected.
    pub async fn execute(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.run_sync(cx, move |session, cx| session.execute(cx, &sql, &params))
            .await
    }

    /// Execute a query and return every row.
    pub async fn query(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.run_sync(cx, move |session, cx| session.query(cx, &sql, &params))
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
        self.run_sync(cx, move |session, cx| {
            Ok(session
                .query(cx, &sql, &params)?
                .into_iter()
                .next()
                .and_then(|row| row.into_values().into_iter().next()))
        })
        .await
    }

    /// Begin a transaction explicitly.
    pub async fn begin(&self, cx: &Cx) -> Outcome<(), Error> {
        self.run_sync(cx, |session, cx| session.begin(cx)).await
    }

    pub async fn commit(&self, cx: &Cx) -> Outcome<(), Error> {
        self.run_sync(cx, |session, _| session.commit()).await
    }

    pub async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        self.run_sync(cx, |session, _| session.rollback()).await
    }

    #[allow(clippy::result_large_err)]
    pub fn in_transaction(&self) -> Result<bool> {
        self.slot.with_now(|session| session.in_transaction())
    }

    /// Run `f` against the synchronous session without entering a bridge
    /// context. For inspection and configuration only: anything that may
    /// check out a connection belongs in [`run_sync`](Self::run_sync).
    #[allow(clippy::result_large_err)]
    pub fn with_sync_session<R>(&self, f: impl FnOnce(&mut SyncSession<M>) -> R) -> Result<R> {
        self.slot.with_now(f)
    }

    /// Roll back, return the connection to the pool, and dispose of this
    /// facade. Closing twice is not an error.
    pub async fn close(&self, cx: &Cx) -> Outcome<(), Error> {
        self.slot
            .run_and_dispose(&self.trampoline, cx, |session| session.close())
            .await
    }
}

impl<M> ScopedResource for AsyncSession<M>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
{
    fn close(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        AsyncSession::close(self, cx)
    }
}

/// One [`AsyncSession`] per scope.
///
/// There is no default scope function. Scopes are usually derived from the
/// calling task:
///
/// ```rust,ignore
/// let sessions = engine.scoped_session(ContextId::of);
/// sessions.execute(&cx, "UPDATE heroes SET age = age + 1", &[]).await;
/// sessions.commit(&cx).await;
/// sessions.remove(&cx).await;
/// ```
pub struct AsyncScopedSession<M, K = ContextId>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
{
    registry: ScopedRegistry<AsyncSession<M>, K>,
}

impl<M, K> std::fmt::Debug for AsyncScopedSession<M, K>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
    K: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncScopedSession")
            .field("registry", &self.registry)
            .finish()
    }
}

impl<M, K> AsyncScopedSession<M, K>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(
        factory: impl Fn() -> AsyncSession<M> + Send + Sync + 'static,
        scopefunc: impl Fn(&Cx) -> K + Send + Sync + 'static,
    ) -> Self {
        Self {
            registry: ScopedRegistry::new(factory, scopefunc),
        }
    }

    /// The session of the calling scope, created on first access.
    pub fn get(&self, cx: &Cx) -> Arc<AsyncSession<M>> {
        self.registry.get(cx)
    }

    /// Whether the calling scope has a session.
    pub fn has(&self, cx: &Cx) -> bool {
        self.registry.has(cx)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub async fn execute(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<u64, Error> {
        self.get(cx).execute(cx, sql, params).await
    }

    pub async fn query(&self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        self.get(cx).query(cx, sql, params).await
    }

    pub async fn commit(&self, cx: &Cx) -> Outcome<(), Error> {
        self.get(cx).commit(cx).await
    }

    pub async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        self.get(cx).rollback(cx).await
    }

    /// Close and forget the calling scope's session. The next access from
    /// that scope creates a fresh one.
    ///
    /// A session with an operation in flight fails with a `ConcurrentUse`
    /// bridge error and stays registered.
    pub async fn remove(&self, cx: &Cx) -> Outcome<(), Error> {
        self.registry.remove(cx).await
    }

    /// Close and forget every scope's session.
    pub async fn remove_all(&self, cx: &Cx) -> Outcome<(), Error> {
        self.registry.remove_all(cx).await
    }
}
