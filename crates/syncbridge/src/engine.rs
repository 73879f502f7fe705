//! The asynchronous engine: a pool of synchronous connections served to
//! asynchronous callers.

use crate::config::EngineConfig;
use crate::connection::AsyncConnection;
use crate::session::{AsyncScopedSession, AsyncSession};
use asupersync::{Cx, Outcome};
use std::hash::Hash;
use syncbridge_core::connection::SyncConnection;
use syncbridge_core::context::ContextId;
use syncbridge_core::error::{Error, Result};
use syncbridge_core::event::{EventKind, EventTarget};
use syncbridge_pool::{ConnectionManager, Pool, PoolStats};
use syncbridge_session::{BoundConnection, SessionConfig, SyncSession};
use syncbridge_trampoline::Trampoline;

/// Entry point of the asynchronous facade.
///
/// Cloning is cheap: clones share the pool and the trampoline.
///
/// ```rust,ignore
/// let engine = AsyncEngine::new(manager, EngineConfig::default())?;
/// let conn = unwrap_outcome(engine.connect(&cx).await);
/// conn.execute(&cx, "INSERT INTO heroes (name) VALUES ($1)", &[Value::from("Spider-Boy")]).await;
/// conn.close(&cx).await;
/// engine.dispose(&cx).await;
/// ```
pub struct AsyncEngine<M>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
{
    pool: Pool<M>,
    trampoline: Trampoline,
    config: EngineConfig,
}

impl<M> Clone for AsyncEngine<M>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            trampoline: self.trampoline.clone(),
            config: self.config.clone(),
        }
    }
}

impl<M> std::fmt::Debug for AsyncEngine<M>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncEngine")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<M> AsyncEngine<M>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
{
    #[allow(clippy::result_large_err)]
    pub fn new(manager: M, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = Pool::new(manager, config.pool.clone())?;
        let trampoline = Trampoline::new(config.trampoline.clone());
        tracing::info!(
            kind = ?config.pool.kind,
            max_connections = config.pool.max_connections,
            "Engine created"
        );
        Ok(Self {
            pool,
            trampoline,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Pool<M> {
        &self.pool
    }

    /// The trampoline every facade of this engine runs on.
    pub fn trampoline(&self) -> &Trampoline {
        &self.trampoline
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn status(&self) -> String {
        self.pool.status()
    }

    /// Check out a connection bound to the task that owns `cx`.
    pub async fn connect(&self, cx: &Cx) -> Outcome<AsyncConnection<M::Connection>, Error> {
        self.connect_in(cx, ContextId::of(cx)).await
    }

    /// Check out a connection bound to `ctx`.
    #[tracing::instrument(level = "debug", skip(self, cx, ctx), fields(ctx = %ctx))]
    pub async fn connect_in(
        &self,
        cx: &Cx,
        ctx: ContextId,
    ) -> Outcome<AsyncConnection<M::Connection>, Error> {
        let pooled = match self.pool.acquire_in(cx, ctx).await {
            Outcome::Ok(pooled) => pooled,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let bound = BoundConnection::from_pool(pooled);
        if self.config.echo {
            bound.listeners().add(EventKind::BeforeExecute, |args| {
                if let Some(sql) = args.statement {
                    tracing::info!(target: "syncbridge::echo", "{sql}");
                }
                Ok(())
            });
        }
        Outcome::Ok(AsyncConnection::from_bound(bound, self.trampoline.clone()))
    }

    /// Check out a connection and begin a transaction on it.
    ///
    /// Finish with [`AsyncConnection::commit`] or
    /// [`AsyncConnection::rollback`], then close the connection.
    pub async fn begin(&self, cx: &Cx) -> Outcome<AsyncConnection<M::Connection>, Error> {
        let conn = match self.connect(cx).await {
            Outcome::Ok(conn) => conn,
            other => return other,
        };
        let isolation = self.config.session.isolation;
        match conn.with_conn(cx, move |c| c.begin(isolation)).await {
            Outcome::Ok(()) => Outcome::Ok(conn),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// A new session using the engine's session defaults.
    pub fn session(&self) -> AsyncSession<M> {
        self.session_with(self.config.session.clone())
    }

    pub fn session_with(&self, config: SessionConfig) -> AsyncSession<M> {
        AsyncSession::new(
            SyncSession::with_config(self.pool.clone(), config),
            self.trampoline.clone(),
        )
    }

    /// A new session bound to `ctx` from the start.
    pub fn session_in(&self, ctx: ContextId) -> AsyncSession<M> {
        AsyncSession::new(
            SyncSession::with_config(self.pool.clone(), self.config.session.clone())
                .bind_context(ctx),
            self.trampoline.clone(),
        )
    }

    /// A registry holding one session per scope, keyed by `scopefunc`.
    pub fn scoped_session<K>(
        &self,
        scopefunc: impl Fn(&Cx) -> K + Send + Sync + 'static,
    ) -> AsyncScopedSession<M, K>
    where
        K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
    {
        let engine = self.clone();
        AsyncScopedSession::new(move || engine.session(), scopefunc)
    }

    /// Close the pool.
    ///
    /// Idle connections are closed and later checkouts fail with a
    /// use-after-dispose error. Connections still checked out keep working
    /// and are closed when released; disposing in that state logs a warning.
    pub async fn dispose(&self, cx: &Cx) -> Outcome<(), Error> {
        self.pool.dispose(cx).await
    }

    pub fn is_disposed(&self) -> bool {
        self.pool.is_closed()
    }
}
