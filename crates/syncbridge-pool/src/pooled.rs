//! Connections on loan from a pool.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use syncbridge_core::context::ContextId;
use syncbridge_core::error::{BridgeErrorKind, Error, Result};

/// The pool side of a loan: takes a connection back when the loan ends.
pub(crate) trait Recycle<C>: Send + Sync {
    fn recycle(&self, returned: Returned<C>);
}

/// A connection coming back from a loan.
pub(crate) struct Returned<C> {
    pub(crate) conn: C,
    pub(crate) id: u64,
    pub(crate) created_at: Instant,
    pub(crate) invalidated: bool,
}

/// A connection borrowed from the pool and bound to one scheduling context.
///
/// Access goes through [`get`](Self::get) / [`get_mut`](Self::get_mut), which
/// check the caller's context against the one the connection is bound to.
/// Dropping the handle returns the connection to the pool.
pub struct PooledConnection<C: Send + 'static> {
    conn: Option<C>,
    id: u64,
    created_at: Instant,
    context: ContextId,
    invalidated: bool,
    pool: Arc<dyn Recycle<C>>,
}

impl<C: Send + 'static> PooledConnection<C> {
    pub(crate) fn new(
        conn: C,
        id: u64,
        created_at: Instant,
        context: ContextId,
        pool: Arc<dyn Recycle<C>>,
    ) -> Self {
        Self {
            conn: Some(conn),
            id,
            created_at,
            context,
            invalidated: false,
            pool,
        }
    }

    /// Pool-assigned connection number, unique per pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The scheduling context this connection is bound to.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// How long ago the underlying connection was opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    #[allow(clippy::result_large_err)]
    fn check_context(&self, ctx: ContextId) -> Result<()> {
        if ctx == self.context {
            Ok(())
        } else {
            Err(Error::bridge(
                BridgeErrorKind::CrossContext,
                format!(
                    "connection {} is bound to {} but was used from {}",
                    self.id, self.context, ctx
                ),
            ))
        }
    }

    /// Borrow the connection from scheduling context `ctx`.
    #[allow(clippy::result_large_err)]
    pub fn get(&self, ctx: ContextId) -> Result<&C> {
        self.check_context(ctx)?;
        self.conn
            .as_ref()
            .ok_or_else(|| Error::bridge(BridgeErrorKind::UseAfterDispose, "connection released"))
    }

    /// Mutably borrow the connection from scheduling context `ctx`.
    #[allow(clippy::result_large_err)]
    pub fn get_mut(&mut self, ctx: ContextId) -> Result<&mut C> {
        self.check_context(ctx)?;
        self.conn
            .as_mut()
            .ok_or_else(|| Error::bridge(BridgeErrorKind::UseAfterDispose, "connection released"))
    }

    /// Mark the connection unusable; it is closed instead of reused on release.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    /// Return the connection to the pool now.
    pub fn release(self) {
        drop(self);
    }

    /// Take the connection out of the loan without handing it back.
    pub(crate) fn detach(mut self) -> Option<C> {
        self.conn.take()
    }
}

impl<C: Send + 'static> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.recycle(Returned {
                conn,
                id: self.id,
                created_at: self.created_at,
                invalidated: self.invalidated,
            });
        }
    }
}

impl<C: Send + 'static> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("invalidated", &self.invalidated)
            .finish_non_exhaustive()
    }
}
