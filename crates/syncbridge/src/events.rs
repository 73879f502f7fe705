//! Event registration through asynchronous facades.
//!
//! Facades do not dispatch events themselves. Listeners registered against a
//! facade land on the synchronous object it wraps, and listeners registered
//! against a facade type land on the corresponding synchronous type, so they
//! fire inside the bridge context where the synchronous code runs.
//!
//! ```rust,ignore
//! listen(&conn, EventKind::BeforeExecute, |args| {
//!     tracing::info!(statement = ?args.statement, "about to execute");
//!     Ok(())
//! });
//! listen_type::<AsyncSession<MyManager>>(EventKind::AfterCommit, |_| Ok(()));
//! ```

use crate::connection::AsyncConnection;
use crate::session::AsyncSession;
use syncbridge_core::connection::SyncConnection;
use syncbridge_core::error::Result;
use syncbridge_core::event::{EventArgs, EventKind, EventTarget, Listeners, class_listeners};
use syncbridge_pool::ConnectionManager;
use syncbridge_session::{BoundConnection, SyncSession};

/// A facade whose events are carried by a synchronous object.
pub trait ProxiesEvents {
    /// The synchronous type that dispatches this facade's events.
    type SyncTarget: EventTarget;

    /// Instance listeners of the wrapped synchronous object.
    fn sync_listeners(&self) -> &Listeners;
}

impl<C: SyncConnection> ProxiesEvents for AsyncConnection<C> {
    type SyncTarget = BoundConnection<C>;

    fn sync_listeners(&self) -> &Listeners {
        self.listener_set()
    }
}

impl<M> ProxiesEvents for AsyncSession<M>
where
    M: ConnectionManager,
    M::Connection: SyncConnection,
{
    type SyncTarget = SyncSession<M>;

    fn sync_listeners(&self) -> &Listeners {
        self.listener_set()
    }
}

/// Register a listener on the synchronous object behind `target`.
pub fn listen<T, F>(target: &T, kind: EventKind, f: F)
where
    T: ProxiesEvents,
    F: Fn(&EventArgs<'_>) -> Result<()> + Send + Sync + 'static,
{
    target.sync_listeners().add(kind, f);
}

/// Register a listener for every instance of the synchronous type behind
/// facade type `T`.
pub fn listen_type<T, F>(kind: EventKind, f: F)
where
    T: ProxiesEvents,
    F: Fn(&EventArgs<'_>) -> Result<()> + Send + Sync + 'static,
{
    class_listeners::<T::SyncTarget>().add(kind, f);
}

/// Remove every listener for `kind` on the synchronous object behind
/// `target`.
pub fn remove_listeners<T: ProxiesEvents>(target: &T, kind: EventKind) {
    target.sync_listeners().clear(kind);
}
