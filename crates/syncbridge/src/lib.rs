//! SyncBridge - drive synchronous data-access code from asynchronous callers.
//!
//! SyncBridge lets a fully synchronous connection and session layer serve
//! asynchronous callers without blocking the scheduler and without rewriting
//! the synchronous code:
//!
//! - A suspension trampoline runs each synchronous call graph in a private
//!   bridge context and suspends it at every blocking call
//! - Async facades expose one async operation per synchronous operation on a
//!   connection, transaction, cursor or session
//! - A context-affine connection pool with FIFO waiters and a no-pooling mode
//! - Scoped sessions keyed by a caller-chosen scope function
//! - Event listeners registered on facades land on the synchronous objects
//!
//! # Quick Start
//!
//! ```ignore
//! use syncbridge::prelude::*;
//!
//! async fn main_example(cx: &Cx, factory: MyDriverFactory) {
//!     let engine =
//!         AsyncEngine::new(AdaptedManager::new(factory), EngineConfig::default()).unwrap();
//!
//!     let conn = engine.connect(cx).await.unwrap();
//!     let tx = conn.begin(cx).await.unwrap();
//!     tx.execute(cx, "INSERT INTO heroes (name) VALUES ($1)", &[Value::from("Rusty-Man")])
//!         .await
//!         .unwrap();
//!     tx.commit(cx).await.unwrap();
//!
//!     let mut cursor = conn.stream(cx, "SELECT name FROM heroes", &[]).await.unwrap();
//!     while let Some(row) = cursor.fetch_one(cx).await.unwrap() {
//!         println!("{:?}", row.get_by_name("name"));
//!     }
//!     cursor.close(cx).await.unwrap();
//!
//!     conn.close(cx).await.unwrap();
//!     engine.dispose(cx).await.unwrap();
//! }
//! ```
//!
//! # Features
//!
//! - **Structured concurrency**: Built on asupersync for cancel-correct operations
//! - **No hidden threads of control**: A bridge context only runs while its
//!   caller is polling it
//! - **Misuse is loud**: Cross-context use, overlapping operations and use after
//!   disposal fail immediately with a bridge error

pub mod adapt;
pub mod config;
pub mod connection;
pub mod engine;
pub mod events;
mod handle;
pub mod session;
pub mod stream;

pub use adapt::{AdaptedConnection, AdaptedManager, AsyncDriver, AsyncDriverFactory, DriverFuture};
pub use config::EngineConfig;
pub use connection::{AsyncConnection, AsyncTransaction};
pub use engine::AsyncEngine;
pub use events::{ProxiesEvents, listen, listen_type, remove_listeners};
pub use session::{AsyncScopedSession, AsyncSession};
pub use stream::AsyncCursor;

// Re-export all public types from sub-crates
pub use syncbridge_core::{
    // asupersync re-exports
    Budget,
    CancelReason,
    // Core types
    ColumnInfo,
    ContextId,
    CursorId,
    Cx,
    Error,
    EventArgs,
    EventKind,
    EventTarget,
    IsolationLevel,
    Listeners,
    Outcome,
    RegionId,
    Result,
    Row,
    SyncConnection,
    TaskId,
    Value,
};
pub use syncbridge_core::error::{
    BridgeErrorKind, ConnectionErrorKind, PoolErrorKind, QueryErrorKind, outcome_into_result,
};
pub use syncbridge_pool::{ConnectionManager, Pool, PoolConfig, PoolKind, PoolStats, PooledConnection};
pub use syncbridge_session::{
    BoundConnection, OrphanedCursors, ScopedRegistry, ScopedResource, SessionConfig, SyncSession,
};
pub use syncbridge_trampoline::{
    RunSync, Trampoline, TrampolineConfig, TrampolineStats, await_only, in_bridge, run_sync,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use syncbridge::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AdaptedManager,
        AsyncConnection,
        AsyncCursor,
        AsyncDriver,
        AsyncDriverFactory,
        AsyncEngine,
        AsyncScopedSession,
        AsyncSession,
        AsyncTransaction,
        ContextId,
        Cx,
        EngineConfig,
        Error,
        EventKind,
        IsolationLevel,
        Outcome,
        PoolConfig,
        PoolKind,
        Result,
        Row,
        SyncConnection,
        Value,
        await_only,
        listen,
        listen_type,
        run_sync,
    };
}
