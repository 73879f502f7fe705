//! Core types and traits for SyncBridge.
//!
//! This crate provides the pieces every other SyncBridge crate shares:
//!
//! - `SyncConnection`, the blocking capability interface the bridge drives
//! - `Error` and `Result`, the error model
//! - `Value` and `Row`, the data moved across the bridge
//! - `ContextId`, scheduling-context identity used for affinity checks
//! - event primitives for instance- and type-level listeners
//! - `Cx` and `Outcome` re-exported from asupersync

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, CancelReason, Cx, Outcome, PanicPayload, RegionId, TaskId};

pub mod connection;
pub mod context;
pub mod error;
pub mod event;
pub mod row;
pub mod value;

pub use connection::{CursorId, IsolationLevel, SyncConnection};
pub use context::ContextId;
pub use error::{
    BridgeError, BridgeErrorKind, ConfigError, ConnectionError, ConnectionErrorKind, Error,
    PoolError, PoolErrorKind, QueryError, QueryErrorKind, Result, outcome_into_result,
};
pub use event::{
    EventArgs, EventKind, EventTarget, Listener, Listeners, class_listeners, dispatch,
};
pub use row::{ColumnInfo, Row};
pub use value::Value;
