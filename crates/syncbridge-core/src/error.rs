//! Error types for SyncBridge operations.

use asupersync::Outcome;
use std::fmt;

/// The primary error type for all SyncBridge operations.
#[derive(Debug)]
pub enum Error {
    /// The connection was used after it was closed
    Connection(ConnectionError),
    /// Query execution errors raised by the wrapped synchronous layer
    Query(QueryError),
    /// Pool errors
    Pool(PoolError),
    /// Misuse of the bridge itself (cross-context use, reentrancy, disposal)
    Bridge(BridgeError),
    /// Configuration errors
    Config(ConfigError),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Connection was already closed
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Unknown or already-closed server-side cursor
    Cursor,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Connection checkout timeout
    Timeout,
    /// Pool is closed
    Closed,
}

/// A programming error detected by the bridge.
///
/// These are never retried and never repaired silently.
#[derive(Debug)]
pub struct BridgeError {
    pub kind: BridgeErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeErrorKind {
    /// A resource bound to one scheduling context was used from another
    CrossContext,
    /// A facade was used while another operation on it was in flight
    ConcurrentUse,
    /// A second suspension was requested while one was outstanding
    Reentrancy,
    /// The facade or pool was already disposed
    UseAfterDispose,
    /// `await_only` was called outside of a bridge context
    NotInBridge,
    /// The private execution context could not be created
    Spawn,
    /// The awaiting caller went away; no further suspensions can be serviced
    Detached,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a bridge misuse error.
    pub fn bridge(kind: BridgeErrorKind, message: impl Into<String>) -> Self {
        Error::Bridge(BridgeError {
            kind,
            message: message.into(),
        })
    }

    /// Build a pool error without a source.
    pub fn pool(kind: PoolErrorKind, message: impl Into<String>) -> Self {
        Error::Pool(PoolError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Build a query error without a source.
    pub fn query(kind: QueryErrorKind, sql: Option<&str>, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            sql: sql.map(str::to_string),
            message: message.into(),
            source: None,
        })
    }

    /// Is this a retryable error (deadlock, serialization, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization
            ),
            Error::Pool(p) => p.kind == PoolErrorKind::Timeout,
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Is this one of the fatal bridge programming errors?
    pub fn is_fatal_misuse(&self) -> bool {
        matches!(
            self,
            Error::Bridge(BridgeError {
                kind: BridgeErrorKind::CrossContext
                    | BridgeErrorKind::ConcurrentUse
                    | BridgeErrorKind::Reentrancy
                    | BridgeErrorKind::UseAfterDispose,
                ..
            })
        )
    }

    /// The bridge error kind, if this is a bridge error.
    pub fn bridge_kind(&self) -> Option<BridgeErrorKind> {
        match self {
            Error::Bridge(b) => Some(b.kind),
            _ => None,
        }
    }

    /// The pool error kind, if this is a pool error.
    pub fn pool_kind(&self) -> Option<PoolErrorKind> {
        match self {
            Error::Pool(p) => Some(p.kind),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Bridge(e) => write!(f, "Bridge error ({}): {}", e.kind, e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for BridgeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeErrorKind::CrossContext => "cross-context use",
            BridgeErrorKind::ConcurrentUse => "concurrent use",
            BridgeErrorKind::Reentrancy => "reentrant suspension",
            BridgeErrorKind::UseAfterDispose => "use after dispose",
            BridgeErrorKind::NotInBridge => "not in bridge",
            BridgeErrorKind::Spawn => "spawn",
            BridgeErrorKind::Detached => "detached",
        };
        f.write_str(name)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<BridgeError> for Error {
    fn from(err: BridgeError) -> Self {
        Error::Bridge(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for SyncBridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Collapse an asupersync `Outcome` into a plain `Result`.
///
/// Synchronous code has no notion of cancellation or panics as values, so
/// `Cancelled` becomes [`Error::Cancelled`] and `Panicked` becomes a custom
/// error carrying the panic message.
#[allow(clippy::result_large_err)]
pub fn outcome_into_result<T>(outcome: Outcome<T, Error>) -> Result<T> {
    match outcome {
        Outcome::Ok(v) => Ok(v),
        Outcome::Err(e) => Err(e),
        Outcome::Cancelled(_) => Err(Error::Cancelled),
        Outcome::Panicked(p) => Err(Error::Custom(format!("panicked: {p:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_flags() {
        let deadlock = Error::query(QueryErrorKind::Deadlock, None, "deadlock detected");
        let serialization = Error::query(QueryErrorKind::Serialization, None, "could not serialize");
        let constraint = Error::query(QueryErrorKind::Constraint, None, "duplicate key");
        let timeout = Error::pool(PoolErrorKind::Timeout, "timed out");
        let closed = Error::pool(PoolErrorKind::Closed, "closed");

        assert!(deadlock.is_retryable());
        assert!(serialization.is_retryable());
        assert!(!constraint.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!closed.is_retryable());
        assert!(Error::Timeout.is_retryable());

        let gone = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Closed,
            message: "connection closed".to_string(),
            source: None,
        });
        assert!(!gone.is_retryable());
        assert_eq!(gone.to_string(), "Connection error: connection closed");
    }

    #[test]
    fn bridge_errors_are_fatal_misuse() {
        let cross = Error::bridge(BridgeErrorKind::CrossContext, "bound to ctx-1");
        assert!(cross.is_fatal_misuse());
        assert_eq!(cross.bridge_kind(), Some(BridgeErrorKind::CrossContext));
        assert!(!cross.is_retryable());

        let outside = Error::bridge(BridgeErrorKind::NotInBridge, "no context");
        assert!(!outside.is_fatal_misuse());

        assert_eq!(
            cross.to_string(),
            "Bridge error (cross-context use): bound to ctx-1"
        );
    }

    #[test]
    fn query_error_keeps_sql() {
        let err = Error::query(QueryErrorKind::Syntax, Some("SELEC 1"), "syntax error");
        assert_eq!(err.sql(), Some("SELEC 1"));
        assert_eq!(err.to_string(), "Query error: syntax error");
    }

    #[test]
    fn outcome_conversions() {
        assert_eq!(outcome_into_result(Outcome::Ok(3)).ok(), Some(3));
        assert!(matches!(
            outcome_into_result::<()>(Outcome::Err(Error::Timeout)),
            Err(Error::Timeout)
        ));
        assert!(matches!(
            outcome_into_result::<()>(Outcome::Cancelled(asupersync::CancelReason::user("stop"))),
            Err(Error::Cancelled)
        ));
    }
}
