//! Synchronous connections over asynchronous drivers.
//!
//! An [`AsyncDriver`] is a natively asynchronous database client. Wrapping it
//! in an [`AdaptedConnection`] gives a [`SyncConnection`] whose every method is
//! a blocking call routed through `await_only`: run inside a bridge context,
//! each call suspends the context while the host scheduler drives the
//! driver's future.
//!
//! [`AdaptedManager`] plugs a driver factory into a [`Pool`](syncbridge_pool::Pool),
//! which is how an [`AsyncEngine`](crate::AsyncEngine) is built over an
//! asynchronous driver.

use asupersync::{Cx, Outcome};
use std::future::Future;
use std::pin::Pin;
use syncbridge_core::connection::{CursorId, IsolationLevel, SyncConnection};
use syncbridge_core::error::{ConnectionError, ConnectionErrorKind, Error, Result};
use syncbridge_core::{Row, Value};
use syncbridge_pool::ConnectionManager;
use syncbridge_trampoline::{await_only, in_bridge};

/// Future returned by driver operations.
///
/// Driver futures own everything they touch, since they are handed to the
/// host scheduler while the calling context is suspended.
pub type DriverFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// A natively asynchronous database connection.
pub trait AsyncDriver: Send + 'static {
    fn execute(&self, sql: String, params: Vec<Value>) -> DriverFuture<u64>;

    fn query(&self, sql: String, params: Vec<Value>) -> DriverFuture<Vec<Row>>;

    fn begin(&self, isolation: IsolationLevel) -> DriverFuture<()>;

    fn commit(&self) -> DriverFuture<()>;

    fn rollback(&self) -> DriverFuture<()>;

    fn open_cursor(&self, sql: String, params: Vec<Value>) -> DriverFuture<CursorId>;

    /// Fetch up to `max_rows` rows; an empty batch means the cursor is
    /// exhausted.
    fn fetch(&self, cursor: CursorId, max_rows: usize) -> DriverFuture<Vec<Row>>;

    fn close_cursor(&self, cursor: CursorId) -> DriverFuture<()>;

    fn ping(&self) -> DriverFuture<()>;

    fn close(&self) -> DriverFuture<()>;
}

/// Opens [`AsyncDriver`] connections.
pub trait AsyncDriverFactory: Send + Sync + 'static {
    type Driver: AsyncDriver;

    fn connect(&self) -> DriverFuture<Self::Driver>;
}

/// A [`SyncConnection`] over an [`AsyncDriver`].
pub struct AdaptedConnection<D: AsyncDriver> {
    driver: D,
    in_tx: bool,
    closed: bool,
}

impl<D: AsyncDriver> std::fmt::Debug for AdaptedConnection<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptedConnection")
            .field("in_tx", &self.in_tx)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<D: AsyncDriver> AdaptedConnection<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            in_tx: false,
            closed: false,
        }
    }

    /// The wrapped driver connection.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[allow(clippy::result_large_err)]
    fn live(&self) -> Result<&D> {
        if self.closed {
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Closed,
                message: "driver connection is closed".to_string(),
                source: None,
            }));
        }
        Ok(&self.driver)
    }
}

impl<D: AsyncDriver> SyncConnection for AdaptedConnection<D> {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        await_only(self.live()?.execute(sql.to_string(), params.to_vec()))
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        await_only(self.live()?.query(sql.to_string(), params.to_vec()))
    }

    fn begin(&mut self, isolation: IsolationLevel) -> Result<()> {
        await_only(self.live()?.begin(isolation))?;
        self.in_tx = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        await_only(self.live()?.commit())?;
        self.in_tx = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        await_only(self.live()?.rollback())?;
        self.in_tx = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_tx
    }

    fn open_cursor(&mut self, sql: &str, params: &[Value]) -> Result<CursorId> {
        await_only(self.live()?.open_cursor(sql.to_string(), params.to_vec()))
    }

    fn fetch(&mut self, cursor: CursorId, max_rows: usize) -> Result<Vec<Row>> {
        await_only(self.live()?.fetch(cursor, max_rows))
    }

    fn close_cursor(&mut self, cursor: CursorId) -> Result<()> {
        await_only(self.live()?.close_cursor(cursor))
    }

    fn ping(&mut self) -> Result<()> {
        await_only(self.live()?.ping())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.in_tx = false;
        await_only(self.driver.close())
    }
}

/// Pool manager for [`AdaptedConnection`]s.
#[derive(Debug, Clone)]
pub struct AdaptedManager<F> {
    factory: F,
}

impl<F: AsyncDriverFactory> AdaptedManager<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }
}

impl<F: AsyncDriverFactory> ConnectionManager for AdaptedManager<F> {
    type Connection = AdaptedConnection<F::Driver>;

    fn connect(&self, _cx: &Cx) -> impl Future<Output = Outcome<Self::Connection, Error>> + Send {
        let connecting = self.factory.connect();
        async move {
            match connecting.await {
                Ok(driver) => Outcome::Ok(AdaptedConnection::new(driver)),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn is_valid(
        &self,
        _cx: &Cx,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = bool> + Send {
        let ping = conn.live().map(|driver| driver.ping());
        async move {
            match ping {
                Ok(ping) => ping.await.is_ok(),
                Err(_) => false,
            }
        }
    }

    fn close(&self, _cx: &Cx, conn: Self::Connection) -> impl Future<Output = ()> + Send {
        async move {
            if conn.closed {
                return;
            }
            let closing = conn.driver.close();
            if let Err(e) = closing.await {
                tracing::debug!(error = %e, "Driver close failed");
            }
        }
    }

    /// Discarded connections are closed with a driver round trip when the
    /// pool releases them from inside a bridge context. Elsewhere the driver
    /// is dropped as is.
    fn close_released(&self, mut conn: Self::Connection) {
        if !in_bridge() {
            tracing::debug!("Dropping driver connection outside a bridge context");
            return;
        }
        if let Err(e) = conn.close() {
            tracing::debug!(error = %e, "Driver close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use syncbridge_core::error::BridgeErrorKind;

    #[derive(Default)]
    struct ReadyDriver {
        calls: Arc<AtomicUsize>,
    }

    impl ReadyDriver {
        fn ready<T: Send + 'static>(&self, value: T) -> DriverFuture<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(std::future::ready(Ok(value)))
        }
    }

    impl AsyncDriver for ReadyDriver {
        fn execute(&self, _sql: String, _params: Vec<Value>) -> DriverFuture<u64> {
            self.ready(3)
        }
        fn query(&self, _sql: String, _params: Vec<Value>) -> DriverFuture<Vec<Row>> {
            self.ready(Vec::new())
        }
        fn begin(&self, _isolation: IsolationLevel) -> DriverFuture<()> {
            self.ready(())
        }
        fn commit(&self) -> DriverFuture<()> {
            self.ready(())
        }
        fn rollback(&self) -> DriverFuture<()> {
            self.ready(())
        }
        fn open_cursor(&self, _sql: String, _params: Vec<Value>) -> DriverFuture<CursorId> {
            self.ready(CursorId::new(1))
        }
        fn fetch(&self, _cursor: CursorId, _max_rows: usize) -> DriverFuture<Vec<Row>> {
            self.ready(Vec::new())
        }
        fn close_cursor(&self, _cursor: CursorId) -> DriverFuture<()> {
            self.ready(())
        }
        fn ping(&self) -> DriverFuture<()> {
            self.ready(())
        }
        fn close(&self) -> DriverFuture<()> {
            self.ready(())
        }
    }

    struct ReadyFactory;

    impl AsyncDriverFactory for ReadyFactory {
        type Driver = ReadyDriver;

        fn connect(&self) -> DriverFuture<ReadyDriver> {
            Box::pin(std::future::ready(Ok(ReadyDriver::default())))
        }
    }

    #[test]
    fn test_manager_close_awaits_driver_outside_bridge() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let manager = AdaptedManager::new(ReadyFactory);

        let driver = ReadyDriver::default();
        let calls = Arc::clone(&driver.calls);
        rt.block_on(manager.close(&cx, AdaptedConnection::new(driver)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Already closed through the sync surface: nothing more to send.
        let driver = ReadyDriver::default();
        let calls = Arc::clone(&driver.calls);
        let mut conn = AdaptedConnection::new(driver);
        conn.closed = true;
        rt.block_on(manager.close(&cx, conn));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_outside_bridge_is_not_in_bridge() {
        let driver = ReadyDriver::default();
        let calls = Arc::clone(&driver.calls);
        let mut conn = AdaptedConnection::new(driver);

        let err = conn.execute("UPDATE t SET n = 1", &[]).unwrap_err();
        assert_eq!(err.bridge_kind(), Some(BridgeErrorKind::NotInBridge));
        // The driver future was built but never driven.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transaction_state_and_close() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let outcome = rt.block_on(syncbridge_trampoline::run_sync(&cx, || {
            let mut conn = AdaptedConnection::new(ReadyDriver::default());
            conn.begin(IsolationLevel::Serializable)?;
            assert!(conn.in_transaction());
            let affected = conn.execute("DELETE FROM t", &[])?;
            conn.commit()?;
            assert!(!conn.in_transaction());
            conn.close()?;
            conn.close()?;
            Ok((affected, conn.is_closed(), conn.ping().is_err()))
        }));

        match outcome {
            Outcome::Ok(result) => assert_eq!(result, (3, true, true)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
