//! Connection pooling for SyncBridge using asupersync.
//!
//! [`Pool`] hands out [`PooledConnection`]s bound to one scheduling context.
//! Acquisition is asynchronous: when the pool is at capacity the acquirer
//! waits in a FIFO queue, and a released connection goes straight to the
//! longest-waiting acquirer.
//!
//! Two policies are available through [`PoolKind`]:
//!
//! - `Queue` keeps up to `max_connections` idle connections for reuse and
//!   allows `max_overflow` extra connections under load
//! - `Null` opens a fresh connection for every acquisition and closes it on
//!   release
//!
//! All pool state changes happen inside one critical section per call and
//! never span a suspension point.

pub mod config;
mod pooled;

pub use config::{PoolConfig, PoolKind, PoolStats};
pub use pooled::PooledConnection;

use asupersync::time::{Sleep, sleep_until, wall_now};
use asupersync::{CancelReason, Cx, Outcome};
use pooled::{Recycle, Returned};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use syncbridge_core::context::ContextId;
use syncbridge_core::error::{BridgeErrorKind, Error, PoolErrorKind, Result};

/// Opens, validates and closes the connections a [`Pool`] manages.
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection.
    fn connect(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Connection, Error>> + Send;

    /// Check an idle connection before it is handed out (when `pre_ping` is on).
    fn is_valid(
        &self,
        _cx: &Cx,
        _conn: &mut Self::Connection,
    ) -> impl Future<Output = bool> + Send {
        async { true }
    }

    /// Close a connection the pool is discarding.
    ///
    /// Used wherever the pool discards from async code: disposal, expired or
    /// failed idle connections found at checkout, and connections opened after
    /// the pool was disposed.
    fn close(&self, _cx: &Cx, conn: Self::Connection) -> impl Future<Output = ()> + Send {
        async move { drop(conn) }
    }

    /// Close a connection discarded on release.
    ///
    /// Release happens when a [`PooledConnection`] is dropped, so this runs
    /// synchronously.
    fn close_released(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Boxed future returned by pool operations.
pub type PoolFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

struct Idle<C> {
    conn: C,
    id: u64,
    created_at: Instant,
}

/// What a waiter is handed when it reaches the front of the queue.
enum Grant<C> {
    /// A connection already counted as checked out.
    Idle(Idle<C>),
    /// Room to open a new connection, already counted as opening.
    Slot,
    /// The pool was disposed.
    Closed,
}

struct Waiter {
    id: u64,
    waker: Waker,
}

struct PoolState<C> {
    idle: VecDeque<Idle<C>>,
    waiters: VecDeque<Waiter>,
    granted: HashMap<u64, Grant<C>>,
    checked_out: usize,
    opening: usize,
    closed: bool,
    next_waiter: u64,
}

impl<C> PoolState<C> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
            granted: HashMap::new(),
            checked_out: 0,
            opening: 0,
            closed: false,
            next_waiter: 0,
        }
    }

    fn total(&self) -> usize {
        self.idle.len() + self.checked_out + self.opening
    }

    fn has_room(&self, capacity: Option<usize>) -> bool {
        capacity.is_none_or(|cap| self.total() < cap)
    }

    /// Give freed capacity to the longest waiter.
    fn grant_slot(&mut self, capacity: Option<usize>) -> Option<Waker> {
        if !self.has_room(capacity) {
            return None;
        }
        let waiter = self.waiters.pop_front()?;
        self.opening += 1;
        self.granted.insert(waiter.id, Grant::Slot);
        Some(waiter.waker)
    }
}

struct Shared<M: ConnectionManager> {
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Connection>>,
    next_conn_id: AtomicU64,
    created: AtomicU64,
    closed: AtomicU64,
}

fn cancel_reason(cx: &Cx) -> CancelReason {
    cx.cancel_reason()
        .unwrap_or_else(|| CancelReason::user("acquire cancelled"))
}

impl<M: ConnectionManager> Shared<M> {
    fn is_expired(&self, created_at: Instant) -> bool {
        self.config.max_lifetime_ms > 0
            && created_at.elapsed() >= Duration::from_millis(self.config.max_lifetime_ms)
    }

    fn close_released(&self, conn: M::Connection, id: u64, reason: &str) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, reason, "Closing connection");
        self.manager.close_released(conn);
    }

    async fn close_conn(&self, cx: &Cx, conn: M::Connection, id: u64, reason: &str) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, reason, "Closing connection");
        self.manager.close(cx, conn).await;
    }

    /// Drop a checked-out connection from the books without recycling it.
    fn retire(&self) {
        let waker = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.checked_out -= 1;
            if state.closed {
                None
            } else {
                state.grant_slot(self.config.capacity())
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn release_slot(&self) {
        let waker = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.opening -= 1;
            if state.closed {
                None
            } else {
                state.grant_slot(self.config.capacity())
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn lend(
        self: &Arc<Self>,
        conn: M::Connection,
        id: u64,
        created_at: Instant,
        ctx: ContextId,
    ) -> PooledConnection<M::Connection> {
        let pool: Arc<dyn Recycle<M::Connection>> = Arc::clone(self) as _;
        PooledConnection::new(conn, id, created_at, ctx, pool)
    }

    #[tracing::instrument(level = "debug", skip(self, cx, ctx), fields(ctx = %ctx))]
    async fn acquire(
        self: Arc<Self>,
        cx: &Cx,
        ctx: ContextId,
    ) -> Outcome<PooledConnection<M::Connection>, Error> {
        let now = cx.timer_driver().map_or_else(wall_now, |driver| driver.now());
        let timeout = Duration::from_millis(self.config.acquire_timeout_ms);
        let deadline =
            now.saturating_add_nanos(u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX));
        loop {
            if cx.is_cancel_requested() {
                return Outcome::Cancelled(cancel_reason(cx));
            }

            let checkout = Checkout {
                shared: &*self,
                cx,
                timer: sleep_until(deadline),
                waiter: None,
            };
            let grant = match checkout.await {
                Outcome::Ok(grant) => grant,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };

            match grant {
                Grant::Closed => {
                    return Outcome::Err(Error::pool(
                        PoolErrorKind::Closed,
                        "pool was disposed while waiting for a connection",
                    ));
                }
                Grant::Idle(Idle {
                    conn,
                    id,
                    created_at,
                }) => {
                    if self.is_expired(created_at) {
                        self.retire();
                        self.close_conn(cx, conn, id, "max lifetime exceeded").await;
                        continue;
                    }
                    let mut pooled = self.lend(conn, id, created_at, ctx);
                    if self.config.pre_ping {
                        let alive = match pooled.get_mut(ctx) {
                            Ok(conn) => self.manager.is_valid(cx, conn).await,
                            Err(_) => false,
                        };
                        if !alive {
                            tracing::debug!(id, "Idle connection failed pre-ping");
                            if let Some(conn) = pooled.detach() {
                                self.retire();
                                self.close_conn(cx, conn, id, "failed pre-ping").await;
                            }
                            continue;
                        }
                    }
                    tracing::debug!(id, "Checked out idle connection");
                    return Outcome::Ok(pooled);
                }
                Grant::Slot => {
                    let reservation = SlotReservation {
                        shared: &*self,
                        armed: true,
                    };
                    let conn = match self.manager.connect(cx).await {
                        Outcome::Ok(conn) => conn,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
                    self.created.fetch_add(1, Ordering::Relaxed);
                    if !reservation.complete() {
                        self.close_conn(cx, conn, id, "pool disposed").await;
                        return Outcome::Err(Error::pool(
                            PoolErrorKind::Closed,
                            "pool was disposed while opening a connection",
                        ));
                    }
                    tracing::debug!(id, "Opened new connection");
                    return Outcome::Ok(self.lend(conn, id, Instant::now(), ctx));
                }
            }
        }
    }
}

impl<M: ConnectionManager> Recycle<M::Connection> for Shared<M> {
    fn recycle(&self, returned: Returned<M::Connection>) {
        let Returned {
            conn,
            id,
            created_at,
            invalidated,
        } = returned;

        let mut state = self.state.lock().expect("lock poisoned");
        state.checked_out -= 1;

        let discard_reason = if state.closed {
            Some("pool disposed")
        } else if invalidated {
            Some("invalidated")
        } else if self.config.kind == PoolKind::Null {
            Some("null pool")
        } else if self.is_expired(created_at) {
            Some("max lifetime exceeded")
        } else {
            None
        };

        let (waker, discard) = if let Some(reason) = discard_reason {
            let waker = if state.closed {
                None
            } else {
                state.grant_slot(self.config.capacity())
            };
            (waker, Some((conn, reason)))
        } else if let Some(waiter) = state.waiters.pop_front() {
            state.checked_out += 1;
            state.granted.insert(
                waiter.id,
                Grant::Idle(Idle {
                    conn,
                    id,
                    created_at,
                }),
            );
            tracing::trace!(id, waiter = waiter.id, "Handing connection to waiter");
            (Some(waiter.waker), None)
        } else if state.idle.len() < self.config.max_connections {
            state.idle.push_back(Idle {
                conn,
                id,
                created_at,
            });
            tracing::trace!(id, "Connection returned to idle set");
            (None, None)
        } else {
            (None, Some((conn, "overflow")))
        };
        drop(state);

        if let Some(waker) = waker {
            waker.wake();
        }
        if let Some((conn, reason)) = discard {
            if invalidated {
                tracing::warn!(id, "Discarding invalidated connection");
            }
            self.close_released(conn, id, reason);
        }
    }
}

/// Capacity reserved for a connection being opened.
struct SlotReservation<'a, M: ConnectionManager> {
    shared: &'a Shared<M>,
    armed: bool,
}

impl<M: ConnectionManager> SlotReservation<'_, M> {
    /// Turn the reservation into a checked-out connection. Returns `false`
    /// if the pool was disposed in the meantime.
    fn complete(mut self) -> bool {
        self.armed = false;
        let mut state = self.shared.state.lock().expect("lock poisoned");
        state.opening -= 1;
        if state.closed {
            return false;
        }
        state.checked_out += 1;
        true
    }
}

impl<M: ConnectionManager> Drop for SlotReservation<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_slot();
        }
    }
}

/// Waits for a connection, a slot, or disposal.
struct Checkout<'a, M: ConnectionManager> {
    shared: &'a Shared<M>,
    cx: &'a Cx,
    timer: Sleep,
    waiter: Option<u64>,
}

impl<M: ConnectionManager> Future for Checkout<'_, M> {
    type Output = Outcome<Grant<M::Connection>, Error>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let shared = this.shared;
        let mut state = shared.state.lock().expect("lock poisoned");

        let id = if let Some(id) = this.waiter {
            if let Some(grant) = state.granted.remove(&id) {
                this.waiter = None;
                return Poll::Ready(Outcome::Ok(grant));
            }
            if this.cx.is_cancel_requested() {
                state.waiters.retain(|w| w.id != id);
                this.waiter = None;
                drop(state);
                return Poll::Ready(Outcome::Cancelled(cancel_reason(this.cx)));
            }
            if let Some(waiter) = state.waiters.iter_mut().find(|w| w.id == id) {
                if !waiter.waker.will_wake(task_cx.waker()) {
                    waiter.waker = task_cx.waker().clone();
                }
            }
            id
        } else {
            if state.closed {
                return Poll::Ready(Outcome::Err(Error::bridge(
                    BridgeErrorKind::UseAfterDispose,
                    "acquire called on a disposed pool",
                )));
            }

            if state.waiters.is_empty() {
                if shared.config.kind == PoolKind::Queue {
                    if let Some(idle) = state.idle.pop_front() {
                        state.checked_out += 1;
                        return Poll::Ready(Outcome::Ok(Grant::Idle(idle)));
                    }
                }
                if state.has_room(shared.config.capacity()) {
                    state.opening += 1;
                    return Poll::Ready(Outcome::Ok(Grant::Slot));
                }
            }

            let id = state.next_waiter;
            state.next_waiter += 1;
            state.waiters.push_back(Waiter {
                id,
                waker: task_cx.waker().clone(),
            });
            this.waiter = Some(id);
            tracing::trace!(waiter = id, queued = state.waiters.len(), "Waiting for a connection");
            id
        };
        drop(state);

        // The timer wakes this task at the deadline even if nothing is released.
        if Pin::new(&mut this.timer).poll(task_cx).is_pending() {
            return Poll::Pending;
        }

        let mut state = shared.state.lock().expect("lock poisoned");
        this.waiter = None;
        if let Some(grant) = state.granted.remove(&id) {
            return Poll::Ready(Outcome::Ok(grant));
        }
        state.waiters.retain(|w| w.id != id);
        drop(state);
        tracing::debug!(waiter = id, "Timed out waiting for a connection");
        Poll::Ready(Outcome::Err(Error::pool(
            PoolErrorKind::Timeout,
            format!(
                "timed out after {}ms waiting for a connection",
                shared.config.acquire_timeout_ms
            ),
        )))
    }
}

impl<M: ConnectionManager> Drop for Checkout<'_, M> {
    fn drop(&mut self) {
        let Some(id) = self.waiter.take() else {
            return;
        };
        let grant = {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            state.waiters.retain(|w| w.id != id);
            state.granted.remove(&id)
        };
        match grant {
            Some(Grant::Idle(idle)) => self.shared.recycle(Returned {
                conn: idle.conn,
                id: idle.id,
                created_at: idle.created_at,
                invalidated: false,
            }),
            Some(Grant::Slot) => self.shared.release_slot(),
            Some(Grant::Closed) | None => {}
        }
    }
}

/// An asynchronous connection pool.
///
/// Cloning is cheap; clones share the same connections.
pub struct Pool<M: ConnectionManager> {
    shared: Arc<Shared<M>>,
}

impl<M: ConnectionManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ConnectionManager> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M: ConnectionManager> Pool<M> {
    /// Create a new connection pool.
    #[allow(clippy::result_large_err)]
    pub fn new(manager: M, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                manager,
                config,
                state: Mutex::new(PoolState::new()),
                next_conn_id: AtomicU64::new(0),
                created: AtomicU64::new(0),
                closed: AtomicU64::new(0),
            }),
        })
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Acquire a connection bound to the task that owns `cx`.
    pub fn acquire<'a>(
        &'a self,
        cx: &'a Cx,
    ) -> PoolFuture<'a, Outcome<PooledConnection<M::Connection>, Error>> {
        self.acquire_in(cx, ContextId::of(cx))
    }

    /// Acquire a connection bound to scheduling context `ctx`.
    ///
    /// Resolves immediately when an idle connection or spare capacity exists
    /// and nobody is queued; otherwise waits in FIFO order. Fails with a
    /// `Timeout` pool error once `acquire_timeout_ms` has elapsed.
    pub fn acquire_in<'a>(
        &'a self,
        cx: &'a Cx,
        ctx: ContextId,
    ) -> PoolFuture<'a, Outcome<PooledConnection<M::Connection>, Error>> {
        Box::pin(Arc::clone(&self.shared).acquire(cx, ctx))
    }

    /// Close the pool.
    ///
    /// Idle connections are closed, queued acquirers fail with a `Closed` pool
    /// error, and later acquisitions fail with a use-after-dispose error.
    /// Connections still checked out stay usable and are closed when
    /// released; their presence is logged as a warning. Disposing twice is a
    /// no-op.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn dispose(&self, cx: &Cx) -> Outcome<(), Error> {
        let (idle, wakers, checked_out) = {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if state.closed {
                tracing::trace!("Pool already disposed");
                return Outcome::Ok(());
            }
            state.closed = true;
            let idle: Vec<Idle<M::Connection>> = state.idle.drain(..).collect();
            let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
            let mut wakers = Vec::with_capacity(waiters.len());
            for waiter in waiters {
                state.granted.insert(waiter.id, Grant::Closed);
                wakers.push(waiter.waker);
            }
            (idle, wakers, state.checked_out)
        };

        for waker in wakers {
            waker.wake();
        }
        let closed_idle = idle.len();
        for Idle { conn, id, .. } in idle {
            self.shared.close_conn(cx, conn, id, "pool disposed").await;
        }
        if checked_out > 0 {
            tracing::warn!(
                checked_out,
                "Pool disposed while connections are still checked out; they will be closed on release"
            );
        }
        tracing::debug!(closed_idle, task = ?cx.task_id(), "Pool disposed");
        Outcome::Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().expect("lock poisoned").closed
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock().expect("lock poisoned");
        let total = state.total();
        let overflow = match self.shared.config.kind {
            PoolKind::Queue => total.saturating_sub(self.shared.config.max_connections),
            PoolKind::Null => 0,
        };
        PoolStats {
            total_connections: total,
            idle_connections: state.idle.len(),
            active_connections: state.checked_out,
            pending_requests: state.waiters.len(),
            overflow_connections: overflow,
            connections_created: self.shared.created.load(Ordering::Relaxed),
            connections_closed: self.shared.closed.load(Ordering::Relaxed),
        }
    }

    /// One-line summary of pool occupancy.
    pub fn status(&self) -> String {
        let stats = self.stats();
        match self.shared.config.kind {
            PoolKind::Queue => format!(
                "Pool size: {}  Connections in pool: {} Current Overflow: {} Current Checked out connections: {}",
                self.shared.config.max_connections,
                stats.idle_connections,
                stats.overflow_connections,
                stats.active_connections
            ),
            PoolKind::Null => format!(
                "NullPool  Current Checked out connections: {}",
                stats.active_connections
            ),
        }
    }

    /// Check if the pool is at capacity.
    pub fn at_capacity(&self) -> bool {
        let state = self.shared.state.lock().expect("lock poisoned");
        !state.has_room(self.shared.config.capacity())
    }
}
