//! Suspension trampoline for SyncBridge.
//!
//! A [`Trampoline`] runs a synchronous call graph inside a private bridge
//! context. Whenever that code calls [`await_only`], the bridge context
//! suspends and the returned [`RunSync`] future hands the request to the host
//! scheduler. When the request finishes, its result is injected back at the
//! exact point the call graph stopped.
//!
//! Each bridge context borrows a worker thread from an asupersync
//! [`BlockingPool`] and uses it purely as a stack. Workers go back to the pool
//! when their call graph returns, so a steady stream of operations reuses a
//! handful of threads. Control alternates strictly between host and context,
//! so at any moment only one of them runs. A call graph that never blocks
//! completes on the first poll with no suspension at all.
//!
//! # Example
//!
//! ```rust,ignore
//! use syncbridge_trampoline::{await_only, run_sync};
//!
//! let total = run_sync(&cx, move || {
//!     let a = await_only(driver.fetch_count("a"))?;
//!     let b = await_only(driver.fetch_count("b"))?;
//!     Ok(a + b)
//! })
//! .await;
//! ```
//!
//! # Cancellation
//!
//! If the awaiting task is cancelled while the context is suspended, the
//! pending `await_only` returns `Error::Cancelled` inside the call graph so it
//! can run cleanup. A context that is running when cancellation arrives sees
//! the error at its next suspension. Cancellation is injected once; cleanup
//! code may keep suspending afterwards.

pub mod config;
mod worker;

pub use config::TrampolineConfig;
pub use worker::{await_only, in_bridge};

use asupersync::runtime::{BlockingPool, BlockingPoolOptions};
use asupersync::{CancelReason, Cx, Outcome, PanicPayload};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;
use syncbridge_core::error::{BridgeErrorKind, Error, Result};
use worker::{IoRequest, Payload, Resume, SuspensionSlot, WorkerLink, Yield};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    contexts: AtomicU64,
    pub(crate) suspensions: AtomicU64,
    completions: AtomicU64,
    cancellations: AtomicU64,
    /// Contexts holding a worker, including detached ones
    live: AtomicUsize,
}

/// Snapshot of trampoline activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrampolineStats {
    /// Bridge contexts started
    pub contexts: u64,
    /// Suspend/resume cycles serviced
    pub suspensions: u64,
    /// Call graphs that ran to completion (including errors and panics)
    pub completions: u64,
    /// Cancellations injected into suspended call graphs
    pub cancellations: u64,
    /// Bridge contexts currently holding a worker
    pub live: usize,
    /// Worker threads currently alive, busy or idle
    pub threads: usize,
}

/// Runs synchronous call graphs under the host scheduler.
///
/// Cloning is cheap; clones share worker threads and statistics.
#[derive(Clone)]
pub struct Trampoline {
    config: Arc<TrampolineConfig>,
    counters: Arc<Counters>,
    workers: Arc<BlockingPool>,
}

impl Default for Trampoline {
    fn default() -> Self {
        Self::new(TrampolineConfig::default())
    }
}

impl std::fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trampoline")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Trampoline {
    pub fn new(config: TrampolineConfig) -> Self {
        let max_threads = config.max_threads.max(1);
        let workers = BlockingPool::with_config(
            config.min_threads.min(max_threads),
            max_threads,
            BlockingPoolOptions {
                idle_timeout: Duration::from_millis(config.idle_timeout_ms),
                thread_name_prefix: config.thread_name.clone(),
                ..BlockingPoolOptions::default()
            },
        );
        Self {
            config: Arc::new(config),
            counters: Arc::new(Counters::default()),
            workers: Arc::new(workers),
        }
    }

    pub fn config(&self) -> &TrampolineConfig {
        &self.config
    }

    pub fn stats(&self) -> TrampolineStats {
        TrampolineStats {
            contexts: self.counters.contexts.load(Ordering::Relaxed),
            suspensions: self.counters.suspensions.load(Ordering::Relaxed),
            completions: self.counters.completions.load(Ordering::Relaxed),
            cancellations: self.counters.cancellations.load(Ordering::Relaxed),
            live: self.counters.live.load(Ordering::Acquire),
            threads: self.workers.active_threads(),
        }
    }

    /// Run `f` in a fresh bridge context.
    ///
    /// Fails with `Bridge(Spawn)` when `max_threads` contexts are already
    /// live, since a context queued behind suspended ones could never start.
    ///
    /// The returned future resolves to `f`'s result. Errors returned by `f`
    /// come back unchanged as `Outcome::Err`, a panic becomes
    /// `Outcome::Panicked`, and `Error::Cancelled` produced by an injected
    /// cancellation becomes `Outcome::Cancelled`.
    pub fn run<T, F>(&self, cx: &Cx, f: F) -> RunSync<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        RunSync {
            cx: cx.clone(),
            counters: Arc::clone(&self.counters),
            workers: Arc::clone(&self.workers),
            max_contexts: self.config.max_threads.max(1),
            state: State::Pending(Box::new(move || Box::new(f()) as Payload)),
            cancel_delivered: false,
            _output: PhantomData,
        }
    }
}

/// The process-wide trampoline behind [`run_sync`].
pub fn global() -> &'static Trampoline {
    static GLOBAL: OnceLock<Trampoline> = OnceLock::new();
    GLOBAL.get_or_init(Trampoline::default)
}

/// Run a synchronous callable as one async operation on the global
/// trampoline.
pub fn run_sync<T, F>(cx: &Cx, f: F) -> RunSync<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    global().run(cx, f)
}

struct Channels {
    to_worker: Sender<Resume>,
    from_worker: Receiver<Yield>,
}

enum State {
    Pending(Box<dyn FnOnce() -> Payload + Send>),
    Running(Channels),
    Suspended(Channels, IoRequest),
    Done,
}

/// Future returned by [`Trampoline::run`] and [`run_sync`].
///
/// Dropping it while the call graph is suspended injects cancellation and
/// detaches the context: its cleanup runs to completion on its own, and any
/// further `await_only` there fails with `Bridge(Detached)`.
#[must_use = "futures do nothing unless polled"]
pub struct RunSync<T> {
    cx: Cx,
    counters: Arc<Counters>,
    workers: Arc<BlockingPool>,
    max_contexts: usize,
    state: State,
    cancel_delivered: bool,
    _output: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for RunSync<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Pending(_) => "pending",
            State::Running(_) => "running",
            State::Suspended(..) => "suspended",
            State::Done => "done",
        };
        f.debug_struct("RunSync")
            .field("state", &state)
            .field("cancel_delivered", &self.cancel_delivered)
            .finish()
    }
}

impl<T: Send + 'static> RunSync<T> {
    #[allow(clippy::result_large_err)]
    fn start(&self, body: Box<dyn FnOnce() -> Payload + Send>) -> Result<Channels> {
        let (to_host, from_worker) = mpsc::channel::<Yield>();
        let (to_worker, from_host) = mpsc::channel::<Resume>();
        let counters = Arc::clone(&self.counters);

        if self.workers.is_shutdown() {
            return Err(Error::bridge(
                BridgeErrorKind::Spawn,
                "failed to start bridge context: worker pool is shut down",
            ));
        }
        let max = self.max_contexts;
        let reserved = self
            .counters
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(Error::bridge(
                BridgeErrorKind::Spawn,
                format!("failed to start bridge context: all {max} workers are in use"),
            ));
        }
        let live = Arc::clone(&self.counters);
        self.workers.spawn(move || {
            worker::install(WorkerLink {
                to_host,
                from_host,
                slot: SuspensionSlot::default(),
                detached: std::cell::Cell::new(false),
                counters,
            });
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body));
            // Released before the host hears of completion, so a follow-up
            // context never sees this one as still live.
            live.live.fetch_sub(1, Ordering::AcqRel);
            if let Some(link) = worker::uninstall() {
                let _ = link.to_host.send(Yield::Complete(result));
            }
        });

        self.counters.contexts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            threads = self.workers.active_threads(),
            "Bridge context started"
        );
        Ok(Channels {
            to_worker,
            from_worker,
        })
    }

    fn cancel_pending(&self) -> bool {
        !self.cancel_delivered && self.cx.is_cancel_requested()
    }

    fn inject_cancel(&mut self, channels: &Channels) {
        self.cancel_delivered = true;
        self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Injecting cancellation into bridge context");
        let _ = channels.to_worker.send(Resume::Cancelled);
    }

    fn finish(&self, result: std::thread::Result<Payload>) -> Outcome<T, Error> {
        self.counters.completions.fetch_add(1, Ordering::Relaxed);
        let payload = match result {
            Ok(payload) => payload,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::warn!(%message, "Synchronous call graph panicked");
                return Outcome::Panicked(PanicPayload::new(message));
            }
        };
        match payload.downcast::<Result<T>>() {
            Ok(result) => match *result {
                Ok(value) => Outcome::Ok(value),
                Err(Error::Cancelled) if self.cancel_delivered => Outcome::Cancelled(
                    self.cx
                        .cancel_reason()
                        .unwrap_or_else(|| CancelReason::user("cancelled while suspended")),
                ),
                Err(e) => Outcome::Err(e),
            },
            Err(_) => Outcome::Err(Error::Custom(
                "bridge context returned a value of the wrong type".to_string(),
            )),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "bridge context panicked".to_string()
    }
}

impl<T: Send + 'static> Future for RunSync<T> {
    type Output = Outcome<T, Error>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.state, State::Done) {
                State::Pending(body) => match this.start(body) {
                    Ok(channels) => this.state = State::Running(channels),
                    Err(e) => return Poll::Ready(Outcome::Err(e)),
                },
                State::Running(channels) => match channels.from_worker.recv() {
                    Ok(Yield::Suspend(request)) => {
                        tracing::trace!("Bridge context suspended");
                        if this.cancel_pending() {
                            drop(request);
                            this.inject_cancel(&channels);
                            this.state = State::Running(channels);
                        } else {
                            this.state = State::Suspended(channels, request);
                        }
                    }
                    Ok(Yield::Complete(result)) => {
                        tracing::debug!("Bridge context completed");
                        return Poll::Ready(this.finish(result));
                    }
                    Err(_) => {
                        return Poll::Ready(Outcome::Panicked(PanicPayload::new(
                            "bridge context exited without completing",
                        )));
                    }
                },
                State::Suspended(channels, mut request) => {
                    if this.cancel_pending() {
                        drop(request);
                        this.inject_cancel(&channels);
                        this.state = State::Running(channels);
                        continue;
                    }
                    match request.as_mut().poll(task_cx) {
                        Poll::Ready(value) => {
                            tracing::trace!("Resuming bridge context");
                            let _ = channels.to_worker.send(Resume::Value(value));
                            this.state = State::Running(channels);
                        }
                        Poll::Pending => {
                            this.state = State::Suspended(channels, request);
                            return Poll::Pending;
                        }
                    }
                }
                State::Done => panic!("RunSync polled after completion"),
            }
        }
    }
}

impl<T> Drop for RunSync<T> {
    fn drop(&mut self) {
        if let State::Suspended(channels, request) = std::mem::replace(&mut self.state, State::Done)
        {
            drop(request);
            if !self.cancel_delivered {
                self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
            }
            tracing::debug!("Awaiting future dropped; detaching bridge context");
            let _ = channels.to_worker.send(Resume::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use asupersync::types::CancelKind;
    use std::sync::Mutex;
    use std::task::Waker;
    use std::time::Duration;
    use syncbridge_core::error::QueryErrorKind;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    /// Completes on the second poll so every await really suspends.
    struct YieldOnce<T> {
        value: Option<T>,
        yielded: bool,
    }

    fn yield_once<T: Unpin>(value: T) -> YieldOnce<T> {
        YieldOnce {
            value: Some(value),
            yielded: false,
        }
    }

    impl<T: Unpin> Future for YieldOnce<T> {
        type Output = T;

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
            if self.yielded {
                Poll::Ready(self.value.take().expect("polled after completion"))
            } else {
                self.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let mut task_cx = Context::from_waker(Waker::noop());
        Pin::new(fut).poll(&mut task_cx)
    }

    #[test]
    fn test_plain_call_graph_never_suspends() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let trampoline = Trampoline::default();

        let mut fut = trampoline.run(&cx, || Ok(40 + 2));
        let first = poll_once(&mut fut);
        assert!(matches!(first, Poll::Ready(Outcome::Ok(42))));

        let direct = rt.block_on(trampoline.run(&cx, || {
            Err::<(), _>(Error::query(QueryErrorKind::Syntax, Some("SELEC"), "bad"))
        }));
        match direct {
            Outcome::Err(e) => assert_eq!(e.sql(), Some("SELEC")),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let stats = trampoline.stats();
        assert_eq!(stats.contexts, 2);
        assert_eq!(stats.suspensions, 0);
        assert_eq!(stats.completions, 2);
    }

    #[test]
    fn test_each_blocking_call_suspends_once() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let trampoline = Trampoline::default();

        let total = rt.block_on(async {
            unwrap_outcome(
                trampoline
                    .run(&cx, || {
                        assert!(in_bridge());
                        let mut sum = 0;
                        for n in 1..=3 {
                            sum += await_only(async move { Ok(yield_once(n).await) })?;
                        }
                        Ok(sum)
                    })
                    .await,
            )
        });

        assert_eq!(total, 6);
        assert_eq!(trampoline.stats().suspensions, 3);
        assert!(!in_bridge());
    }

    #[test]
    fn test_domain_error_after_blocking_call_propagates_unchanged() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let trampoline = Trampoline::default();
        let seen = Arc::new(Mutex::new(None));

        let seen_in = Arc::clone(&seen);
        let outcome = rt.block_on(trampoline.run(&cx, move || {
            let fetched = await_only(async { Ok(yield_once("row").await) })?;
            *seen_in.lock().unwrap() = Some(fetched);
            Err::<(), _>(Error::query(
                QueryErrorKind::Constraint,
                Some("INSERT INTO t VALUES (1)"),
                "duplicate key",
            ))
        }));

        assert_eq!(*seen.lock().unwrap(), Some("row"));
        match outcome {
            Outcome::Err(Error::Query(q)) => {
                assert_eq!(q.kind, QueryErrorKind::Constraint);
                assert_eq!(q.message, "duplicate key");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(trampoline.stats().suspensions, 1);
    }

    #[test]
    fn test_injected_io_error_surfaces_at_call_site() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let outcome = rt.block_on(run_sync(&cx, || {
            let result: Result<u8> = await_only(async { Err(Error::Timeout) });
            assert!(matches!(result, Err(Error::Timeout)));
            result
        }));
        assert!(matches!(outcome, Outcome::Err(Error::Timeout)));
    }

    #[test]
    fn test_panic_becomes_panicked_outcome() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let outcome = rt.block_on(run_sync(&cx, || -> Result<()> { panic!("boom") }));
        match outcome {
            Outcome::Panicked(p) => assert_eq!(p.message(), "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_cancellation_injected_at_suspension_point() {
        let cx = Cx::for_testing();
        let trampoline = Trampoline::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_in = Arc::clone(&log);
        let mut fut = trampoline.run(&cx, move || {
            let blocked: Result<()> = await_only(std::future::pending());
            log_in
                .lock()
                .unwrap()
                .push(format!("blocked: cancelled={}", matches!(blocked, Err(Error::Cancelled))));
            // Cleanup may still perform I/O after cancellation.
            await_only(async { Ok(yield_once(()).await) })?;
            log_in.lock().unwrap().push("cleanup done".to_string());
            blocked
        });

        assert!(poll_once(&mut fut).is_pending());
        assert!(poll_once(&mut fut).is_pending());
        assert!(log.lock().unwrap().is_empty());

        cx.cancel_with(CancelKind::User, Some("stop"));
        let outcome = loop {
            if let Poll::Ready(out) = poll_once(&mut fut) {
                break out;
            }
        };

        assert!(matches!(outcome, Outcome::Cancelled(_)));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["blocked: cancelled=true", "cleanup done"]
        );
        let stats = trampoline.stats();
        assert_eq!(stats.cancellations, 1);
        assert_eq!(stats.suspensions, 2);
    }

    #[test]
    fn test_cancelled_before_first_suspension() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        cx.cancel_with(CancelKind::Timeout, None);

        let outcome = rt.block_on(run_sync(&cx, || {
            await_only(async { Ok(yield_once(1).await) })
        }));
        assert!(matches!(outcome, Outcome::Cancelled(_)));
    }

    #[test]
    fn test_dropping_future_detaches_context() {
        let cx = Cx::for_testing();
        let (report_tx, report_rx) = mpsc::channel();

        let mut fut = run_sync(&cx, move || {
            let first: Result<()> = await_only(std::future::pending());
            let second: Result<()> = await_only(async { Ok(()) });
            let _ = report_tx.send((
                matches!(first, Err(Error::Cancelled)),
                second.err().and_then(|e| e.bridge_kind()),
            ));
            Ok(())
        });
        assert!(poll_once(&mut fut).is_pending());
        drop(fut);

        let (first_cancelled, second_kind) = report_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("detached context reports back");
        assert!(first_cancelled);
        assert_eq!(second_kind, Some(BridgeErrorKind::Detached));
    }

    #[test]
    fn test_contexts_use_configured_name() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let trampoline = Trampoline::new(TrampolineConfig::new().thread_name("bridge-test"));

        let name = unwrap_outcome(rt.block_on(trampoline.run(&cx, || {
            Ok(std::thread::current().name().map(str::to_string))
        })));
        assert!(name.is_some_and(|n| n.starts_with("bridge-test")));
    }

    #[test]
    fn test_saturated_trampoline_refuses_new_contexts() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let trampoline = Trampoline::new(TrampolineConfig::new().max_threads(1));

        let mut first = trampoline.run(&cx, || await_only(async { Ok(yield_once(7).await) }));
        let mut task_cx = Context::from_waker(Waker::noop());
        assert!(Pin::new(&mut first).poll(&mut task_cx).is_pending());
        assert_eq!(trampoline.stats().live, 1);

        match rt.block_on(trampoline.run(&cx, || Ok(()))) {
            Outcome::Err(e) => assert_eq!(e.bridge_kind(), Some(BridgeErrorKind::Spawn)),
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert_eq!(unwrap_outcome(rt.block_on(first)), 7);
        assert_eq!(trampoline.stats().live, 0);
        unwrap_outcome(rt.block_on(trampoline.run(&cx, || Ok(()))));
    }

    #[test]
    fn test_sequential_contexts_reuse_a_worker_thread() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let trampoline = Trampoline::new(TrampolineConfig::new().min_threads(1));

        let first = unwrap_outcome(rt.block_on(trampoline.run(&cx, || {
            await_only(async { Ok(yield_once(()).await) })?;
            Ok(std::thread::current().id())
        })));
        // Let the worker settle back into the pool.
        std::thread::sleep(Duration::from_millis(50));
        let second =
            unwrap_outcome(rt.block_on(trampoline.run(&cx, || Ok(std::thread::current().id()))));

        assert_eq!(first, second);
        assert_ne!(first, std::thread::current().id());
        let stats = trampoline.stats();
        assert_eq!(stats.contexts, 2);
        assert_eq!(stats.threads, 1);
    }
}
