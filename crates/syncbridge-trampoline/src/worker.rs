//! The synchronous side of a bridge context.
//!
//! Code running inside a bridge context reaches the host scheduler only
//! through [`await_only`]. Each call hands one future to the host, blocks the
//! context until the host resumes it, and returns whatever the host injected.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, Sender};
use syncbridge_core::error::{BridgeErrorKind, Error, Result};

use crate::Counters;

/// Type-erased value travelling between the two sides.
pub(crate) type Payload = Box<dyn Any + Send>;

/// An I/O request handed to the host scheduler.
pub(crate) type IoRequest = Pin<Box<dyn Future<Output = Payload> + Send>>;

/// Messages from a bridge context to its host.
pub(crate) enum Yield {
    /// The call graph is blocked on this request.
    Suspend(IoRequest),
    /// The call graph returned (or panicked).
    Complete(std::thread::Result<Payload>),
}

/// Messages from the host back into a suspended bridge context.
pub(crate) enum Resume {
    /// The request finished with this value.
    Value(Payload),
    /// The awaiting task was cancelled.
    Cancelled,
}

/// The single in-flight suspension slot of a bridge context.
#[derive(Debug, Default)]
pub(crate) struct SuspensionSlot {
    occupied: Cell<bool>,
}

pub(crate) struct SlotGuard<'a> {
    slot: &'a SuspensionSlot,
}

impl SuspensionSlot {
    /// Claim the slot, or fail if a suspension is already outstanding.
    #[allow(clippy::result_large_err)]
    pub(crate) fn enter(&self) -> Result<SlotGuard<'_>> {
        if self.occupied.replace(true) {
            return Err(Error::bridge(
                BridgeErrorKind::Reentrancy,
                "a suspension is already outstanding in this bridge context",
            ));
        }
        Ok(SlotGuard { slot: self })
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.occupied.set(false);
    }
}

/// Everything a bridge context needs to talk to its host.
pub(crate) struct WorkerLink {
    pub(crate) to_host: Sender<Yield>,
    pub(crate) from_host: Receiver<Resume>,
    pub(crate) slot: SuspensionSlot,
    pub(crate) detached: Cell<bool>,
    pub(crate) counters: Arc<Counters>,
}

thread_local! {
    static CURRENT: RefCell<Option<WorkerLink>> = const { RefCell::new(None) };
}

pub(crate) fn install(link: WorkerLink) {
    CURRENT.with(|cur| *cur.borrow_mut() = Some(link));
}

pub(crate) fn uninstall() -> Option<WorkerLink> {
    CURRENT.with(|cur| cur.borrow_mut().take())
}

fn detached() -> Error {
    Error::bridge(
        BridgeErrorKind::Detached,
        "the awaiting caller is gone; no further suspensions can be serviced",
    )
}

impl WorkerLink {
    #[allow(clippy::result_large_err)]
    fn suspend(&self, request: IoRequest) -> Result<Payload> {
        let _guard = self.slot.enter()?;
        if self.detached.get() {
            return Err(detached());
        }
        if self.to_host.send(Yield::Suspend(request)).is_err() {
            self.detached.set(true);
            return Err(detached());
        }
        self.counters.suspensions.fetch_add(1, Ordering::Relaxed);
        match self.from_host.recv() {
            Ok(Resume::Value(value)) => Ok(value),
            Ok(Resume::Cancelled) => {
                tracing::debug!("Cancellation injected at suspension point");
                Err(Error::Cancelled)
            }
            Err(_) => {
                self.detached.set(true);
                Err(detached())
            }
        }
    }
}

/// Whether the calling code runs inside a bridge context.
pub fn in_bridge() -> bool {
    CURRENT.with(|cur| cur.borrow().is_some())
}

/// Wait for `future` from synchronous code running inside a bridge context.
///
/// The bridge context suspends, the host scheduler drives `future` to
/// completion, and its output is returned here as if the call had blocked.
/// An error produced by `future` comes back unchanged.
///
/// # Errors
///
/// - `Bridge(NotInBridge)` when called outside a bridge context
/// - `Cancelled` when the awaiting task was cancelled while suspended
/// - `Bridge(Detached)` when the awaiting future was dropped
#[allow(clippy::result_large_err)]
pub fn await_only<F, T>(future: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    CURRENT.with(|cur| {
        let cur = cur.borrow();
        let Some(link) = cur.as_ref() else {
            return Err(Error::bridge(
                BridgeErrorKind::NotInBridge,
                "await_only called outside of a bridge context",
            ));
        };
        let request: IoRequest = Box::pin(async move { Box::new(future.await) as Payload });
        let payload = link.suspend(request)?;
        match payload.downcast::<Result<T>>() {
            Ok(result) => *result,
            Err(_) => Err(Error::Custom(
                "resumed with a value of the wrong type".to_string(),
            )),
        }
    })
}
