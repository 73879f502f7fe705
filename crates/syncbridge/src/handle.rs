//! Exclusive ownership of the synchronous handle behind a facade.
//!
//! A facade's handle is moved into the bridge context for the duration of one
//! operation and moved back when it completes. While it is away the slot is
//! busy, so a second overlapping operation fails fast instead of waiting.

use asupersync::{CancelReason, Cx, Outcome};
use std::sync::{Arc, Mutex};
use syncbridge_core::error::{BridgeErrorKind, Error, Result};
use syncbridge_trampoline::Trampoline;

enum SlotState<H> {
    Idle(H),
    Busy,
    Disposed,
}

pub(crate) struct HandleSlot<H> {
    state: Arc<Mutex<SlotState<H>>>,
    what: &'static str,
}

impl<H: Send + 'static> HandleSlot<H> {
    pub(crate) fn new(handle: H, what: &'static str) -> Self {
        Self {
            state: Arc::new(Mutex::new(SlotState::Idle(handle))),
            what,
        }
    }

    /// Take the handle out, marking the slot busy.
    #[allow(clippy::result_large_err)]
    pub(crate) fn checkout(&self) -> Result<Checkout<H>> {
        let mut state = self.state.lock().expect("lock poisoned");
        match std::mem::replace(&mut *state, SlotState::Busy) {
            SlotState::Idle(handle) => Ok(Checkout {
                handle: Some(handle),
                state: Arc::clone(&self.state),
            }),
            SlotState::Busy => Err(Error::bridge(
                BridgeErrorKind::ConcurrentUse,
                format!("{} is already in use by another operation", self.what),
            )),
            SlotState::Disposed => {
                *state = SlotState::Disposed;
                Err(self.disposed())
            }
        }
    }

    pub(crate) fn disposed(&self) -> Error {
        Error::bridge(
            BridgeErrorKind::UseAfterDispose,
            format!("{} was already closed", self.what),
        )
    }

    pub(crate) fn is_disposed(&self) -> bool {
        matches!(
            *self.state.lock().expect("lock poisoned"),
            SlotState::Disposed
        )
    }

    /// Run `f` against the handle without leaving the calling thread. For
    /// operations that perform no I/O.
    #[allow(clippy::result_large_err)]
    pub(crate) fn with_now<R>(&self, f: impl FnOnce(&mut H) -> R) -> Result<R> {
        let mut checkout = self.checkout()?;
        let mut handle = checkout.take();
        let result = f(&mut handle);
        checkout.restore(handle);
        Ok(result)
    }

    /// Run `f` against the handle inside a bridge context.
    ///
    /// The handle comes back to the slot whether `f` succeeds or fails. If
    /// the call graph panics, or the operation is abandoned mid-flight, the
    /// handle is lost and the slot is left disposed.
    pub(crate) async fn run<R, F>(&self, trampoline: &Trampoline, cx: &Cx, f: F) -> Outcome<R, Error>
    where
        R: Send + 'static,
        F: FnOnce(&mut H) -> Result<R> + Send + 'static,
    {
        let mut checkout = match self.checkout() {
            Ok(checkout) => checkout,
            Err(e) => return Outcome::Err(e),
        };
        let mut handle = checkout.take();
        let outcome = trampoline
            .run(cx, move || {
                let result = f(&mut handle);
                Ok((handle, result))
            })
            .await;

        match outcome {
            Outcome::Ok((handle, result)) => {
                checkout.restore(handle);
                match result {
                    Ok(value) => Outcome::Ok(value),
                    Err(Error::Cancelled) if cx.is_cancel_requested() => Outcome::Cancelled(
                        cx.cancel_reason()
                            .unwrap_or_else(|| CancelReason::user("cancelled while suspended")),
                    ),
                    Err(e) => Outcome::Err(e),
                }
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => {
                tracing::warn!(what = self.what, "Handle lost to a panic; facade is now closed");
                Outcome::Panicked(p)
            }
        }
    }

    /// Run `f` inside a bridge context, then dispose of the slot.
    ///
    /// Disposing an already disposed slot is a no-op.
    pub(crate) async fn run_and_dispose<F>(
        &self,
        trampoline: &Trampoline,
        cx: &Cx,
        f: F,
    ) -> Outcome<(), Error>
    where
        F: FnOnce(&mut H) -> Result<()> + Send + 'static,
    {
        if self.is_disposed() {
            return Outcome::Ok(());
        }
        let outcome = self.run(trampoline, cx, f).await;
        if let Ok(mut state) = self.state.lock() {
            if let SlotState::Idle(_) = &*state {
                *state = SlotState::Disposed;
            }
        }
        outcome
    }
}

/// A handle taken out of its slot.
///
/// Dropping it without [`restore`](Self::restore) leaves the slot disposed.
pub(crate) struct Checkout<H> {
    handle: Option<H>,
    state: Arc<Mutex<SlotState<H>>>,
}

impl<H> Checkout<H> {
    fn take(&mut self) -> H {
        match self.handle.take() {
            Some(handle) => handle,
            None => unreachable!("handle taken twice"),
        }
    }

    fn restore(mut self, handle: H) {
        let mut state = self.state.lock().expect("lock poisoned");
        if let SlotState::Busy = &*state {
            *state = SlotState::Idle(handle);
        }
        drop(state);
        self.handle = None;
    }
}

impl<H> Drop for Checkout<H> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let SlotState::Busy = &*state {
                *state = match self.handle.take() {
                    Some(handle) => SlotState::Idle(handle),
                    None => SlotState::Disposed,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_checkout_is_concurrent_use() {
        let slot = HandleSlot::new(5_u32, "widget");
        let first = slot.checkout().unwrap();

        let err = slot.checkout().err().unwrap();
        assert_eq!(err.bridge_kind(), Some(BridgeErrorKind::ConcurrentUse));
        assert!(err.to_string().contains("widget"));

        drop(first);
        assert_eq!(slot.with_now(|n| *n + 1).unwrap(), 6);
    }

    #[test]
    fn test_lost_handle_disposes_slot() {
        let slot = HandleSlot::new(String::from("h"), "widget");
        let mut checkout = slot.checkout().unwrap();
        let handle = checkout.take();
        drop(handle);
        drop(checkout);

        assert!(slot.is_disposed());
        let err = slot.checkout().err().unwrap();
        assert_eq!(err.bridge_kind(), Some(BridgeErrorKind::UseAfterDispose));
    }
}
