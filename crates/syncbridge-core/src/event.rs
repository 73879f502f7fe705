//! Event dispatch for synchronous objects.
//!
//! Listeners are registered either on one object ([`EventTarget::listeners`])
//! or on a type ([`class_listeners`]). Dispatch runs synchronously on whatever
//! call graph raised the event; a listener that returns `Err` aborts the
//! operation that fired it.

use crate::error::Result;
use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

/// Events raised by synchronous connections and sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Fired before a statement is sent.
    BeforeExecute,
    /// Fired after a statement completed successfully.
    AfterExecute,
    /// Fired before commit.
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

/// Arguments handed to a listener.
#[derive(Debug, Clone, Copy)]
pub struct EventArgs<'a> {
    pub kind: EventKind,
    /// The statement text, for execute events.
    pub statement: Option<&'a str>,
}

impl<'a> EventArgs<'a> {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            statement: None,
        }
    }

    pub fn with_statement(kind: EventKind, statement: &'a str) -> Self {
        Self {
            kind,
            statement: Some(statement),
        }
    }
}

/// A registered callback.
pub type Listener = Arc<dyn Fn(&EventArgs<'_>) -> Result<()> + Send + Sync>;

/// A shareable set of listeners keyed by event kind.
///
/// Cloning shares the underlying set, so a listener added through one clone is
/// seen by every other.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<Mutex<HashMap<EventKind, Vec<Listener>>>>,
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.inner.lock().expect("lock poisoned");
        let mut dbg = f.debug_struct("Listeners");
        for (kind, list) in map.iter() {
            dbg.field(&format!("{kind:?}"), &list.len());
        }
        dbg.finish()
    }
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `kind`.
    pub fn add<F>(&self, kind: EventKind, f: F)
    where
        F: Fn(&EventArgs<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let mut map = self.inner.lock().expect("lock poisoned");
        map.entry(kind).or_default().push(Arc::new(f));
    }

    /// Remove every listener for `kind`.
    pub fn clear(&self, kind: EventKind) {
        self.inner.lock().expect("lock poisoned").remove(&kind);
    }

    /// Number of listeners registered for `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        self.inner
            .lock()
            .expect("lock poisoned")
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Whether two handles share the same listener set.
    pub fn same_set(&self, other: &Listeners) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Invoke every listener registered for `args.kind`, in registration order.
    ///
    /// The lock is released before the first listener runs so listeners may
    /// register further listeners.
    #[allow(clippy::result_large_err)]
    pub fn fire(&self, args: &EventArgs<'_>) -> Result<()> {
        let snapshot: Vec<Listener> = {
            let map = self.inner.lock().expect("lock poisoned");
            map.get(&args.kind).cloned().unwrap_or_default()
        };
        for listener in snapshot {
            listener(args)?;
        }
        Ok(())
    }
}

/// An object that owns instance-level listeners.
pub trait EventTarget: 'static {
    fn listeners(&self) -> &Listeners;
}

fn class_registry() -> &'static Mutex<HashMap<TypeId, Listeners>> {
    static REGISTRY: OnceLock<Mutex<HashMap<TypeId, Listeners>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The listener set shared by every instance of `T`.
pub fn class_listeners<T: 'static>() -> Listeners {
    let mut registry = class_registry().lock().expect("lock poisoned");
    registry
        .entry(TypeId::of::<T>())
        .or_insert_with(|| {
            tracing::trace!(target_type = type_name::<T>(), "Creating class listener set");
            Listeners::new()
        })
        .clone()
}

/// Fire an event on `target`: instance listeners first, then the listeners
/// registered on its type.
#[allow(clippy::result_large_err)]
pub fn dispatch<T: EventTarget>(target: &T, args: &EventArgs<'_>) -> Result<()> {
    target.listeners().fire(args)?;
    class_listeners::<T>().fire(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Target {
        listeners: Listeners,
    }

    impl EventTarget for Target {
        fn listeners(&self) -> &Listeners {
            &self.listeners
        }
    }

    struct ClassTarget {
        listeners: Listeners,
    }

    impl EventTarget for ClassTarget {
        fn listeners(&self) -> &Listeners {
            &self.listeners
        }
    }

    #[test]
    fn test_instance_listeners_fire_in_order() {
        let target = Target {
            listeners: Listeners::new(),
        };
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = Arc::clone(&seen);
        target.listeners.add(EventKind::BeforeExecute, move |args| {
            s1.lock().unwrap().push(format!("a:{}", args.statement.unwrap_or("")));
            Ok(())
        });
        let s2 = Arc::clone(&seen);
        target.listeners.add(EventKind::BeforeExecute, move |_| {
            s2.lock().unwrap().push("b".to_string());
            Ok(())
        });

        dispatch(
            &target,
            &EventArgs::with_statement(EventKind::BeforeExecute, "SELECT 1"),
        )
        .unwrap();
        dispatch(&target, &EventArgs::new(EventKind::AfterCommit)).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a:SELECT 1", "b"]);
    }

    #[test]
    fn test_class_listeners_reach_every_instance() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        class_listeners::<ClassTarget>().add(EventKind::AfterRollback, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let a = ClassTarget {
            listeners: Listeners::new(),
        };
        let b = ClassTarget {
            listeners: Listeners::new(),
        };
        dispatch(&a, &EventArgs::new(EventKind::AfterRollback)).unwrap();
        dispatch(&b, &EventArgs::new(EventKind::AfterRollback)).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(class_listeners::<ClassTarget>().same_set(&class_listeners::<ClassTarget>()));
    }

    #[test]
    fn test_listener_error_aborts_dispatch() {
        let target = Target {
            listeners: Listeners::new(),
        };
        let later = Arc::new(AtomicUsize::new(0));
        target
            .listeners
            .add(EventKind::BeforeCommit, |_| Err(Error::Custom("veto".into())));
        let l = Arc::clone(&later);
        target.listeners.add(EventKind::BeforeCommit, move |_| {
            l.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = dispatch(&target, &EventArgs::new(EventKind::BeforeCommit)).unwrap_err();
        assert_eq!(err.to_string(), "veto");
        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert_eq!(target.listeners.count(EventKind::BeforeCommit), 2);

        target.listeners.clear(EventKind::BeforeCommit);
        assert_eq!(target.listeners.count(EventKind::BeforeCommit), 0);
    }
}
