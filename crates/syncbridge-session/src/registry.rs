//! Context-scoped resource registry.
//!
//! A [`ScopedRegistry`] maps a scope key, derived from the current scheduling
//! context by a caller-supplied function, to a lazily created resource. At
//! most one resource exists per live key. Removing a key closes its resource
//! and the next lookup creates a fresh one, unless the resource reports that
//! it is still in use, in which case it stays registered.

use asupersync::{Cx, Outcome};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use syncbridge_core::error::{BridgeErrorKind, Error};

/// A resource that can live in a [`ScopedRegistry`].
pub trait ScopedResource: Send + Sync + 'static {
    /// Tear the resource down. Called when its key is removed.
    ///
    /// Failing with a `ConcurrentUse` bridge error means the resource is busy
    /// and was left open.
    fn close(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type ScopeFn<K> = Box<dyn Fn(&Cx) -> K + Send + Sync>;

/// Registry of one resource per scope key.
pub struct ScopedRegistry<T, K> {
    factory: Factory<T>,
    scopefunc: ScopeFn<K>,
    registry: Mutex<HashMap<K, Arc<T>>>,
}

impl<T, K: fmt::Debug> fmt::Debug for ScopedRegistry<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock().expect("lock poisoned");
        f.debug_struct("ScopedRegistry")
            .field("keys", &registry.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<T, K> ScopedRegistry<T, K>
where
    T: ScopedResource,
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
{
    /// Create a registry.
    ///
    /// `scopefunc` derives the scope key from the calling context; there is
    /// no default because "current thread" means nothing under cooperative
    /// scheduling.
    pub fn new(
        factory: impl Fn() -> T + Send + Sync + 'static,
        scopefunc: impl Fn(&Cx) -> K + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory: Box::new(factory),
            scopefunc: Box::new(scopefunc),
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// The scope key for `cx`.
    pub fn scope_key(&self, cx: &Cx) -> K {
        (self.scopefunc)(cx)
    }

    /// The resource for the calling scope, created on first access.
    pub fn get(&self, cx: &Cx) -> Arc<T> {
        self.get_for(self.scope_key(cx))
    }

    /// The resource registered under `key`, created on first access.
    pub fn get_for(&self, key: K) -> Arc<T> {
        let mut registry = self.registry.lock().expect("lock poisoned");
        Arc::clone(registry.entry(key).or_insert_with_key(|key| {
            tracing::debug!(scope = ?key, "Creating scoped resource");
            Arc::new((self.factory)())
        }))
    }

    /// Whether the calling scope has a resource.
    pub fn has(&self, cx: &Cx) -> bool {
        self.has_key(&self.scope_key(cx))
    }

    pub fn has_key(&self, key: &K) -> bool {
        self.registry
            .lock()
            .expect("lock poisoned")
            .contains_key(key)
    }

    /// Register `instance` for the calling scope, replacing any existing one
    /// without closing it.
    pub fn set(&self, cx: &Cx, instance: T) {
        let key = self.scope_key(cx);
        self.registry
            .lock()
            .expect("lock poisoned")
            .insert(key, Arc::new(instance));
    }

    pub fn len(&self) -> usize {
        self.registry.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget the calling scope's resource. No-op if absent.
    pub async fn remove(&self, cx: &Cx) -> Outcome<(), Error> {
        self.remove_key(cx, &self.scope_key(cx)).await
    }

    /// Close and forget the resource registered under `key`.
    ///
    /// A resource that is busy keeps its registration, so later lookups from
    /// the same scope still find it.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn remove_key(&self, cx: &Cx, key: &K) -> Outcome<(), Error> {
        let removed = self.registry.lock().expect("lock poisoned").remove(key);
        match removed {
            Some(instance) => {
                let outcome = instance.close(cx).await;
                self.restore_if_busy(key.clone(), instance, &outcome);
                outcome
            }
            None => Outcome::Ok(()),
        }
    }

    fn restore_if_busy(&self, key: K, instance: Arc<T>, outcome: &Outcome<(), Error>) {
        let Outcome::Err(e) = outcome else {
            return;
        };
        if e.bridge_kind() != Some(BridgeErrorKind::ConcurrentUse) {
            return;
        }
        tracing::debug!(scope = ?key, "Scoped resource in use; keeping it registered");
        self.registry
            .lock()
            .expect("lock poisoned")
            .entry(key)
            .or_insert(instance);
    }

    /// Close and forget every registered resource.
    ///
    /// Every resource is closed even if an earlier close fails; the first
    /// failure is returned.
    pub async fn remove_all(&self, cx: &Cx) -> Outcome<(), Error> {
        let drained: Vec<(K, Arc<T>)> = self
            .registry
            .lock()
            .expect("lock poisoned")
            .drain()
            .collect();
        let mut first_failure = Outcome::Ok(());
        for (key, instance) in drained {
            let outcome = instance.close(cx).await;
            if !outcome.is_ok() {
                tracing::warn!(scope = ?key, "Failed to close scoped resource");
                self.restore_if_busy(key.clone(), instance, &outcome);
                if first_failure.is_ok() {
                    first_failure = outcome;
                }
            }
        }
        first_failure
    }
}
