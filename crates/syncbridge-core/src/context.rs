//! Scheduling-context identity.
//!
//! A [`ContextId`] names one independent unit of cooperative execution. Pooled
//! connections and facades record the context they are bound to and compare it
//! on every use.

use asupersync::Cx;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Opaque identity of a scheduling context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Build an explicit context identity.
    ///
    /// Useful when one `Cx` drives work on behalf of several logical contexts.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The identity of the task that owns `cx`.
    #[must_use]
    pub fn of(cx: &Cx) -> Self {
        let mut hasher = DefaultHasher::new();
        cx.task_id().hash(&mut hasher);
        Self(hasher.finish())
    }

    /// The raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_of_is_stable() {
        let cx = Cx::for_testing();
        assert_eq!(ContextId::of(&cx), ContextId::of(&cx));
        assert_eq!(ContextId::of(&cx), ContextId::of(&cx.clone()));
    }

    #[test]
    fn test_explicit_contexts_differ() {
        assert_ne!(ContextId::new(1), ContextId::new(2));
        assert_eq!(ContextId::new(255).to_string(), "ctx-ff");
    }
}
