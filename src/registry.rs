//! Per-session capability registry.
//!
//! The registry maps script-visible identifiers to capability objects. It is
//! built fresh when a session starts, owned exclusively by the session
//! controller for the session's lifetime, and drained at teardown.
//!
//! Registration is strict: a duplicate identifier is an error and leaves the
//! registry untouched. Silent replacement would let one capability shadow
//! another and surface only as baffling script behavior.

use crate::capability::Capability;
use crate::error::{AppResult, BridgeError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct RegistryInner {
    entries: HashMap<String, Arc<dyn Capability>>,
    /// Registration order, used so teardown releases in a stable order.
    order: Vec<String>,
}

/// Identifier → capability mapping for one session.
pub struct CapabilityRegistry {
    inner: Mutex<RegistryInner>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Register a capability under a session-unique identifier.
    ///
    /// Fails fast on duplicates without mutating the registry.
    pub fn register(&self, identifier: &str, capability: Arc<dyn Capability>) -> AppResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(identifier) {
            return Err(BridgeError::DuplicateCapability(identifier.to_string()));
        }
        tracing::debug!(
            identifier,
            type_name = capability.type_name(),
            "capability registered"
        );
        inner.entries.insert(identifier.to_string(), capability);
        inner.order.push(identifier.to_string());
        Ok(())
    }

    /// Look up a capability by identifier alone.
    pub fn get(&self, identifier: &str) -> Option<Arc<dyn Capability>> {
        self.inner.lock().unwrap().entries.get(identifier).cloned()
    }

    /// Receiver resolution: the capability must exist under `identifier`
    /// *and* declare the expected type.
    pub fn resolve(&self, type_name: &str, identifier: &str) -> Option<Arc<dyn Capability>> {
        self.get(identifier)
            .filter(|capability| capability.type_name() == type_name)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every entry, invoking each capability's shutdown hook in
    /// registration order. Safe to call after partial registration failure
    /// and safe to call more than once.
    pub fn unregister_all(&self) {
        let (order, mut entries) = {
            let mut inner = self.inner.lock().unwrap();
            (
                std::mem::take(&mut inner.order),
                std::mem::take(&mut inner.entries),
            )
        };
        for identifier in order {
            if let Some(capability) = entries.remove(&identifier) {
                tracing::debug!(identifier = %identifier, "capability shutting down");
                capability.shutdown();
            }
        }
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        declared: &'static str,
        shutdowns: Arc<AtomicUsize>,
    }

    impl Capability for Probe {
        fn type_name(&self) -> &'static str {
            self.declared
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn probe(declared: &'static str, shutdowns: &Arc<AtomicUsize>) -> Arc<dyn Capability> {
        Arc::new(Probe {
            declared,
            shutdowns: shutdowns.clone(),
        })
    }

    #[test]
    fn test_duplicate_registration_fails_without_mutation() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = CapabilityRegistry::new();
        let original = probe("Motor", &counter);
        registry.register("left", original.clone()).unwrap();

        let result = registry.register("left", probe("RangeSensor", &counter));
        assert!(matches!(result, Err(BridgeError::DuplicateCapability(_))));

        assert_eq!(registry.len(), 1);
        // The original entry is untouched, not replaced.
        assert_eq!(registry.get("left").unwrap().type_name(), "Motor");
    }

    #[test]
    fn test_resolve_checks_declared_type() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = CapabilityRegistry::new();
        registry.register("left", probe("Motor", &counter)).unwrap();

        assert!(registry.resolve("Motor", "left").is_some());
        assert!(registry.resolve("RangeSensor", "left").is_none());
        assert!(registry.resolve("Motor", "right").is_none());
    }

    #[test]
    fn test_unregister_all_runs_hooks_once_and_is_repeatable() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = CapabilityRegistry::new();
        registry.register("a", probe("Motor", &counter)).unwrap();
        registry.register("b", probe("Motor", &counter)).unwrap();

        registry.unregister_all();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());

        // Second call is a no-op, not a double shutdown.
        registry.unregister_all();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregister_all_on_empty_registry() {
        CapabilityRegistry::new().unregister_all();
    }
}
