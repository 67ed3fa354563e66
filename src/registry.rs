//! # Registry Module
//!
//! Maps module paths to [`ActionFactory`] instances.
//!
//! Resolution is a lock-free read against a concurrent map. Registration and
//! removal are rare (startup, plugin load) and serialized by a write lock so
//! that the read-merge-write of combined factories is atomic.
//!
//! ## Prefix fallback
//!
//! `resolve("mail/theAttachmentName")` tries the exact module first, then
//! strips trailing `/` segments until a registration matches:
//! `mail/theAttachmentName` → `mail`.

use crate::handler::{ActionFactory, CombinedActionFactory};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

enum Entry {
    Single(Arc<dyn ActionFactory>),
    Combined(Arc<CombinedActionFactory>),
}

impl Entry {
    fn factory(&self) -> Arc<dyn ActionFactory> {
        match self {
            Entry::Single(f) => Arc::clone(f),
            Entry::Combined(c) => Arc::clone(c) as Arc<dyn ActionFactory>,
        }
    }
}

/// Outcome of [`ActionRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First factory for the module
    Added,
    /// Merged with the factories already registered for the module
    Combined,
    /// Rejected; the existing registration is kept
    Denied,
}

/// Module path → factory map
#[derive(Default)]
pub struct ActionRegistry {
    factories: DashMap<String, Entry>,
    write_lock: Mutex<()>,
}

impl ActionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for `module`.
    ///
    /// If a factory is already registered for the exact module, the two are
    /// combined when either of them is combinable. Otherwise the registration
    /// is denied and logged; the original registration wins.
    pub fn register(&self, module: &str, factory: Arc<dyn ActionFactory>) -> Registration {
        let _guard = self.write_lock.lock();

        let merged = match self.factories.get(module) {
            None => None,
            Some(existing) => match existing.value() {
                Entry::Combined(combined) => Some(combined.with(Arc::clone(&factory))),
                Entry::Single(single) if single.combinable() || factory.combinable() => Some(
                    CombinedActionFactory::new(vec![Arc::clone(single), Arc::clone(&factory)]),
                ),
                Entry::Single(single) => {
                    warn!(
                        module = %module,
                        existing = %single.name(),
                        rejected = %factory.name(),
                        "There is already a factory associated with module; registration denied"
                    );
                    return Registration::Denied;
                }
            },
        };

        match merged {
            None => {
                info!(module = %module, factory = %factory.name(), "Action factory registered");
                self.factories
                    .insert(module.to_string(), Entry::Single(factory));
                Registration::Added
            }
            Some(combined) => {
                info!(
                    module = %module,
                    factory = %factory.name(),
                    members = combined.len(),
                    "Action factory combined with existing registration"
                );
                self.factories
                    .insert(module.to_string(), Entry::Combined(Arc::new(combined)));
                Registration::Combined
            }
        }
    }

    /// Remove `factory` (matched by identity) from `module`.
    ///
    /// Returns `true` if something was removed.
    pub fn remove(&self, module: &str, factory: &Arc<dyn ActionFactory>) -> bool {
        let _guard = self.write_lock.lock();

        let replacement = match self.factories.get(module) {
            None => return false,
            Some(existing) => match existing.value() {
                Entry::Single(single) => {
                    if !Arc::ptr_eq(single, factory) {
                        return false;
                    }
                    None
                }
                Entry::Combined(combined) => {
                    let reduced = combined.without(factory);
                    if reduced.len() == combined.len() {
                        return false;
                    }
                    (!reduced.is_empty()).then_some(reduced)
                }
            },
        };

        match replacement {
            Some(reduced) => {
                debug!(module = %module, members = reduced.len(), "Action factory removed from combination");
                self.factories
                    .insert(module.to_string(), Entry::Combined(Arc::new(reduced)));
            }
            None => {
                debug!(module = %module, "Action factory removed");
                self.factories.remove(module);
            }
        }
        true
    }

    /// Whether a factory is registered for exactly `module`
    #[must_use]
    pub fn handles(&self, module: &str) -> bool {
        self.factories.contains_key(module)
    }

    /// Factory for exactly `module`
    #[must_use]
    pub fn get(&self, module: &str) -> Option<Arc<dyn ActionFactory>> {
        self.factories.get(module).map(|e| e.value().factory())
    }

    /// Resolve `module` with prefix fallback.
    ///
    /// Returns the module the match was found under together with its factory.
    #[must_use]
    pub fn resolve(&self, module: &str) -> Option<(String, Arc<dyn ActionFactory>)> {
        if let Some(factory) = self.get(module) {
            return Some((module.to_string(), factory));
        }

        let mut candidate = module;
        while let Some(idx) = candidate.rfind('/').filter(|i| *i > 0) {
            candidate = &candidate[..idx];
            if let Some(factory) = self.get(candidate) {
                return Some((candidate.to_string(), factory));
            }
        }
        None
    }

    /// Number of registered modules
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
