//! # Listener Module
//!
//! Observers bracketing the handler call.
//!
//! For every request the dispatcher selects the listeners that apply to it and
//! calls, in registration order, `on_request_initialized` before the handler
//! and `on_request_performed` after it, whether the handler succeeded or
//! failed. The selected listeners are also attached to the result through a
//! [`ListenerPostProcessor`], which forwards `on_result_returned` once the
//! caller signals that the result was written.
//!
//! The listener list is copy-on-write: readers load a snapshot without
//! locking, writers serialize on a mutex and publish a new vector.

use crate::error::DispatchError;
use crate::request::AjaxRequest;
use crate::result::{AjaxResult, PostProcessor};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Observer of handler invocations
pub trait DispatcherListener: Send + Sync {
    /// Whether this listener wants callbacks for `request`
    fn applies_to(&self, _request: &AjaxRequest) -> bool {
        true
    }

    fn on_request_initialized(&self, request: &AjaxRequest);

    /// Exactly one of `result` and `error` is set
    fn on_request_performed(
        &self,
        request: &AjaxRequest,
        result: Option<&AjaxResult>,
        error: Option<&DispatchError>,
    );

    /// The caller finished writing `result`
    fn on_result_returned(&self, _result: &AjaxResult, _error: Option<&DispatchError>) {}
}

/// Copy-on-write list of listeners
pub struct ListenerRegistry {
    listeners: ArcSwap<Vec<Arc<dyn DispatcherListener>>>,
    write_lock: Mutex<()>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self {
            listeners: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `listener` unless it is already registered (by identity)
    pub fn add(&self, listener: Arc<dyn DispatcherListener>) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.listeners.load();
        if current.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(listener);
        self.listeners.store(Arc::new(next));
        true
    }

    pub fn remove(&self, listener: &Arc<dyn DispatcherListener>) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.listeners.load();
        let next: Vec<_> = current
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        if next.len() == current.len() {
            return false;
        }
        self.listeners.store(Arc::new(next));
        true
    }

    /// Listeners applicable to `request`, in registration order
    #[must_use]
    pub fn applicable(&self, request: &AjaxRequest) -> Vec<Arc<dyn DispatcherListener>> {
        self.listeners
            .load()
            .iter()
            .filter(|l| l.applies_to(request))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Forwards result completion to the listeners of one request
pub struct ListenerPostProcessor {
    listeners: Vec<Arc<dyn DispatcherListener>>,
}

impl ListenerPostProcessor {
    #[must_use]
    pub fn new(listeners: Vec<Arc<dyn DispatcherListener>>) -> Self {
        Self { listeners }
    }
}

impl PostProcessor for ListenerPostProcessor {
    fn done(&self, result: &AjaxResult, error: Option<&DispatchError>) {
        for listener in &self.listeners {
            listener.on_result_returned(result, error);
        }
    }
}
