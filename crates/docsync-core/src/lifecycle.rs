//! Process teardown hooks
//!
//! Providers register a hook that removes their local presence entry when the
//! hosting process goes away. The registry is an ordinary object the host
//! owns and fires itself (on Ctrl-C, before exit, when a window closes).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::types::{Listeners, SubscriptionId};

/// Registry of callbacks to run once at teardown
#[derive(Default)]
pub struct ExitHooks {
    hooks: Listeners<()>,
    fired: AtomicBool,
}

impl ExitHooks {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a hook
    pub fn register<F>(&self, hook: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.add(Arc::new(move |_: &()| hook()))
    }

    /// Unregister a hook. Returns `false` if it was not registered.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        self.hooks.remove(id)
    }

    /// Number of registered hooks
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no hook is registered
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook once. Later calls do nothing.
    pub fn fire(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(hooks = self.hooks.len(), "Running exit hooks");
        self.hooks.notify(&());
        self.hooks.clear();
    }

    /// Whether `fire` has run
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}
