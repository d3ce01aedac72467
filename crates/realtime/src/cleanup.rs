//! Teardown registry for a UI surface
//!
//! Every resource a surface acquires (hub subscriptions, sweep timers, the hub
//! connection itself) registers a callback here. The registry runs them once,
//! front to back, when the surface ends: either through an explicit
//! [`CleanupRegistry::run_all`] or when the registry is dropped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

type CleanupFn = Box<dyn FnOnce() + Send + 'static>;

/// Ordered collection of teardown callbacks owned by one surface
#[derive(Default)]
pub struct CleanupRegistry {
    callbacks: Mutex<Vec<CleanupFn>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a teardown callback
    pub fn add<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.callbacks.lock() {
            Ok(mut callbacks) => callbacks.push(Box::new(f)),
            Err(poisoned) => poisoned.into_inner().push(Box::new(f)),
        }
    }

    /// Number of callbacks waiting to run
    pub fn len(&self) -> usize {
        match self.callbacks.lock() {
            Ok(callbacks) => callbacks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every registered callback in registration order, then empty the registry
    ///
    /// A panicking callback is logged and the remaining callbacks still run.
    /// Calling this again without new registrations does nothing.
    pub fn run_all(&self) {
        // Drain under the lock, run outside it so callbacks may register more work
        let callbacks: Vec<CleanupFn> = match self.callbacks.lock() {
            Ok(mut callbacks) => callbacks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };

        if callbacks.is_empty() {
            return;
        }

        let total = callbacks.len();
        let mut failed = 0;

        for (index, callback) in callbacks.into_iter().enumerate() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                failed += 1;
                tracing::error!(
                    index,
                    error = %panic_message(&*payload),
                    "Cleanup callback panicked"
                );
            }
        }

        tracing::debug!(callbacks = total, failed, "Cleanup registry drained");
    }
}

impl Drop for CleanupRegistry {
    fn drop(&mut self) {
        self.run_all();
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("pending", &self.len())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
