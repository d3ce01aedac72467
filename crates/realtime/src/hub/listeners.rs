//! Typed event listener registry
//!
//! Multiplexes any number of handlers over one listener per hub event. The
//! listener for an event exists exactly while it has at least one handler.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;

use super::{HubEvent, HubEventName};
use crate::cleanup::panic_message;

type DecodedEvent = Box<dyn Any + Send>;
type DecodeFn = fn(&[Value]) -> Result<DecodedEvent, serde_json::Error>;
type Callback = Arc<dyn Fn(&(dyn Any + Send)) + Send + Sync>;

fn decode_event<E: HubEvent>(args: &[Value]) -> Result<DecodedEvent, serde_json::Error> {
    Ok(Box::new(E::from_arguments(args)?))
}

#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback,
}

/// The single underlying listener for one event name
struct Listener {
    decode: DecodeFn,
    handlers: Vec<HandlerEntry>,
}

/// Registry of hub listeners keyed by event name
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<HashMap<HubEventName, Listener>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<HubEventName, Listener>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a handler; installs the listener for `E` if this is the first one
    pub fn add<E, F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        E: HubEvent,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let callback: Callback = Arc::new(move |event: &(dyn Any + Send)| {
            if let Some(event) = event.downcast_ref::<E>() {
                handler(event);
            }
        });

        let mut listeners = self.lock();
        let listener = listeners.entry(E::NAME).or_insert_with(|| {
            tracing::debug!(event = %E::NAME, "Installed hub listener");
            Listener {
                decode: decode_event::<E>,
                handlers: Vec::new(),
            }
        });
        listener.handlers.push(HandlerEntry {
            id,
            active: Arc::clone(&active),
            callback,
        });

        tracing::debug!(
            event = %E::NAME,
            handler_id = id,
            handlers = listener.handlers.len(),
            "Hub handler registered"
        );

        Subscription {
            registry: Arc::downgrade(self),
            event: E::NAME,
            id,
            active,
        }
    }

    fn remove(&self, event: HubEventName, id: u64) {
        let mut listeners = self.lock();
        if let Some(listener) = listeners.get_mut(&event) {
            listener.handlers.retain(|h| h.id != id);

            // Tear down the listener once nobody is left
            if listener.handlers.is_empty() {
                listeners.remove(&event);
                tracing::debug!(event = %event, "Removed hub listener");
            } else {
                tracing::debug!(
                    event = %event,
                    handler_id = id,
                    handlers = listener.handlers.len(),
                    "Hub handler removed"
                );
            }
        }
    }

    /// Fan an inbound event out to its handlers in registration order
    ///
    /// Handlers run synchronously outside the registry lock, so they may
    /// subscribe or unsubscribe. A handler removed during this dispatch is not
    /// called afterwards; the others each run exactly once. A panicking
    /// handler is logged and skipped; it does not reach the hub reader.
    pub fn dispatch(&self, target: &str, args: &[Value]) -> usize {
        let Some(event) = HubEventName::from_target(target) else {
            tracing::debug!(target = %target, "Ignoring unknown hub event");
            return 0;
        };

        let (decode, handlers) = {
            let listeners = self.lock();
            match listeners.get(&event) {
                Some(listener) => (listener.decode, listener.handlers.clone()),
                None => {
                    tracing::trace!(event = %event, "No listener for hub event");
                    return 0;
                }
            }
        };

        let decoded = match decode(args) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(event = %event, error = %e, "Failed to decode hub event");
                return 0;
            }
        };

        let mut delivered = 0;
        for handler in handlers {
            if !handler.active.load(Ordering::SeqCst) {
                continue;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| (handler.callback)(&*decoded))) {
                Ok(()) => delivered += 1,
                Err(payload) => tracing::error!(
                    event = %event,
                    handler_id = handler.id,
                    error = %panic_message(&*payload),
                    "Hub event handler panicked"
                ),
            }
        }
        delivered
    }

    /// Number of installed listeners
    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of handlers registered for an event
    pub fn handler_count(&self, event: HubEventName) -> usize {
        self.lock().get(&event).map(|l| l.handlers.len()).unwrap_or(0)
    }

    /// Drop every listener and deactivate all outstanding subscriptions
    pub fn clear(&self) {
        let mut listeners = self.lock();
        for listener in listeners.values() {
            for handler in &listener.handlers {
                handler.active.store(false, Ordering::SeqCst);
            }
        }
        let count = listeners.len();
        listeners.clear();

        if count > 0 {
            tracing::debug!(listeners = count, "Cleared hub listeners");
        }
    }
}

/// Handle for one registered handler
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<ListenerRegistry>,
    event: HubEventName,
    id: u64,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn event(&self) -> HubEventName {
        self.event
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Remove this handler only; safe to call more than once
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.event, self.id);
        }
    }
}
