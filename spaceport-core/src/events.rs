//! Per-submission listener registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::types::{Event, EventKind};

/// A listener callback. Identity (for removal) is the `Arc` allocation.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Wrap a closure as a [`Listener`].
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Ordered listeners keyed by event kind.
///
/// Emission snapshots the current listeners and invokes them outside the
/// lock, so a listener may subscribe, unsubscribe or cancel re-entrantly.
/// Panics inside a listener propagate to the emitter.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<Listener>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventBus")
            .field(
                "status",
                &listeners.get(&EventKind::Status).map_or(0, Vec::len),
            )
            .field("data", &listeners.get(&EventKind::Data).map_or(0, Vec::len))
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener for `kind`.
    pub fn subscribe(&self, kind: EventKind, listener: Listener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(listener);
    }

    /// Remove the first registration of `listener` for `kind`.
    pub fn unsubscribe(&self, kind: EventKind, listener: &Listener) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        match list.iter().position(|l| Arc::ptr_eq(l, listener)) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Invoke every listener registered for the event's kind, in order.
    pub fn emit(&self, event: &Event) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        for listener in snapshot {
            listener(event);
        }
    }
}
