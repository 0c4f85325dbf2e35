//! Named event subscription.
//!
//! `EventSource` is the seam to the monitoring library: anything that can
//! register a listener for a named event. `EventBus` is the in-process
//! implementation used by the binary and the tests.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

/// Callback invoked with the payload of each emission.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Something that emits named events with a JSON payload.
pub trait EventSource {
    /// Registers `listener` for every future emission of `event`.
    fn on(&self, event: &str, listener: Listener);
}

/// In-process event bus.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<DashMap<String, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `payload` to every listener of `event`.
    ///
    /// Returns the number of listeners invoked.
    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        // Clone out so listeners run without holding the shard lock
        let listeners = match self.listeners.get(event) {
            Some(entry) => entry.value().clone(),
            None => return 0,
        };

        for listener in &listeners {
            listener(payload);
        }
        listeners.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, |entry| entry.len())
    }

    /// Event names with at least one listener.
    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();
        events.sort();
        events
    }
}

impl EventSource for EventBus {
    fn on(&self, event: &str, listener: Listener) {
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push(listener);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.events())
            .finish()
    }
}
