//! Event Listeners
//!
//! Listeners run synchronously on the thread that performed the mutation,
//! after every store lock has been released.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::events::CacheEvent;

/// Receives cache events
pub trait CacheEventListener: Send + Sync {
    fn notify(&self, event: &CacheEvent);
}

/// Publishes events to the tracing system
#[derive(Debug, Clone, Default)]
pub struct LoggingListener {
    info_level: bool,
}

impl LoggingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log at info level instead of debug
    pub fn info_level() -> Self {
        Self { info_level: true }
    }
}

impl CacheEventListener for LoggingListener {
    fn notify(&self, event: &CacheEvent) {
        let json = serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event));
        if self.info_level {
            info!(event_type = event.event_type(), cache = event.cache(), event = %json, "Cache event");
        } else {
            debug!(event_type = event.event_type(), cache = event.cache(), event = %json, "Cache event");
        }
    }
}

/// Keeps every event in memory; used by tests
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: RwLock<Vec<CacheEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events of one type, e.g. `"Evicted"`
    pub fn events_of_type(&self, event_type: &str) -> Vec<CacheEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Keys named by events of one type, in delivery order
    pub fn keys_of_type(&self, event_type: &str) -> Vec<String> {
        self.events_of_type(event_type)
            .iter()
            .filter_map(|e| e.key().map(str::to_string))
            .collect()
    }
}

impl CacheEventListener for InMemoryEventCollector {
    fn notify(&self, event: &CacheEvent) {
        self.events.write().push(event.clone());
    }
}

/// Listeners registered on one cache
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn CacheEventListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn CacheEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove a listener by identity, returning whether it was registered
    pub fn unregister(&self, listener: &Arc<dyn CacheEventListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub fn dispatch(&self, event: &CacheEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.notify(event);
        }
    }

    pub fn dispatch_all(&self, events: &[CacheEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for event in events {
            for listener in &listeners {
                listener.notify(event);
            }
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listener_count", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_listener() {
        // Should not panic
        LoggingListener::new().notify(&CacheEvent::put("c", "k", 1));
        LoggingListener::info_level().notify(&CacheEvent::removed("c", "k"));
    }

    #[test]
    fn test_registry_dispatch_and_unregister() {
        let registry = ListenerRegistry::new();
        let collector = Arc::new(InMemoryEventCollector::new());
        let as_listener: Arc<dyn CacheEventListener> = collector.clone();

        registry.register(as_listener.clone());
        registry.dispatch(&CacheEvent::put("c", "a", 1));
        registry.dispatch_all(&[
            CacheEvent::expired("c", "b"),
            CacheEvent::expired("c", "c"),
        ]);

        assert_eq!(collector.len(), 3);
        assert_eq!(collector.keys_of_type("Expired"), vec!["b", "c"]);

        assert!(registry.unregister(&as_listener));
        assert!(!registry.unregister(&as_listener));
        registry.dispatch(&CacheEvent::put("c", "z", 1));
        assert_eq!(collector.len(), 3);

        collector.clear();
        assert!(collector.is_empty());
    }
}
