//! Cache lifecycle events and their listeners

mod events;
mod listener;

pub use events::CacheEvent;
pub use listener::{CacheEventListener, InMemoryEventCollector, ListenerRegistry, LoggingListener};
