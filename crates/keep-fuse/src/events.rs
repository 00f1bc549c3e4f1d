use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::api::Filter;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event feed unavailable: {0}")]
    Unavailable(String),
}

/// A change notification for one metadata object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub object_uuid: String,
    pub event_type: String,
}

impl Event {
    pub fn new(object_uuid: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            object_uuid: object_uuid.into(),
            event_type: event_type.into(),
        }
    }
}

pub type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;

/// Push notifications for metadata changes.
///
/// Callbacks run on the source's own thread, never inside `subscribe`.
pub trait EventSource: Send + Sync {
    fn subscribe(
        &self,
        filters: Vec<Filter>,
        callback: EventCallback,
    ) -> Result<Subscription, EventError>;
}

/// Keeps a subscription alive; dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// A source with no feed behind it. Every subscribe fails, so directories
/// fall back to polling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvents;

impl EventSource for NoEvents {
    fn subscribe(&self, _: Vec<Filter>, _: EventCallback) -> Result<Subscription, EventError> {
        Err(EventError::Unavailable("no event feed configured".into()))
    }
}

struct Listener {
    filters: Vec<Filter>,
    callback: Arc<EventCallback>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<u64, Listener>,
}

/// In-process event feed. Events are delivered by calling [`emit`].
///
/// [`emit`]: MemoryEvents::emit
#[derive(Clone)]
pub struct MemoryEvents {
    registry: Arc<Mutex<Registry>>,
    available: bool,
}

impl MemoryEvents {
    pub fn new() -> Self {
        Self {
            registry: Arc::default(),
            available: true,
        }
    }

    /// A feed whose subscribe always fails.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().listeners.len()
    }

    /// Deliver `event` to every matching subscriber. Returns how many were
    /// notified.
    pub fn emit(&self, event: &Event) -> usize {
        let value = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(_) => return 0,
        };
        // Collect first so callbacks run without the registry lock held.
        let targets: Vec<Arc<EventCallback>> = self
            .registry
            .lock()
            .listeners
            .values()
            .filter(|l| l.filters.iter().all(|f| f.matches(&value)))
            .map(|l| l.callback.clone())
            .collect();
        trace!("event {:?} -> {} subscribers", event, targets.len());
        for callback in &targets {
            (**callback)(event);
        }
        targets.len()
    }
}

impl Default for MemoryEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for MemoryEvents {
    fn subscribe(
        &self,
        filters: Vec<Filter>,
        callback: EventCallback,
    ) -> Result<Subscription, EventError> {
        if !self.available {
            return Err(EventError::Unavailable("subscribe refused".into()));
        }
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.insert(
                id,
                Listener {
                    filters,
                    callback: Arc::new(callback),
                },
            );
            id
        };
        let weak = Arc::downgrade(&self.registry);
        Ok(Subscription::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry.lock().listeners.remove(&id);
            }
        }))
    }
}
