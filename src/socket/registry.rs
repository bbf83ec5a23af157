//! Topic-keyed publish/subscribe registry for socket events

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use super::events::{SocketEvent, Topic};

pub type Handler = Arc<dyn Fn(&SocketEvent) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    by_topic: HashMap<Topic, Vec<(u64, Handler)>>,
}

#[derive(Clone, Default)]
pub struct EventRegistry {
    inner: Arc<Mutex<Handlers>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic, handler: Handler) -> Subscription {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.next_id += 1;
        let id = guard.next_id;
        guard.by_topic.entry(topic).or_default().push((id, handler));
        Subscription {
            id,
            topic,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every handler of its topic.
    ///
    /// Handlers run after the registry lock is released, so they may
    /// subscribe or unsubscribe freely.
    pub fn publish(&self, event: &SocketEvent) {
        let handlers: Vec<Handler> = {
            let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            guard
                .by_topic
                .get(&event.topic())
                .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(event);
        }
    }

    /// Drop every handler. Outstanding `Subscription`s become no-ops.
    pub fn clear(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.by_topic.clear();
    }

    #[cfg(test)]
    pub fn handler_count(&self, topic: Topic) -> usize {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.by_topic.get(&topic).map_or(0, Vec::len)
    }
}

/// Handle returned by every subscribe call. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    id: u64,
    topic: Topic,
    registry: Weak<Mutex<Handlers>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// False once the handler was removed, e.g. by [`EventRegistry::clear`].
    pub fn is_active(&self) -> bool {
        let Some(inner) = self.registry.upgrade() else {
            return false;
        };
        let guard = inner.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .by_topic
            .get(&self.topic)
            .is_some_and(|hs| hs.iter().any(|(id, _)| *id == self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut guard = inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handlers) = guard.by_topic.get_mut(&self.topic) {
            handlers.retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish()
    }
}
