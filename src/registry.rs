// src/registry.rs
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

use crate::handler::RawHandler;

struct Registration {
    id: u64,
    topic: String,
    handler: RawHandler,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    registrations: Vec<Registration>,
}

/// Topic → handler table shared by broker implementations.
///
/// Deliveries go to the earliest registration for their topic.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

fn lock(inner: &Mutex<RegistryInner>) -> MutexGuard<'_, RegistryInner> {
    // Registrations stay consistent even if a holder panicked.
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, topic: &str, handler: RawHandler) -> Subscription {
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.registrations.push(Registration {
            id,
            topic: topic.to_string(),
            handler,
        });
        debug!(topic = %topic, id, "Handler registered");

        Subscription {
            id,
            topic: topic.to_string(),
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn lookup(&self, topic: &str) -> Option<RawHandler> {
        lock(&self.inner)
            .registrations
            .iter()
            .find(|registration| registration.topic == topic)
            .map(|registration| Arc::clone(&registration.handler))
    }

    pub fn count(&self, topic: &str) -> usize {
        lock(&self.inner)
            .registrations
            .iter()
            .filter(|registration| registration.topic == topic)
            .count()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.inner).registrations.clear();
    }
}

/// Handle for a registered handler; `cancel` removes the registration.
///
/// Dropping the handle keeps the handler registered.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: String,
    registry: Weak<Mutex<RegistryInner>>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        let Some(inner) = self.registry.upgrade() else {
            return false;
        };
        let active = lock(&inner).registrations.iter().any(|r| r.id == self.id);
        active
    }

    /// Returns whether the registration was still present.
    pub fn cancel(self) -> bool {
        let Some(inner) = self.registry.upgrade() else {
            return false;
        };
        let mut inner = lock(&inner);
        let before = inner.registrations.len();
        inner.registrations.retain(|registration| registration.id != self.id);
        let removed = inner.registrations.len() != before;
        if removed {
            debug!(topic = %self.topic, id = self.id, "Handler removed");
        }
        removed
    }
}
