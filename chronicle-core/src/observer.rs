//! Observer sets with explicit unsubscribe handles
//!
//! Every push surface in the crate (status changes, live events, store
//! changes) fans out through a [`ListenerSet`]. Notification is synchronous
//! and runs with no lock held, so a listener may read from whatever
//! notified it.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: BTreeMap<u64, Listener<T>>,
}

/// A set of listeners notified in registration order
pub struct ListenerSet<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: BTreeMap::new(),
            })),
        }
    }

    /// Register a listener; dropping the handle does not remove it.
    pub fn add(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerHandle {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.insert(id, Arc::new(listener));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        ListenerHandle::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry.lock().listeners.remove(&id);
            }
        })
    }

    pub fn notify(&self, value: &T) {
        let listeners: Vec<Listener<T>> = self.registry.lock().listeners.values().cloned().collect();
        for listener in listeners {
            listener(value);
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.registry.lock().listeners.clear();
    }
}

impl<T: 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Token returned by every subscribe-style call
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct ListenerHandle {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A handle whose unsubscribe does nothing
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.release.is_some())
            .finish()
    }
}
