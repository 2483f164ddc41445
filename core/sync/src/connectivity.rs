//! Network reachability observer.
//!
//! The monitor holds the last reachability the platform reported and tells
//! listeners about transitions. It never polls and never retries anything;
//! the platform drives it through [`ConnectivityMonitor::report`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

struct Inner {
    online: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, Listener>>,
}

/// Shared handle to the connectivity state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                online: AtomicBool::new(initially_online),
                next_id: AtomicU64::new(0),
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Reachability as last reported by the platform.
    pub fn currently_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Register a transition listener.
    ///
    /// The listener runs on whichever thread calls [`report`](Self::report),
    /// once per transition. Delivery order across listeners is unspecified.
    /// Dropping the returned subscription deregisters the listener.
    pub fn on_transition<F>(&self, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners().insert(id, Arc::new(listener));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Feed a reachability reading from the platform.
    ///
    /// Listeners are notified only when the reading differs from the last one.
    /// Returns whether this reading was a transition.
    pub fn report(&self, online: bool) -> bool {
        let previous = self.inner.online.swap(online, Ordering::AcqRel);
        if previous == online {
            debug!("Connectivity unchanged (online: {})", online);
            return false;
        }

        info!(
            "Connectivity changed: {}",
            if online { "online" } else { "offline" }
        );

        // Call outside the lock so listeners may register or drop subscriptions.
        let listeners: Vec<Listener> = self.listeners().values().cloned().collect();
        for listener in listeners {
            listener(online);
        }
        true
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Listener>> {
        lock_listeners(&self.inner)
    }
}

fn lock_listeners(inner: &Inner) -> std::sync::MutexGuard<'_, HashMap<u64, Listener>> {
    // A panicking listener runs outside the lock, so poisoning never leaves
    // the map half-updated.
    inner.listeners.lock().unwrap_or_else(|e| e.into_inner())
}

/// Registration handle returned by [`ConnectivityMonitor::on_transition`].
#[must_use = "dropping a subscription deregisters its listener"]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    /// Deregister the listener.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            lock_listeners(&inner).remove(&self.id);
        }
    }
}
