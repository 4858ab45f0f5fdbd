//! Observer registration for wallet events
//!
//! Every `subscribe` hands back a `Subscription`. Disposing or dropping it
//! removes exactly the listener it registered.

use crate::types::WalletEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

pub type Listener = Arc<dyn Fn(&WalletEvent) + Send + Sync>;

type ListenerMap = Mutex<HashMap<u64, Listener>>;

/// Fan-out of wallet events to registered listeners
#[derive(Default)]
pub struct EventEmitter {
    next_id: AtomicU64,
    listeners: Arc<ListenerMap>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, listener);
        debug!(id, "wallet listener registered");

        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Deliver an event to every listener registered at call time
    pub fn emit(&self, event: &WalletEvent) {
        // Listeners may subscribe or dispose while handling, so call them unlocked
        let listeners: Vec<Listener> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// Disposer handle for one registered listener
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerMap>,
}

impl Subscription {
    pub fn dispose(self) {
        // Drop does the removal
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            if listeners.lock().remove(&self.id).is_some() {
                debug!(id = self.id, "wallet listener removed");
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_dispose_is_symmetric() {
        let emitter = EventEmitter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let first = emitter.subscribe(Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let h = hits.clone();
        let second = emitter.subscribe(Arc::new(move |_| {
            h.fetch_add(10, Ordering::SeqCst);
        }));
        assert_eq!(emitter.listener_count(), 2);

        emitter.emit(&WalletEvent::ChainChanged(1));
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        first.dispose();
        assert_eq!(emitter.listener_count(), 1);
        emitter.emit(&WalletEvent::ChainChanged(2));
        assert_eq!(hits.load(Ordering::SeqCst), 21);

        drop(second);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_subscription_outliving_emitter() {
        let emitter = EventEmitter::new();
        let sub = emitter.subscribe(Arc::new(|_| {}));
        drop(emitter);
        drop(sub);
    }
}
