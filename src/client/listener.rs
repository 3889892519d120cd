//! Listener callbacks attached to an event source
//!
//! A [`Listener`] bundles up to three closures. The registry delivers to a
//! snapshot of its listeners, so listeners may subscribe or unsubscribe
//! from inside a callback. A panicking callback is caught and logged;
//! delivery continues with the next listener.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

use crate::error::SseError;
use crate::types::InboundEvent;

type EventCallback = Arc<dyn Fn(&InboundEvent) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&SseError) + Send + Sync>;
type CompleteCallback = Arc<dyn Fn() + Send + Sync>;

/// Callbacks for events, errors and completion; all optional
#[derive(Clone, Default)]
pub struct Listener {
    on_event: Option<EventCallback>,
    on_error: Option<ErrorCallback>,
    on_complete: Option<CompleteCallback>,
}

impl Listener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for every dispatched event, comment-only frames included
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(f));
        self
    }

    /// Called when a connection ends unexpectedly, before any reconnect
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&SseError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called once when the source is closed
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("on_event", &self.on_event.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered set of listeners
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<Listener>)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener; it receives only what is dispatched afterwards
    pub fn subscribe(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; false if it was not subscribed
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(candidate, _)| *candidate != id);
        before != listeners.len()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub fn dispatch_event(&self, event: &InboundEvent) {
        for (id, listener) in self.snapshot() {
            if let Some(callback) = &listener.on_event {
                guarded(id, "on_event", || callback(event));
            }
        }
    }

    pub fn dispatch_error(&self, err: &SseError) {
        for (id, listener) in self.snapshot() {
            if let Some(callback) = &listener.on_error {
                guarded(id, "on_error", || callback(err));
            }
        }
    }

    pub fn dispatch_complete(&self) {
        for (id, listener) in self.snapshot() {
            if let Some(callback) = &listener.on_complete {
                guarded(id, "on_complete", || callback());
            }
        }
    }

    fn snapshot(&self) -> Vec<(ListenerId, Arc<Listener>)> {
        self.listeners.read().clone()
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry").field("listeners", &self.len()).finish()
    }
}

fn guarded(id: ListenerId, callback: &'static str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(listener = id.0, callback, %message, "Listener panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Listener) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (events, errors, completes) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));
        let listener = Listener::new()
            .on_event(move |e| events.lock().push(format!("event:{}", e.read_data())))
            .on_error(move |e| errors.lock().push(format!("error:{}", e)))
            .on_complete(move || completes.lock().push("complete".to_string()));
        (log, listener)
    }

    fn event(data: &str) -> InboundEvent {
        InboundEvent {
            data: data.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_dispatch_in_subscription_order() {
        let registry = ListenerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            registry.subscribe(Listener::new().on_event(move |_| order.lock().push(n)));
        }

        registry.dispatch_event(&event("x"));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_each_callback_kind() {
        let registry = ListenerRegistry::new();
        let (log, listener) = recorder();
        registry.subscribe(listener);

        registry.dispatch_event(&event("a"));
        registry.dispatch_error(&SseError::transport("reset"));
        registry.dispatch_complete();

        assert_eq!(
            *log.lock(),
            vec![
                "event:a".to_string(),
                "error:transport failure: reset".to_string(),
                "complete".to_string(),
            ]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let registry = ListenerRegistry::new();
        let (log, listener) = recorder();
        let id = registry.subscribe(listener);

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.dispatch_event(&event("a"));
        assert!(log.lock().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_panicking_listener_does_not_stop_delivery() {
        let registry = ListenerRegistry::new();
        registry.subscribe(Listener::new().on_event(|_| panic!("listener bug")));
        let (log, listener) = recorder();
        registry.subscribe(listener);

        registry.dispatch_event(&event("a"));
        registry.dispatch_event(&event("b"));
        assert_eq!(*log.lock(), vec!["event:a".to_string(), "event:b".to_string()]);
    }

    #[test]
    fn test_subscribe_from_callback_applies_to_next_dispatch() {
        let registry = Arc::new(ListenerRegistry::new());
        let count = Arc::new(AtomicU64::new(0));
        {
            let registry_ref = Arc::clone(&registry);
            let count = Arc::clone(&count);
            registry.subscribe(Listener::new().on_event(move |_| {
                let count = Arc::clone(&count);
                registry_ref.subscribe(Listener::new().on_event(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }));
            }));
        }

        registry.dispatch_event(&event("a"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        registry.dispatch_event(&event("b"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
