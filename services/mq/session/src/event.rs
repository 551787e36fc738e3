//! Explicit fan-out of session and endpoint events.
//!
//! Handlers run in registration order. The handler list is snapshotted
//! before invocation so a handler may subscribe, emit or disconnect the
//! owning session without deadlocking.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A list of subscribers for one event kind
pub struct EventHub<T> {
    handlers: Mutex<Vec<Handler<T>>>,
}

impl<T> EventHub<T> {
    /// Create an empty hub
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler; it runs after every handler registered before it
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.handlers.lock().push(Arc::new(handler));
    }

    /// Invoke every handler with `value`
    pub fn emit(&self, value: &T) {
        let handlers = self.handlers.lock().clone();
        for handler in handlers {
            handler(value);
        }
    }

    /// Drop all handlers
    pub fn clear(&self) {
        self.handlers.lock().clear();
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EventHub<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("handlers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handlers_run_in_registration_order() {
        let hub = EventHub::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3u32 {
            let seen = seen.clone();
            hub.subscribe(move |v| seen.lock().push((tag, *v)));
        }

        hub.emit(&7);
        assert_eq!(*seen.lock(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_handler_may_subscribe_during_emit() {
        let hub = Arc::new(EventHub::<()>::new());
        let inner = hub.clone();
        hub.subscribe(move |_| inner.subscribe(|_| {}));

        hub.emit(&());
        assert_eq!(hub.len(), 2);

        hub.clear();
        assert!(hub.is_empty());
    }
}
