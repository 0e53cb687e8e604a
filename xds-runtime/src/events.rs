//! Typed synchronous fan-out used for the node's public events.

use std::sync::Mutex;

use tracing::trace;

/// Fan-out publisher for one event type.
///
/// Subscribers register callbacks; `publish` invokes them in
/// registration order on the publishing thread, so event ordering
/// guarantees (chain order, disconnect-before-connect) follow from
/// the publisher's own call order.
pub struct EventBus<E> {
    subscribers: Mutex<Vec<Subscriber<E>>>,
}

type Callback<E> = Box<dyn Fn(&E) + Send + Sync>;

struct Subscriber<E> {
    name: &'static str,
    callback: Callback<E>,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, name: &'static str, callback: impl Fn(&E) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .expect("lock is never poisoned")
            .push(Subscriber {
                name,
                callback: Box::new(callback),
            });
    }

    pub fn publish(&self, event: E) {
        let subscribers = self.subscribers.lock().expect("lock is never poisoned");

        for subscriber in subscribers.iter() {
            trace!(subscriber = subscriber.name, "delivering event");
            (subscriber.callback)(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("lock is never poisoned")
            .len()
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
