//! In-process typed publish/subscribe for runtime lifecycle events.
//! Publication is synchronous; each subscriber is fenced so a panicking
//! callback is logged and the rest still run.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::RwLock;
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Starting,
    Started,
    Stopping { reason: String },
    Stopped,
    Error { message: String },
    ListenerStarted { addr: SocketAddr },
    ListenerStopped { addr: SocketAddr },
}

type Subscriber = Box<dyn Fn(&LifecycleEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: impl Fn(&LifecycleEvent) + Send + Sync + 'static) {
        self.subscribers.write().unwrap().push(Box::new(subscriber));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }

    /// Deliver `event` to every subscriber in registration order. A
    /// panicking subscriber never starves the others or the caller.
    pub fn publish(&self, event: &LifecycleEvent) {
        let subscribers = self.subscribers.read().unwrap();
        for subscriber in subscribers.iter() {
            if catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                error!("events: subscriber panicked on {:?}", event);
            }
        }
    }
}
