//! Node lifecycle events, delivered to an ordered list of subscribers.
//!
//! A plain callback-registration style rather than a full actor/broadcast
//! framework: one `Vec` of boxed closures per node, invoked in registration
//! order under a short-lived lock.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::Connection;

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    ClientLogic,
    ServerLogic,
    Timeout,
}

/// A lifecycle event fired by a [`crate::node::Client`] or
/// [`crate::node::Server`].
#[derive(Clone)]
pub enum Event {
    ServerStarted,
    ServerStopped,
    ClientConnected(Arc<Connection>),
    ClientDisconnected(Arc<Connection>, DisconnectCause),
    /// Client-side: a Connect attempt has been sent.
    Connecting(SocketAddr),
    /// Client-side: ConnectApproved was received.
    Connected(Arc<Connection>),
    /// Client-side: `max_attempts` were exhausted with no approval.
    ConnectFailed(SocketAddr),
    /// Client-side: the connection was torn down.
    Disconnected(DisconnectCause),
}

type Subscriber = Box<dyn Fn(Event) + Send + Sync>;

/// An ordered list of event subscribers, invoked in registration order.
///
/// Subscriber bodies must not panic -- a faulting subscriber is an
/// application bug, not something the transport core can recover from, so
/// no `catch_unwind` wrapping is applied here.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Returns nothing: subscribers cannot currently
    /// be individually removed or unsubscribed.
    pub fn subscribe(&self, f: impl Fn(Event) + Send + Sync + 'static) {
        self.subscribers.lock().push(Box::new(f));
    }

    /// Fire `event` to every subscriber, in registration order.
    pub fn emit(&self, event: Event) {
        for sub in self.subscribers.lock().iter() {
            sub(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribers_fire_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.subscribe(move |_| o1.lock().push(1));
        let o2 = order.clone();
        bus.subscribe(move |_| o2.lock().push(2));

        bus.emit(Event::ServerStarted);
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn every_subscriber_observes_every_event() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = count.clone();
            bus.subscribe(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.emit(Event::ServerStopped);
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}
