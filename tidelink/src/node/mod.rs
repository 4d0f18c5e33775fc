//! Node dispatch: the pieces shared between [`client::Client`] and
//! [`server::Server`] -- a channel set applied uniformly to every
//! connection, the automatic-vs-manual delivery queue, and the lifecycle
//! event bus.

pub mod client;
pub mod server;

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::channel::ChannelKind;
use crate::config::ChannelConfig;
use crate::connection::Connection;

pub use client::Client;
pub use server::Server;

/// A channel to register, uniformly, on every connection a node owns.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub id: u8,
    pub kind: ChannelKind,
    pub config: ChannelConfig,
}

impl ChannelSpec {
    pub fn new(id: u8, kind: ChannelKind, config: ChannelConfig) -> Self {
        Self { id, kind, config }
    }
}

/// Invoked once per delivered application payload, in either dispatch mode.
pub type DataHandler = Arc<dyn Fn(Arc<Connection>, u8, Bytes) + Send + Sync>;

/// Application hook deciding whether to accept an incoming `Connect`.
/// Defaults to accepting everything. Must not panic: a fault here is caught
/// at the boundary and treated as a decline.
pub type ConnectionValidator = Arc<dyn Fn(std::net::SocketAddr, &[u8]) -> bool + Send + Sync>;

/// Application hook run after a connection is created and its standard
/// channel set registered, before `ConnectApproved` is sent. May install
/// additional application-specific channels.
pub type ConnectionInitializer = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

pub(crate) fn default_validator() -> ConnectionValidator {
    Arc::new(|_addr, _payload| true)
}

pub(crate) fn default_initializer() -> ConnectionInitializer {
    Arc::new(|_conn| {})
}

/// One application-payload delivery, queued for manual-dispatch `tick()`.
pub(crate) struct QueuedDelivery {
    pub connection: Arc<Connection>,
    pub channel_id: u8,
    pub payload: Bytes,
}

/// Double-buffered delivery queue backing manual dispatch: the
/// receive path appends to the producer side; `tick()` atomically swaps
/// producer and consumer and drains the consumer side on the caller's
/// thread.
#[derive(Default)]
pub(crate) struct DispatchQueue {
    producer: Mutex<VecDeque<QueuedDelivery>>,
    consumer: Mutex<VecDeque<QueuedDelivery>>,
}

impl DispatchQueue {
    pub fn push(&self, item: QueuedDelivery) {
        self.producer.lock().push_back(item);
    }

    /// Swap the producer queue in, returning everything that was pending.
    pub fn swap_and_drain(&self) -> Vec<QueuedDelivery> {
        let mut consumer = self.consumer.lock();
        std::mem::swap(&mut *consumer, &mut *self.producer.lock());
        consumer.drain(..).collect()
    }
}

/// Dispatch an inbound application payload per the node's `is_automatic`
/// setting: invoke the handler inline, or queue it for `tick()`.
pub(crate) fn dispatch_payload(
    is_automatic: bool,
    handler: &Mutex<Option<DataHandler>>,
    queue: &DispatchQueue,
    connection: Arc<Connection>,
    channel_id: u8,
    payload: Bytes,
) {
    if is_automatic {
        if let Some(handler) = handler.lock().as_ref() {
            handler(connection, channel_id, payload);
        }
    } else {
        queue.push(QueuedDelivery {
            connection,
            channel_id,
            payload,
        });
    }
}
