//! The client side of a node: a single connection slot, a malicious-source
//! check on every inbound datagram, and the connect-retry handshake.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::buffer::{BufferPool, MAX_PACKET_SIZE};
use crate::config::NodeConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{Result, TransportError};
use crate::events::{DisconnectCause, Event, EventBus};
use crate::frame::HeaderKind;
use crate::packet::ReadOnlyPacket;
use crate::socket::Socket;

use super::{dispatch_payload, ChannelSpec, DataHandler, DispatchQueue};

struct ClientInner {
    socket: Socket,
    pool: Arc<BufferPool>,
    config: NodeConfig,
    channel_specs: Vec<ChannelSpec>,
    events: Arc<EventBus>,
    connection: Mutex<Option<Arc<Connection>>>,
    server_addr: Mutex<Option<SocketAddr>>,
    is_automatic: bool,
    data_handler: Mutex<Option<DataHandler>>,
    dispatch: DispatchQueue,
    connect_notify: Arc<Notify>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn spawn_dispatch_loop(self: &Arc<Self>) {
        let mut rx = self.socket.spawn_receive_loop(MAX_PACKET_SIZE);
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            while let Some((peer, data)) = rx.recv().await {
                inner.handle_datagram(peer, data).await;
            }
        });
        *self.recv_task.lock() = Some(handle);
    }

    async fn handle_datagram(&self, peer: SocketAddr, data: Bytes) {
        let expected = *self.server_addr.lock();
        match expected {
            Some(server_addr) if peer == server_addr => {}
            Some(server_addr) => {
                tracing::warn!(
                    peer = %peer,
                    expected = %server_addr,
                    "datagram from unexpected source, dropping"
                );
                return;
            }
            None => return,
        }
        if let Err(e) = self.route(data).await {
            tracing::warn!(peer = %peer, error = %e, "failed to process inbound datagram");
        }
    }

    async fn route(&self, data: Bytes) -> Result<()> {
        let mut reader = ReadOnlyPacket::from_bytes(data);
        let header = HeaderKind::try_from(reader.read_u8()?)?;
        let Some(conn) = self.connection.lock().clone() else {
            return Ok(());
        };
        match header {
            HeaderKind::ConnectApproved => {
                conn.set_state(ConnectionState::Connected);
                self.connect_notify.notify_one();
                Ok(())
            }
            HeaderKind::Ping => conn.on_ping(&mut reader).await,
            HeaderKind::Pong => conn.on_pong(&mut reader).await,
            HeaderKind::Data => {
                let channel_id = reader.read_u8()?;
                let delivered = conn.on_data(channel_id, reader.remaining_slice()).await?;
                for payload in delivered {
                    dispatch_payload(
                        self.is_automatic,
                        &self.data_handler,
                        &self.dispatch,
                        conn.clone(),
                        channel_id,
                        payload,
                    );
                }
                Ok(())
            }
            HeaderKind::Acknowledgement => {
                let channel_id = reader.read_u8()?;
                conn.on_ack(channel_id, reader.remaining_slice()).await
            }
            HeaderKind::Disconnect => {
                conn.on_disconnect_received(DisconnectCause::ServerLogic);
                Ok(())
            }
            HeaderKind::Timeout => {
                conn.on_disconnect_received(DisconnectCause::Timeout);
                Ok(())
            }
            // A client never legitimately receives a Connect datagram.
            HeaderKind::Connect => Ok(()),
        }
    }
}

/// A single-connection client node.
pub struct Client(Arc<ClientInner>);

impl Client {
    /// Bind an ephemeral local socket and start the receive loop.
    /// `channel_specs` is the set of channels registered on the connection
    /// once `connect` succeeds.
    pub async fn new(
        config: NodeConfig,
        channel_specs: Vec<ChannelSpec>,
        is_automatic: bool,
    ) -> Result<Self> {
        let socket = Socket::bind("0.0.0.0:0".parse().unwrap(), config.clone()).await?;
        let inner = Arc::new(ClientInner {
            socket,
            pool: Arc::new(BufferPool::new(MAX_PACKET_SIZE, 8)),
            config,
            channel_specs,
            events: Arc::new(EventBus::new()),
            connection: Mutex::new(None),
            server_addr: Mutex::new(None),
            is_automatic,
            data_handler: Mutex::new(None),
            dispatch: DispatchQueue::default(),
            connect_notify: Arc::new(Notify::new()),
            recv_task: Mutex::new(None),
        });
        inner.spawn_dispatch_loop();
        Ok(Self(inner))
    }

    pub fn subscribe(&self, f: impl Fn(Event) + Send + Sync + 'static) {
        self.0.events.subscribe(f);
    }

    pub fn set_data_handler(
        &self,
        f: impl Fn(Arc<Connection>, u8, Bytes) + Send + Sync + 'static,
    ) {
        *self.0.data_handler.lock() = Some(Arc::new(f));
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.0.socket.local_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.0
            .connection
            .lock()
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// Attempt to connect, sending a `Connect` datagram up to `max_attempts`
    /// times, spaced by `delay_between_attempts`, until `ConnectApproved` is
    /// received.
    pub async fn connect(
        &self,
        addr: IpAddr,
        port: u16,
        max_attempts: u32,
        delay_between_attempts: Duration,
        connect_payload: &[u8],
    ) -> Result<Arc<Connection>> {
        let remote = SocketAddr::new(addr, port);
        let conn = Connection::new(
            remote,
            self.0.socket.handle(),
            self.0.pool.clone(),
            self.0.config.clone(),
            ConnectionState::Connecting,
        );
        for spec in &self.0.channel_specs {
            conn.register_channel(spec.id, spec.kind, spec.config.clone())?;
        }

        let events = self.0.events.clone();
        let inner = self.0.clone();
        conn.set_on_dispose(move |_conn, cause| {
            *inner.connection.lock() = None;
            *inner.server_addr.lock() = None;
            events.emit(Event::Disconnected(cause));
        });

        *self.0.server_addr.lock() = Some(remote);
        *self.0.connection.lock() = Some(conn.clone());
        self.0.events.emit(Event::Connecting(remote));

        for _ in 0..max_attempts {
            let notified = self.0.connect_notify.notified();
            tokio::pin!(notified);
            conn.send_connect(connect_payload).await?;
            if tokio::time::timeout(delay_between_attempts, &mut notified)
                .await
                .is_ok()
            {
                conn.spawn_background_tasks();
                self.0.events.emit(Event::Connected(conn.clone()));
                return Ok(conn);
            }
        }

        *self.0.connection.lock() = None;
        *self.0.server_addr.lock() = None;
        self.0.events.emit(Event::ConnectFailed(remote));
        Err(TransportError::ConnectFailed(max_attempts))
    }

    pub async fn disconnect(&self) -> Result<()> {
        let conn = self.0.connection.lock().clone();
        if let Some(conn) = conn {
            conn.send_disconnect().await?;
            conn.dispose(DisconnectCause::ClientLogic);
        }
        Ok(())
    }

    pub async fn send(&self, channel_id: u8, payload: &[u8]) -> Result<()> {
        let conn = self
            .0
            .connection
            .lock()
            .clone()
            .ok_or(TransportError::InvalidState("client is not connected"))?;
        conn.submit_send(channel_id, payload).await
    }

    /// Manual-dispatch drain point: swaps the delivery queue and invokes the
    /// data handler for everything that had queued up. A no-op (empty drain)
    /// in automatic mode.
    pub fn tick(&self) {
        let handler = self.0.data_handler.lock().clone();
        for item in self.0.dispatch.swap_and_drain() {
            if let Some(handler) = &handler {
                handler(item.connection, item.channel_id, item.payload);
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_fails_fast_against_a_silent_server() {
        let client = Client::new(NodeConfig::default(), Vec::new(), true)
            .await
            .unwrap();
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();

        let started = std::time::Instant::now();
        let result = client
            .connect(
                "127.0.0.1".parse().unwrap(),
                port,
                2,
                Duration::from_millis(20),
                b"",
            )
            .await;
        assert!(result.is_err());
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(!client.is_connected());
    }
}
