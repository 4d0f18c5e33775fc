//! The server side of a node: a concurrent endpoint-to-connection table,
//! inline `Connect` handling with an application validator/initializer,
//! and the `send_to_one/many/all` broadcast helpers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::buffer::{BufferPool, MAX_PACKET_SIZE};
use crate::config::NodeConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::{Result, TransportError};
use crate::events::{DisconnectCause, Event, EventBus};
use crate::frame::HeaderKind;
use crate::packet::ReadOnlyPacket;
use crate::socket::Socket;

use super::{
    default_initializer, default_validator, dispatch_payload, ChannelSpec, ConnectionInitializer,
    ConnectionValidator, DataHandler, DispatchQueue,
};

type ConnectionTable = Arc<DashMap<SocketAddr, Arc<Connection>>>;

struct ServerInner {
    socket: Mutex<Option<Socket>>,
    pool: Arc<BufferPool>,
    config: NodeConfig,
    channel_specs: Vec<ChannelSpec>,
    events: Arc<EventBus>,
    connections: ConnectionTable,
    validator: Mutex<ConnectionValidator>,
    initializer: Mutex<ConnectionInitializer>,
    is_automatic: bool,
    data_handler: Mutex<Option<DataHandler>>,
    dispatch: DispatchQueue,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerInner {
    async fn handle_datagram(self: &Arc<Self>, peer: SocketAddr, data: Bytes) {
        if let Err(e) = self.route(peer, data).await {
            tracing::warn!(peer = %peer, error = %e, "failed to process inbound datagram");
        }
    }

    async fn route(self: &Arc<Self>, peer: SocketAddr, data: Bytes) -> Result<()> {
        let mut reader = ReadOnlyPacket::from_bytes(data);
        let header = HeaderKind::try_from(reader.read_u8()?)?;

        if header == HeaderKind::Connect {
            return self.handle_connect(peer, reader).await;
        }

        let Some(conn) = self.connections.get(&peer).map(|e| e.value().clone()) else {
            tracing::debug!(peer = %peer, "datagram from unknown connection, dropping");
            return Ok(());
        };
        match header {
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
                conn.on_disconnect_received(DisconnectCause::ClientLogic);
                Ok(())
            }
            HeaderKind::Timeout => {
                conn.on_disconnect_received(DisconnectCause::Timeout);
                Ok(())
            }
            // Already handled above; a server never re-approves inline here.
            HeaderKind::Connect | HeaderKind::ConnectApproved => Ok(()),
        }
    }

    /// An existing connected peer retrying `Connect` gets an idempotent
    /// re-approval (its first approval may have been lost); a new peer goes
    /// through the validator and, on acceptance, gets its connection created.
    async fn handle_connect(self: &Arc<Self>, peer: SocketAddr, mut reader: ReadOnlyPacket) -> Result<()> {
        if let Some(entry) = self.connections.get(&peer) {
            let conn = entry.value().clone();
            drop(entry);
            if conn.is_connected() {
                conn.send_connect_approved().await?;
            }
            return Ok(());
        }

        let payload = reader.read_rest();
        let validator = self.validator.lock().clone();
        let accepted = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            validator(peer, &payload)
        }))
        .unwrap_or_else(|_| {
            tracing::warn!(peer = %peer, "connection validator panicked, treating as declined");
            false
        });
        if !accepted {
            tracing::debug!(peer = %peer, "connection rejected by validator");
            return Ok(());
        }

        let socket_handle = {
            let guard = self.socket.lock();
            let socket = guard.as_ref().ok_or(TransportError::InvalidState("server not started"))?;
            socket.handle()
        };
        let conn = Connection::new(
            peer,
            socket_handle,
            self.pool.clone(),
            self.config.clone(),
            ConnectionState::Connected,
        );
        for spec in &self.channel_specs {
            conn.register_channel(spec.id, spec.kind, spec.config.clone())?;
        }

        let initializer = self.initializer.lock().clone();
        let conn_for_init = conn.clone();
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| initializer(&conn_for_init))).is_err() {
            tracing::warn!(peer = %peer, "connection initializer panicked");
        }

        let connections = self.connections.clone();
        let events = self.events.clone();
        conn.set_on_dispose(move |conn, cause| {
            connections.remove(&conn.remote_addr());
            events.emit(Event::ClientDisconnected(conn, cause));
        });

        self.connections.insert(peer, conn.clone());
        conn.spawn_background_tasks();
        conn.send_connect_approved().await?;
        self.events.emit(Event::ClientConnected(conn));
        Ok(())
    }
}

/// A multi-connection server node.
pub struct Server(Arc<ServerInner>);

impl Server {
    /// Construct an unbound server. Channels in `channel_specs` are
    /// registered on every accepted connection. Call [`Server::start`] to
    /// bind a socket and begin accepting.
    pub fn new(config: NodeConfig, channel_specs: Vec<ChannelSpec>, is_automatic: bool) -> Self {
        Self(Arc::new(ServerInner {
            socket: Mutex::new(None),
            pool: Arc::new(BufferPool::new(MAX_PACKET_SIZE, 32)),
            config,
            channel_specs,
            events: Arc::new(EventBus::new()),
            connections: Arc::new(DashMap::new()),
            validator: Mutex::new(default_validator()),
            initializer: Mutex::new(default_initializer()),
            is_automatic,
            data_handler: Mutex::new(None),
            dispatch: DispatchQueue::default(),
            recv_task: Mutex::new(None),
        }))
    }

    pub fn subscribe(&self, f: impl Fn(Event) + Send + Sync + 'static) {
        self.0.events.subscribe(f);
    }

    pub fn set_data_handler(&self, f: impl Fn(Arc<Connection>, u8, Bytes) + Send + Sync + 'static) {
        *self.0.data_handler.lock() = Some(Arc::new(f));
    }

    /// Install the accept-time validator. Must not panic; a panic is caught
    /// at the boundary and treated as a decline.
    pub fn set_connection_validator(&self, f: impl Fn(SocketAddr, &[u8]) -> bool + Send + Sync + 'static) {
        *self.0.validator.lock() = Arc::new(f);
    }

    /// Install the post-accept initializer, run once per new connection
    /// before `ConnectApproved` is sent.
    pub fn set_connection_initializer(&self, f: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        *self.0.initializer.lock() = Arc::new(f);
    }

    /// Bind `0.0.0.0:port` and start accepting connections.
    pub async fn start(&self, port: u16) -> Result<()> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = Socket::bind(addr, self.0.config.clone()).await?;
        let mut rx = socket.spawn_receive_loop(MAX_PACKET_SIZE);
        *self.0.socket.lock() = Some(socket);

        let inner = self.0.clone();
        let handle = tokio::spawn(async move {
            while let Some((peer, data)) = rx.recv().await {
                inner.handle_datagram(peer, data).await;
            }
        });
        *self.0.recv_task.lock() = Some(handle);
        self.0.events.emit(Event::ServerStarted);
        Ok(())
    }

    /// Stop accepting, tear down every connection, and clear the table.
    pub fn stop(&self) {
        if let Some(task) = self.0.recv_task.lock().take() {
            task.abort();
        }
        *self.0.socket.lock() = None;
        for entry in self.0.connections.iter() {
            entry.value().dispose(DisconnectCause::ServerLogic);
        }
        self.0.connections.clear();
        self.0.events.emit(Event::ServerStopped);
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self.0.socket.lock().as_ref() {
            Some(s) => s.local_addr(),
            None => Err(TransportError::InvalidState("server not started")),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.0.connections.len()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.0.connections.iter().map(|e| e.value().clone()).collect()
    }

    pub fn connection(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        self.0.connections.get(&addr).map(|e| e.value().clone())
    }

    pub async fn send_to_one(&self, addr: SocketAddr, channel_id: u8, payload: &[u8]) -> Result<()> {
        let conn = self
            .0
            .connections
            .get(&addr)
            .map(|e| e.value().clone())
            .ok_or(TransportError::ConnectionNotFound(addr))?;
        conn.submit_send(channel_id, payload).await
    }

    /// Send to every connected peer except those in `exclude`.
    pub async fn send_to_many(&self, exclude: &[SocketAddr], channel_id: u8, payload: &[u8]) -> Result<()> {
        let targets: Vec<Arc<Connection>> = self
            .0
            .connections
            .iter()
            .filter(|e| !exclude.contains(e.key()))
            .map(|e| e.value().clone())
            .collect();
        for conn in targets {
            conn.submit_send(channel_id, payload).await?;
        }
        Ok(())
    }

    pub async fn send_to_all(&self, channel_id: u8, payload: &[u8]) -> Result<()> {
        self.send_to_many(&[], channel_id, payload).await
    }

    /// Forcibly disconnect a peer, as the server's own decision.
    pub fn kick(&self, addr: SocketAddr) {
        if let Some((_, conn)) = self.0.connections.remove(&addr) {
            conn.dispose(DisconnectCause::ServerLogic);
        }
    }

    /// Manual-dispatch drain point, mirroring [`super::Client::tick`].
    pub fn tick(&self) {
        let handler = self.0.data_handler.lock().clone();
        for item in self.0.dispatch.swap_and_drain() {
            if let Some(handler) = &handler {
                handler(item.connection, item.channel_id, item.payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::channel::ChannelKind;
    use crate::config::ChannelConfig;
    use crate::node::Client;

    fn reliable_channel(id: u8) -> ChannelSpec {
        ChannelSpec::new(id, ChannelKind::Reliable { ordered: true }, ChannelConfig::default())
    }

    #[tokio::test]
    async fn client_connects_and_is_tracked() {
        let server = Server::new(NodeConfig::default(), vec![reliable_channel(0)], true);
        server.start(0).await.unwrap();
        let port = server.local_addr().unwrap().port();

        let client = Client::new(NodeConfig::default(), vec![reliable_channel(0)], true)
            .await
            .unwrap();
        client
            .connect("127.0.0.1".parse().unwrap(), port, 5, Duration::from_millis(100), b"")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.connection_count(), 1);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn validator_rejection_fails_the_connect_attempt() {
        let server = Server::new(NodeConfig::default(), vec![reliable_channel(0)], true);
        server.set_connection_validator(|_addr, _payload| false);
        server.start(0).await.unwrap();
        let port = server.local_addr().unwrap().port();

        let client = Client::new(NodeConfig::default(), vec![reliable_channel(0)], true)
            .await
            .unwrap();
        let result = client
            .connect("127.0.0.1".parse().unwrap(), port, 2, Duration::from_millis(30), b"")
            .await;
        assert!(result.is_err());
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn kick_disposes_and_removes_the_connection() {
        let server = Server::new(NodeConfig::default(), vec![reliable_channel(0)], true);
        server.start(0).await.unwrap();
        let port = server.local_addr().unwrap().port();

        let disconnects = Arc::new(AtomicUsize::new(0));
        let d = disconnects.clone();
        server.subscribe(move |event| {
            if let Event::ClientDisconnected(_, DisconnectCause::ServerLogic) = event {
                d.fetch_add(1, Ordering::SeqCst);
            }
        });

        let client = Client::new(NodeConfig::default(), vec![reliable_channel(0)], true)
            .await
            .unwrap();
        client
            .connect("127.0.0.1".parse().unwrap(), port, 5, Duration::from_millis(100), b"")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let addr = server.connections()[0].remote_addr();
        server.kick(addr);
        assert_eq!(server.connection_count(), 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }
}
