//! Per-remote-endpoint virtual connection: handshake-adjacent state,
//! keep-alive ping/pong driving the RTT estimator, timeout tracking, and the
//! up-to-256-slot channel table.
//!
//! `Connection` is a thin per-endpoint record; its real behaviour lives in
//! the four [`crate::channel::Channel`]s it owns. State machine transitions
//! and the keep-alive/retransmit background tasks are driven from here.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::buffer::BufferPool;
use crate::channel::{Channel, ChannelKind};
use crate::config::{ChannelConfig, NodeConfig};
use crate::error::{Result, TransportError};
use crate::events::DisconnectCause;
use crate::frame::{self, HeaderKind};
use crate::packet::{Packet, ReadOnlyPacket};
use crate::rtt::RttEstimator;

/// Lifecycle state of a virtual connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    pub sent: u64,
    pub received: u64,
    pub resent: u64,
    pub duplicated: u64,
    pub out_of_order: u64,
}

const CHANNEL_SLOTS: usize = 256;
/// How often a reliable channel's retransmit heap is polled. Independent of
/// the keep-alive period: retransmit deadlines are typically much shorter
/// than `PeriodDuration`.
const RETRANSMIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

type DisposeHook = Box<dyn FnOnce(Arc<Connection>, DisconnectCause) + Send>;

/// One remote endpoint's worth of transport state.
pub struct Connection {
    remote: SocketAddr,
    socket: Arc<UdpSocket>,
    pool: Arc<BufferPool>,
    config: NodeConfig,
    state: Mutex<ConnectionState>,
    channels: Mutex<Vec<Option<Arc<Channel>>>>,
    rtt: Mutex<RttEstimator>,
    pending_pings: Mutex<std::collections::HashMap<u8, Instant>>,
    next_ping_id: AtomicU8,
    last_activity: Mutex<Instant>,
    sent: AtomicU64,
    received: AtomicU64,
    resent: AtomicU64,
    disposed: AtomicBool,
    on_dispose: Mutex<Option<DisposeHook>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(
        remote: SocketAddr,
        socket: Arc<UdpSocket>,
        pool: Arc<BufferPool>,
        config: NodeConfig,
        initial_state: ConnectionState,
    ) -> Arc<Self> {
        let rtt = RttEstimator::with_factors(config.smoothing_factor, config.deviation_factor);
        Arc::new(Self {
            remote,
            socket,
            pool,
            config,
            state: Mutex::new(initial_state),
            channels: Mutex::new(vec![None; CHANNEL_SLOTS]),
            rtt: Mutex::new(rtt),
            pending_pings: Mutex::new(std::collections::HashMap::new()),
            next_ping_id: AtomicU8::new(0),
            last_activity: Mutex::new(Instant::now()),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            resent: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            on_dispose: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Install the hook invoked exactly once when this connection is
    /// disposed (timeout, local/remote disconnect). The node uses this to
    /// remove the connection from its table and fire the corresponding
    /// lifecycle event.
    pub fn set_on_dispose(&self, hook: impl FnOnce(Arc<Connection>, DisconnectCause) + Send + 'static) {
        *self.on_dispose.lock() = Some(Box::new(hook));
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Start the keep-alive loop. Must be called once, after the connection
    /// has been wrapped in its final `Arc` (so the spawned task can hold a
    /// clone).
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let conn = self.clone();
        let handle = tokio::spawn(async move { conn.keepalive_loop().await });
        self.tasks.lock().push(handle);
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.period);
        loop {
            interval.tick().await;
            if self.disposed.load(Ordering::SeqCst) {
                return;
            }
            let idle = self.last_activity.lock().elapsed();
            if idle >= self.config.timeout {
                tracing::debug!(peer = %self.remote, "connection timed out");
                self.dispose(DisconnectCause::Timeout);
                return;
            }
            let id = self.next_ping_id.fetch_add(1, Ordering::Relaxed);
            let now = Instant::now();
            self.pending_pings.lock().insert(id, now);
            let send_time_micros = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_micros() as u64)
                .unwrap_or(0);
            let packet = frame::build_ping(&self.pool, id, send_time_micros);
            let _ = self.send_packet(packet).await;
        }
    }

    /// Register a channel and, for the reliable kinds, start its retransmit
    /// poll task.
    pub fn register_channel(
        self: &Arc<Self>,
        id: u8,
        kind: ChannelKind,
        config: ChannelConfig,
    ) -> Result<()> {
        frame::validate_user_channel_id(id)?;
        let channel = Arc::new(Channel::new(id, kind, config));
        self.channels.lock()[id as usize] = Some(channel);
        if kind.supports_ack() {
            self.spawn_retransmit_task(id);
        }
        Ok(())
    }

    fn spawn_retransmit_task(self: &Arc<Self>, channel_id: u8) {
        let conn = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETRANSMIT_POLL_INTERVAL);
            loop {
                interval.tick().await;
                if conn.disposed.load(Ordering::SeqCst) {
                    return;
                }
                let Ok(channel) = conn.channel(channel_id) else {
                    return;
                };
                let base_delay_ms = conn.rtt.lock().base_delay_ms();
                let (due, given_up) = channel.poll_retransmits(Instant::now(), base_delay_ms);
                for entry in due {
                    conn.resent.fetch_add(1, Ordering::Relaxed);
                    let _ = conn
                        .send_framed(HeaderKind::Data, channel_id, &entry.payload)
                        .await;
                }
                if !given_up.is_empty() {
                    tracing::warn!(
                        peer = %conn.remote,
                        channel_id,
                        count = given_up.len(),
                        "reliability exhausted, disposing connection"
                    );
                    conn.dispose(DisconnectCause::Timeout);
                    return;
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn channel(&self, id: u8) -> Result<Arc<Channel>> {
        self.channels
            .lock()
            .get(id as usize)
            .and_then(|c| c.clone())
            .ok_or(TransportError::ChannelNotFound(id))
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        match self.socket.send_to(data, self.remote).await {
            Ok(_) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                tracing::info!(peer = %self.remote, error = %e, "transient send error");
                Err(TransportError::Io(e))
            }
        }
    }

    async fn send_packet(&self, packet: Packet) -> Result<()> {
        let result = self.send_raw(packet.as_slice()).await;
        self.pool.release(packet.into_buffer())?;
        result
    }

    async fn send_framed(&self, header: HeaderKind, channel_id: u8, body: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(2 + body.len());
        buf.put_u8(header as u8);
        buf.put_u8(channel_id);
        buf.put_slice(body);
        self.send_raw(&buf).await
    }

    pub async fn send_connect(&self, payload: &[u8]) -> Result<()> {
        let packet = frame::build_connect(&self.pool, payload);
        self.send_packet(packet).await
    }

    pub async fn send_connect_approved(&self) -> Result<()> {
        let packet = frame::build_connect_approved(&self.pool);
        self.send_packet(packet).await
    }

    pub async fn send_disconnect(&self) -> Result<()> {
        let packet = frame::build_disconnect(&self.pool);
        self.send_packet(packet).await
    }

    /// Frame and transmit `payload` on `channel_id`, registering pending
    /// retransmit state for reliable channels.
    pub async fn submit_send(&self, channel_id: u8, payload: &[u8]) -> Result<()> {
        let channel = self.channel(channel_id)?;
        let base_delay_ms = self.rtt.lock().base_delay_ms();
        let frames = channel.submit_send(payload, base_delay_ms, Instant::now())?;
        for frame in frames {
            self.send_framed(HeaderKind::Data, channel_id, &frame).await?;
        }
        Ok(())
    }

    /// Feed an inbound `Data` datagram body through its channel, returning
    /// payloads now ready for the application, and sending any resulting
    /// acknowledgement.
    pub async fn on_data(&self, channel_id: u8, body: &[u8]) -> Result<Vec<bytes::Bytes>> {
        self.touch();
        self.received.fetch_add(1, Ordering::Relaxed);
        let channel = self.channel(channel_id)?;
        let outcome = channel.on_data(body)?;
        if let Some(ack) = outcome.ack {
            let encoded = ack.encode();
            self.send_framed(HeaderKind::Acknowledgement, channel_id, &encoded)
                .await?;
        }
        Ok(outcome.delivered)
    }

    pub async fn on_ack(&self, channel_id: u8, body: &[u8]) -> Result<()> {
        self.touch();
        self.received.fetch_add(1, Ordering::Relaxed);
        let channel = self.channel(channel_id)?;
        channel.on_ack(body)
    }

    pub async fn on_ping(&self, reader: &mut ReadOnlyPacket) -> Result<()> {
        self.touch();
        self.received.fetch_add(1, Ordering::Relaxed);
        let ping = frame::parse_ping(reader)?;
        let pong = frame::build_pong(&self.pool, ping.ping_id);
        self.send_packet(pong).await
    }

    pub async fn on_pong(&self, reader: &mut ReadOnlyPacket) -> Result<()> {
        self.touch();
        self.received.fetch_add(1, Ordering::Relaxed);
        let pong = frame::parse_pong(reader)?;
        if let Some(sent_at) = self.pending_pings.lock().remove(&pong.ping_id) {
            self.rtt.lock().update(sent_at.elapsed());
        }
        Ok(())
    }

    /// A `Disconnect` datagram arrived from the peer.
    pub fn on_disconnect_received(self: &Arc<Self>, cause: DisconnectCause) {
        self.touch();
        self.received.fetch_add(1, Ordering::Relaxed);
        self.dispose(cause);
    }

    /// Tear the connection down: close every channel, cancel its background
    /// tasks, and invoke the dispose hook exactly once.
    pub fn dispose(self: &Arc<Self>, cause: DisconnectCause) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = ConnectionState::Disconnected;
        for ch in self.channels.lock().iter().flatten() {
            ch.close();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(hook) = self.on_dispose.lock().take() {
            hook(self.clone(), cause);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn rtt_estimate(&self) -> Option<Duration> {
        self.rtt.lock().smooth_rtt()
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut duplicated = 0;
        let mut out_of_order = 0;
        for ch in self.channels.lock().iter().flatten() {
            let s = ch.stats();
            duplicated += s.duplicated;
            out_of_order += s.out_of_order;
        }
        ConnectionStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            resent: self.resent.load(Ordering::Relaxed),
            duplicated,
            out_of_order,
        }
    }
}
