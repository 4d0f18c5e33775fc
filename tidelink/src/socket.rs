//! UDP socket ownership: bind, an async receive loop handed off as a queue
//! of `(peer, datagram)` pairs, and the optional loss/latency simulator
//! applied to inbound traffic only, immediately after a datagram arrives on
//! the socket task and before any dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use rand::rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::NodeConfig;
use crate::error::{Result, TransportError};

/// Depth of the channel between the receive task and its consumer. Generous
/// enough to absorb a burst of simulated-latency datagrams completing
/// out of order without backpressuring the socket read.
const INBOUND_QUEUE_DEPTH: usize = 1024;

/// A bound UDP socket plus the node-wide loss/latency simulator config.
pub struct Socket {
    udp: Arc<UdpSocket>,
    config: NodeConfig,
}

impl Socket {
    pub async fn bind(addr: SocketAddr, config: NodeConfig) -> Result<Self> {
        let std_socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .map_err(TransportError::Bind)?;
        std_socket
            .set_nonblocking(true)
            .map_err(TransportError::Bind)?;
        if let Some(size) = config.send_buffer_size {
            let _ = std_socket.set_send_buffer_size(size);
        }
        if let Some(size) = config.receive_buffer_size {
            let _ = std_socket.set_recv_buffer_size(size);
        }
        std_socket
            .bind(&addr.into())
            .map_err(TransportError::Bind)?;
        let udp = UdpSocket::from_std(std_socket.into()).map_err(TransportError::Bind)?;
        Ok(Self {
            udp: Arc::new(udp),
            config,
        })
    }

    /// A clone of the socket handle, for a [`crate::connection::Connection`]
    /// to send on directly (outbound traffic bypasses the simulator).
    pub fn handle(&self) -> Arc<UdpSocket> {
        self.udp.clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.udp.local_addr().map_err(TransportError::Io)
    }

    /// Spawn the receive loop and return the consumer end of its inbound
    /// datagram queue. `max_datagram_size` bounds the read buffer (should be
    /// at least [`crate::buffer::MAX_PACKET_SIZE`]).
    pub fn spawn_receive_loop(&self, max_datagram_size: usize) -> mpsc::Receiver<(SocketAddr, Bytes)> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let udp = self.udp.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; max_datagram_size];
            loop {
                let (n, peer) = match udp.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::info!(error = %e, "transient receive error");
                        continue;
                    }
                };
                if should_drop(&config) {
                    tracing::debug!(peer = %peer, "simulated packet loss: dropping inbound datagram");
                    continue;
                }
                let data = Bytes::copy_from_slice(&buf[..n]);
                let delay = sample_latency(&config);
                if delay.is_zero() {
                    if tx.send((peer, data)).await.is_err() {
                        return;
                    }
                } else {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send((peer, data)).await;
                    });
                }
            }
        });
        rx
    }
}

fn should_drop(config: &NodeConfig) -> bool {
    config.packet_loss > 0.0 && rand::random::<f64>() < config.packet_loss
}

fn sample_latency(config: &NodeConfig) -> Duration {
    if config.max_latency_ms == 0 {
        return Duration::ZERO;
    }
    let span = config.max_latency_ms.saturating_sub(config.min_latency_ms);
    let extra = if span > 0 {
        rng().random_range(0..=span)
    } else {
        0
    };
    Duration::from_millis(config.min_latency_ms + extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_reports_assigned_local_addr() {
        let socket = Socket::bind("127.0.0.1:0".parse().unwrap(), NodeConfig::default())
            .await
            .unwrap();
        assert_eq!(socket.local_addr().unwrap().ip().to_string(), "127.0.0.1");
    }

    #[tokio::test]
    async fn datagrams_pass_through_with_no_simulation_configured() {
        let socket = Socket::bind("127.0.0.1:0".parse().unwrap(), NodeConfig::default())
            .await
            .unwrap();
        let addr = socket.local_addr().unwrap();
        let mut rx = socket.spawn_receive_loop(1024);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"ping", addr).await.unwrap();

        let (_peer, data) = rx.recv().await.unwrap();
        assert_eq!(&data[..], b"ping");
    }

    #[test]
    fn full_packet_loss_always_drops() {
        let config = NodeConfig::builder().packet_loss(1.0).build().unwrap();
        assert!(should_drop(&config));
    }

    #[test]
    fn no_packet_loss_never_drops() {
        let config = NodeConfig::default();
        assert!(!should_drop(&config));
    }

    #[test]
    fn latency_window_bounds_the_sample() {
        let config = NodeConfig::builder().latency_window(50, 100).build().unwrap();
        for _ in 0..100 {
            let d = sample_latency(&config);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(100));
        }
    }
}
