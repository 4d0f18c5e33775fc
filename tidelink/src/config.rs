//! Configuration for a node and its channels.
//!
//! Both [`NodeConfig`] and [`ChannelConfig`] are constructed through a plain
//! builder (setters returning `Self`, a fallible `build()`) rather than a
//! typestate scheme -- there is no ordering dependency between these fields
//! worth encoding in the type system.

use std::time::Duration;

use crate::error::{Result, TransportError};

/// Default `PeriodDuration`: the interval between keep-alive pings.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(1000);
/// Default `TimeoutDuration`: no packet from the peer for this long disposes
/// the connection.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(25);
/// Default `MaxResendAttempts` for a reliable channel.
pub const DEFAULT_MAX_RESEND_ATTEMPTS: u32 = 15;
/// Default `MinResendDelay` for a reliable channel.
pub const DEFAULT_MIN_RESEND_DELAY: Duration = Duration::from_millis(100);
/// Default `BackoffFactor` applied to the retransmit delay on every fire.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.2;
/// Default `AckBytes`: width of the acknowledgement bitfield, in bytes.
pub const DEFAULT_ACK_BYTES: usize = 2;

/// Node-wide configuration: socket buffers, the loss/latency simulator, and
/// the keep-alive/RTT parameters shared by every connection the node owns.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub packet_loss: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub send_buffer_size: Option<usize>,
    pub receive_buffer_size: Option<usize>,
    pub period: Duration,
    pub timeout: Duration,
    pub smoothing_factor: f64,
    pub deviation_factor: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            packet_loss: 0.0,
            min_latency_ms: 0,
            max_latency_ms: 0,
            send_buffer_size: None,
            receive_buffer_size: None,
            period: DEFAULT_PERIOD,
            timeout: DEFAULT_TIMEOUT,
            smoothing_factor: crate::rtt::DEFAULT_SMOOTHING_FACTOR,
            deviation_factor: crate::rtt::DEFAULT_DEVIATION_FACTOR,
        }
    }
}

impl NodeConfig {
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.packet_loss) {
            return Err(TransportError::InvalidPacketLoss(self.packet_loss));
        }
        if self.min_latency_ms > self.max_latency_ms {
            return Err(TransportError::InvalidLatencyWindow {
                min_ms: self.min_latency_ms,
                max_ms: self.max_latency_ms,
            });
        }
        Ok(())
    }
}

/// Builder for [`NodeConfig`]. Setters take `self` by value so calls chain;
/// `build()` runs the synchronous validation required by the configuration
/// error kind.
#[derive(Debug, Clone, Default)]
pub struct NodeConfigBuilder {
    inner: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn packet_loss(mut self, v: f64) -> Self {
        self.inner.packet_loss = v;
        self
    }

    pub fn latency_window(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.inner.min_latency_ms = min_ms;
        self.inner.max_latency_ms = max_ms;
        self
    }

    pub fn send_buffer_size(mut self, v: usize) -> Self {
        self.inner.send_buffer_size = Some(v);
        self
    }

    pub fn receive_buffer_size(mut self, v: usize) -> Self {
        self.inner.receive_buffer_size = Some(v);
        self
    }

    pub fn period(mut self, v: Duration) -> Self {
        self.inner.period = v;
        self
    }

    pub fn timeout(mut self, v: Duration) -> Self {
        self.inner.timeout = v;
        self
    }

    pub fn smoothing_factor(mut self, v: f64) -> Self {
        self.inner.smoothing_factor = v;
        self
    }

    pub fn deviation_factor(mut self, v: f64) -> Self {
        self.inner.deviation_factor = v;
        self
    }

    pub fn build(self) -> Result<NodeConfig> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

/// Per-channel configuration: retransmit pacing and the acknowledgement
/// bitfield width.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub max_resend_attempts: u32,
    pub min_resend_delay: Duration,
    pub backoff_factor: f64,
    pub ack_bytes: usize,
    pub name: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_resend_attempts: DEFAULT_MAX_RESEND_ATTEMPTS,
            min_resend_delay: DEFAULT_MIN_RESEND_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            ack_bytes: DEFAULT_ACK_BYTES,
            name: String::new(),
        }
    }
}

impl ChannelConfig {
    pub fn builder() -> ChannelConfigBuilder {
        ChannelConfigBuilder::default()
    }

    fn validate(&self) -> Result<()> {
        if self.max_resend_attempts == 0 {
            return Err(TransportError::InvalidResendConfig(
                "max_resend_attempts must be at least 1",
            ));
        }
        if self.backoff_factor < 1.0 {
            return Err(TransportError::InvalidResendConfig(
                "backoff_factor must be >= 1.0",
            ));
        }
        if self.ack_bytes == 0 || self.ack_bytes > 8 {
            return Err(TransportError::InvalidResendConfig(
                "ack_bytes must be within 1..=8",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChannelConfigBuilder {
    inner: ChannelConfig,
}

impl ChannelConfigBuilder {
    pub fn max_resend_attempts(mut self, v: u32) -> Self {
        self.inner.max_resend_attempts = v;
        self
    }

    pub fn min_resend_delay(mut self, v: Duration) -> Self {
        self.inner.min_resend_delay = v;
        self
    }

    pub fn backoff_factor(mut self, v: f64) -> Self {
        self.inner.backoff_factor = v;
        self
    }

    pub fn ack_bytes(mut self, v: usize) -> Self {
        self.inner.ack_bytes = v;
        self
    }

    pub fn name(mut self, v: impl Into<String>) -> Self {
        self.inner.name = v.into();
        self
    }

    pub fn build(self) -> Result<ChannelConfig> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(NodeConfig::builder().build().is_ok());
        assert!(ChannelConfig::builder().build().is_ok());
    }

    #[test]
    fn rejects_packet_loss_out_of_range() {
        let err = NodeConfig::builder().packet_loss(1.5).build().unwrap_err();
        assert!(matches!(err, TransportError::InvalidPacketLoss(_)));
    }

    #[test]
    fn rejects_inverted_latency_window() {
        let err = NodeConfig::builder()
            .latency_window(500, 200)
            .build()
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidLatencyWindow { .. }));
    }

    #[test]
    fn rejects_zero_resend_attempts() {
        let err = ChannelConfig::builder()
            .max_resend_attempts(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidResendConfig(_)));
    }

    #[test]
    fn rejects_sub_unity_backoff() {
        let err = ChannelConfig::builder()
            .backoff_factor(0.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidResendConfig(_)));
    }
}
