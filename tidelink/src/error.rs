use thiserror::Error;

/// All errors produced by the tidelink transport core.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid port: {0}")]
    InvalidPort(u16),

    #[error("invalid packet loss {0}: must be within [0.0, 1.0]")]
    InvalidPacketLoss(f64),

    #[error("invalid latency window: min {min_ms}ms > max {max_ms}ms")]
    InvalidLatencyWindow { min_ms: u64, max_ms: u64 },

    #[error("invalid resend parameters: {0}")]
    InvalidResendConfig(&'static str),

    #[error("socket bind failed: {0}")]
    Bind(#[source] std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown header byte: 0x{0:02x}")]
    UnknownHeader(u8),

    #[error("acknowledgement received on unreliable channel {0}")]
    AckOnUnreliable(u8),

    #[error("datagram from unexpected source: {0}")]
    WrongSource(std::net::SocketAddr),

    #[error("malformed datagram: {0}")]
    Malformed(&'static str),

    #[error("channel {0} not found")]
    ChannelNotFound(u8),

    #[error("channel id {0} is reserved for built-in channels (240-255)")]
    ReservedChannelId(u8),

    #[error("payload too large: {size} bytes exceeds {max} on a non-fragmented channel")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("fragment count {0} exceeds the 32767 fragment limit")]
    TooManyFragments(usize),

    #[error("connection to {0} not found")]
    ConnectionNotFound(std::net::SocketAddr),

    #[error("connection attempt exhausted after {0} attempts")]
    ConnectFailed(u32),

    #[error("connection is not in the required state: {0}")]
    InvalidState(&'static str),

    #[error("buffer pool misuse: {0}")]
    BufferPoolMisuse(&'static str),

    #[error("node is closed")]
    NodeClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
