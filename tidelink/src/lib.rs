//! Message-oriented transport over UDP: four channel delivery semantics
//! (unreliable, sequenced, reliable, reliable-fragmented), a connection
//! lifecycle with keep-alive/RTT tracking, and `Client`/`Server` nodes built
//! on top.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod frame;
pub mod node;
pub mod packet;
pub mod retransmit;
pub mod rtt;
pub mod seq;
pub mod socket;

pub use buffer::MAX_PACKET_SIZE;
pub use channel::{Channel, ChannelKind};
pub use config::{ChannelConfig, NodeConfig};
pub use connection::{Connection, ConnectionState, ConnectionStats};
pub use error::{Result, TransportError};
pub use events::{DisconnectCause, Event};
pub use node::{ChannelSpec, Client, Server};
