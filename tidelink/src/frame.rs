//! Header taxonomy and datagram framing (wire protocol, little-endian).
//!
//! Every datagram begins with one header byte. `Data` and `Acknowledgement`
//! are followed by a channel-id byte; channel ids 0-239 are user-assignable,
//! 240-255 are reserved for built-in channels. `Timeout` never appears on the
//! wire -- it is synthesised locally when a connection's keep-alive deadline
//! elapses.

use bytes::Buf;

use crate::buffer::BufferPool;
use crate::error::{Result, TransportError};
use crate::packet::{Packet, ReadOnlyPacket};

/// First-byte channel id reserved for built-in channels (240-255).
pub const RESERVED_CHANNEL_MIN: u8 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeaderKind {
    Connect = 0x00,
    ConnectApproved = 0x01,
    Ping = 0x02,
    Pong = 0x03,
    Data = 0x04,
    Acknowledgement = 0x05,
    Disconnect = 0x06,
    /// Never transmitted; synthesised locally on keep-alive timeout.
    Timeout = 0x07,
}

impl TryFrom<u8> for HeaderKind {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(HeaderKind::Connect),
            0x01 => Ok(HeaderKind::ConnectApproved),
            0x02 => Ok(HeaderKind::Ping),
            0x03 => Ok(HeaderKind::Pong),
            0x04 => Ok(HeaderKind::Data),
            0x05 => Ok(HeaderKind::Acknowledgement),
            0x06 => Ok(HeaderKind::Disconnect),
            0x07 => Ok(HeaderKind::Timeout),
            other => Err(TransportError::UnknownHeader(other)),
        }
    }
}

/// Validate that `id` is in the user-assignable range (not reserved).
pub fn validate_user_channel_id(id: u8) -> Result<()> {
    if id >= RESERVED_CHANNEL_MIN {
        Err(TransportError::ReservedChannelId(id))
    } else {
        Ok(())
    }
}

/// Build a `Connect` datagram: `[0x00][app_payload...]`.
pub fn build_connect(pool: &BufferPool, payload: &[u8]) -> Packet {
    let mut p = Packet::new(pool, HeaderKind::Connect as u8);
    p.write_bytes(payload);
    p
}

/// Build a `ConnectApproved` datagram: `[0x01]`.
pub fn build_connect_approved(pool: &BufferPool) -> Packet {
    Packet::new(pool, HeaderKind::ConnectApproved as u8)
}

/// Build a `Ping` datagram: `[0x02][ping_id:u8][send_time:u64]`.
pub fn build_ping(pool: &BufferPool, ping_id: u8, send_time_micros: u64) -> Packet {
    let mut p = Packet::new(pool, HeaderKind::Ping as u8);
    p.write_u8(ping_id);
    p.write_u64(send_time_micros);
    p
}

/// Build a `Pong` datagram: `[0x03][ping_id:u8]`.
pub fn build_pong(pool: &BufferPool, ping_id: u8) -> Packet {
    let mut p = Packet::new(pool, HeaderKind::Pong as u8);
    p.write_u8(ping_id);
    p
}

/// Build a `Disconnect` datagram: `[0x06]`.
pub fn build_disconnect(pool: &BufferPool) -> Packet {
    Packet::new(pool, HeaderKind::Disconnect as u8)
}

/// Parsed `Ping` body.
pub struct PingBody {
    pub ping_id: u8,
    pub send_time_micros: u64,
}

pub fn parse_ping(body: &mut ReadOnlyPacket) -> Result<PingBody> {
    Ok(PingBody {
        ping_id: body.read_u8()?,
        send_time_micros: body.read_u64()?,
    })
}

/// Parsed `Pong` body.
pub struct PongBody {
    pub ping_id: u8,
}

pub fn parse_pong(body: &mut ReadOnlyPacket) -> Result<PongBody> {
    Ok(PongBody {
        ping_id: body.read_u8()?,
    })
}

pub fn read_u16_at(data: &[u8], offset: usize) -> u16 {
    (&data[offset..offset + 2]).get_u16_le()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MAX_PACKET_SIZE;
    use bytes::Bytes;

    #[test]
    fn header_kind_round_trips() {
        for b in 0x00u8..=0x07 {
            let kind = HeaderKind::try_from(b).unwrap();
            assert_eq!(kind as u8, b);
        }
        assert!(HeaderKind::try_from(0x08).is_err());
    }

    #[test]
    fn ping_pong_wire_format() {
        let pool = BufferPool::new(MAX_PACKET_SIZE, 2);
        let ping = build_ping(&pool, 5, 123456);
        let mut r = ReadOnlyPacket::from_bytes(Bytes::copy_from_slice(ping.as_slice()));
        assert_eq!(r.read_u8().unwrap(), HeaderKind::Ping as u8);
        let body = parse_ping(&mut r).unwrap();
        assert_eq!(body.ping_id, 5);
        assert_eq!(body.send_time_micros, 123456);

        let pong = build_pong(&pool, 5);
        let mut r = ReadOnlyPacket::from_bytes(Bytes::copy_from_slice(pong.as_slice()));
        assert_eq!(r.read_u8().unwrap(), HeaderKind::Pong as u8);
        let body = parse_pong(&mut r).unwrap();
        assert_eq!(body.ping_id, 5);
    }

    #[test]
    fn reserved_channel_ids_rejected() {
        assert!(validate_user_channel_id(239).is_ok());
        assert!(validate_user_channel_id(240).is_err());
        assert!(validate_user_channel_id(255).is_err());
    }
}
