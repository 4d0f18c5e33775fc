//! Cursor-based views over a pooled [`Buffer`].
//!
//! [`Packet`] is the writable side: acquired from a pool with an initial
//! header byte already written, then appended to by the producer. Ownership
//! transfers to whichever channel sends it. [`ReadOnlyPacket`] is the
//! immutable receive-side view, with its own read cursor, built over a cheap
//! `Bytes` clone of the received datagram.

use bytes::{Buf, BufMut, Bytes};

use crate::buffer::{Buffer, BufferPool};
use crate::error::{Result, TransportError};

/// A writable packet view: a pooled buffer plus a write cursor.
pub struct Packet {
    buffer: Buffer,
}

impl Packet {
    /// Acquire a buffer from `pool` and write `header` as the first byte.
    pub fn new(pool: &BufferPool, header: u8) -> Self {
        let mut buffer = pool.acquire();
        buffer.as_mut().put_u8(header);
        Self { buffer }
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buffer.as_mut().put_u8(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buffer.as_mut().put_u16_le(v);
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buffer.as_mut().put_u32_le(v);
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buffer.as_mut().put_u64_le(v);
        self
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buffer.as_mut().put_slice(data);
        self
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Consume the packet, returning the underlying buffer for release.
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

/// An immutable, independently-cursored read view over received bytes.
#[derive(Clone)]
pub struct ReadOnlyPacket {
    data: Bytes,
    cursor: usize,
}

impl ReadOnlyPacket {
    pub fn from_bytes(data: Bytes) -> Self {
        Self { data, cursor: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    pub fn remaining_slice(&self) -> &[u8] {
        &self.data[self.cursor..]
    }

    /// The full datagram, unaffected by the read cursor.
    pub fn full_payload(&self) -> &Bytes {
        &self.data
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            Err(TransportError::Malformed("packet shorter than expected field"))
        } else {
            Ok(())
        }
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        let v = self.remaining_slice()[0];
        self.cursor += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        let v = (&self.remaining_slice()[..2]).get_u16_le();
        self.cursor += 2;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        let v = (&self.remaining_slice()[..4]).get_u32_le();
        self.cursor += 4;
        Ok(v)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        let v = (&self.remaining_slice()[..8]).get_u64_le();
        self.cursor += 8;
        Ok(v)
    }

    /// Read `len` bytes as a cheap `Bytes` slice (shares the backing storage).
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len)?;
        let slice = self.data.slice(self.cursor..self.cursor + len);
        self.cursor += len;
        Ok(slice)
    }

    /// Read all remaining bytes.
    pub fn read_rest(&mut self) -> Bytes {
        let slice = self.data.slice(self.cursor..);
        self.cursor = self.data.len();
        slice
    }
}
