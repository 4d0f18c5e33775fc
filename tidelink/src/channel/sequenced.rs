//! Sequenced channel: a 16-bit local sequence footer on send, and a
//! strictly-greater-only acceptance test on receive. No acknowledgement, no
//! retransmission, no duplicate redelivery -- gaps are silently accepted.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};
use crate::frame::read_u16_at;
use crate::seq;

#[derive(Debug)]
pub struct SequencedState {
    local_seq: u16,
    remote_high_water: Option<u16>,
    sent: u64,
    received: u64,
    out_of_order: u64,
}

impl Default for SequencedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SequencedState {
    pub fn new() -> Self {
        Self {
            local_seq: 0,
            remote_high_water: None,
            sent: 0,
            received: 0,
            out_of_order: 0,
        }
    }

    /// Append the post-increment local sequence footer to `payload`.
    pub fn submit_send(&mut self, payload: &[u8]) -> Bytes {
        let seq = self.local_seq;
        self.local_seq = self.local_seq.wrapping_add(1);
        self.sent += 1;
        let mut body = BytesMut::with_capacity(payload.len() + 2);
        body.put_slice(payload);
        body.put_u16_le(seq);
        body.freeze()
    }

    /// Deliver the payload iff its sequence is strictly ahead of the
    /// high-water mark; otherwise count it as out-of-order and drop it.
    pub fn on_receive(&mut self, body: &[u8]) -> Result<Option<Bytes>> {
        if body.len() < 2 {
            return Err(TransportError::Malformed(
                "sequenced data shorter than the 2-byte sequence footer",
            ));
        }
        self.received += 1;
        let seq = read_u16_at(body, body.len() - 2);
        let payload = Bytes::copy_from_slice(&body[..body.len() - 2]);

        let accept = match self.remote_high_water {
            None => true,
            Some(hw) => seq::greater_than(seq, hw),
        };
        if accept {
            self.remote_high_water = Some(seq);
            Ok(Some(payload))
        } else {
            self.out_of_order += 1;
            Ok(None)
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }
}
