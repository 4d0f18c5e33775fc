//! Reliable-fragmented channel: splits payloads too large for a single
//! datagram across consecutive fragment numbers sharing one sequence
//! number, reassembling exactly once per sequence.
//!
//! Ack state is not coalesced into a bitfield here: each fragment needs
//! independent pending state, since the loss of any single fragment blocks
//! delivery of the whole sequence. Delivery ordering (ordered vs. unordered)
//! mirrors [`super::reliable`] but operates over `sequence_number` alone,
//! once a sequence's fragments are all present.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};
use crate::frame::read_u16_at;

use super::ring::SequenceRing;

/// Top bit of the fragment-number footer marks the final fragment.
pub const LAST_FRAGMENT_BIT: u16 = 0x8000;
/// One bit is reserved for the last-fragment marker.
pub const MAX_FRAGMENTS: usize = 32767;
/// 4-byte footer: `(sequence_number: u16, fragment_number: u16)`.
pub const FOOTER_SIZE: usize = 4;

/// Usable body size per fragment datagram, given the 2-byte header
/// (kind+channel) and 4-byte fragment footer taken out of `MAX_PACKET_SIZE`.
pub fn body_size(max_packet_size: usize) -> usize {
    max_packet_size - 2 - FOOTER_SIZE
}

/// Compute the number of fragments `payload_len` splits into at `body_size`
/// bytes each. Rejects an empty payload (`fragment_count == 0`) and a
/// payload that would need more than [`MAX_FRAGMENTS`] fragments.
pub fn fragment_count(payload_len: usize, body_size: usize) -> Result<usize> {
    if payload_len == 0 {
        return Err(TransportError::Malformed(
            "cannot fragment an empty payload",
        ));
    }
    let count = payload_len.div_ceil(body_size);
    if count > MAX_FRAGMENTS {
        return Err(TransportError::TooManyFragments(count));
    }
    Ok(count)
}

#[derive(Debug, Default)]
struct FragmentGroup {
    fragments: HashMap<u16, Bytes>,
    last_fragment_index: Option<u16>,
}

impl FragmentGroup {
    fn is_complete(&self) -> bool {
        self.last_fragment_index
            .is_some_and(|last| self.fragments.len() == last as usize + 1)
    }

    fn reassemble(&self, last: u16) -> Bytes {
        let mut buf = BytesMut::new();
        for idx in 0..=last {
            if let Some(part) = self.fragments.get(&idx) {
                buf.put_slice(part);
            }
        }
        buf.freeze()
    }
}

/// Result of feeding an inbound fragment datagram to a fragmented channel.
pub struct FragmentReceiveOutcome {
    /// Set exactly once per sequence: the reassembled payload, ready for
    /// delivery (subject to ordered-mode gating against `receive_seq`).
    pub delivered: Vec<Bytes>,
    pub ack_seq: u16,
    pub ack_fragment: u16,
    pub duplicate: bool,
}

#[derive(Debug)]
pub struct ReliableFragmentState {
    ordered: bool,
    local_seq: u16,
    receive_seq: u16,
    groups: SequenceRing<FragmentGroup>,
    /// Reassembled-but-undelivered payloads, keyed by sequence, for the
    /// ordered variant waiting on `receive_seq` to catch up.
    completed: SequenceRing<Bytes>,
    sent: u64,
    received: u64,
    duplicated: u64,
    out_of_order: u64,
}

impl ReliableFragmentState {
    pub fn new(ordered: bool) -> Self {
        Self {
            ordered,
            local_seq: 0,
            receive_seq: 0,
            groups: SequenceRing::new(),
            completed: SequenceRing::new(),
            sent: 0,
            received: 0,
            duplicated: 0,
            out_of_order: 0,
        }
    }

    pub fn ordered(&self) -> bool {
        self.ordered
    }

    /// Split `payload` into fragment datagram bodies, each carrying the
    /// shared sequence number and its own fragment-number footer (top bit
    /// set on the final fragment). Returns the sequence used (the caller
    /// registers each fragment as an independent pending packet keyed by
    /// `(sequence, fragment_number)`).
    pub fn submit_send(&mut self, payload: &[u8], body_size: usize) -> Result<(u16, Vec<(u16, Bytes)>)> {
        let count = fragment_count(payload.len(), body_size)?;
        let seq = self.local_seq;
        self.local_seq = self.local_seq.wrapping_add(1);
        self.sent += 1;

        let mut frames = Vec::with_capacity(count);
        for i in 0..count {
            let start = i * body_size;
            let end = ((i + 1) * body_size).min(payload.len());
            let mut frag = i as u16;
            if i == count - 1 {
                frag |= LAST_FRAGMENT_BIT;
            }
            let mut body = BytesMut::with_capacity(end - start + FOOTER_SIZE);
            body.put_slice(&payload[start..end]);
            body.put_u16_le(seq);
            body.put_u16_le(frag);
            frames.push((frag, body.freeze()));
        }
        Ok((seq, frames))
    }

    pub fn on_data(&mut self, body: &[u8]) -> Result<FragmentReceiveOutcome> {
        if body.len() < FOOTER_SIZE {
            return Err(TransportError::Malformed(
                "fragment data shorter than the 4-byte footer",
            ));
        }
        self.received += 1;
        let seq = read_u16_at(body, body.len() - FOOTER_SIZE);
        let frag_raw = read_u16_at(body, body.len() - 2);
        let frag_index = frag_raw & !LAST_FRAGMENT_BIT;
        let is_last = frag_raw & LAST_FRAGMENT_BIT != 0;
        let payload = Bytes::copy_from_slice(&body[..body.len() - FOOTER_SIZE]);

        let group = self.groups.get_or_insert_with(seq, FragmentGroup::default);
        if group.fragments.contains_key(&frag_index) {
            self.duplicated += 1;
            return Ok(FragmentReceiveOutcome {
                delivered: Vec::new(),
                ack_seq: seq,
                ack_fragment: frag_raw,
                duplicate: true,
            });
        }
        group.fragments.insert(frag_index, payload);
        if is_last {
            group.last_fragment_index = Some(frag_index);
        }

        let mut delivered = Vec::new();
        if group.is_complete() {
            let last = group.last_fragment_index.unwrap();
            let reassembled = group.reassemble(last);
            self.groups.take(seq);

            if !self.ordered {
                delivered.push(reassembled);
            } else {
                if seq != self.receive_seq {
                    self.out_of_order += 1;
                }
                self.completed.insert(seq, reassembled);
                while let Some(p) = self.completed.take(self.receive_seq) {
                    delivered.push(p);
                    self.receive_seq = self.receive_seq.wrapping_add(1);
                }
            }
        }

        Ok(FragmentReceiveOutcome {
            delivered,
            ack_seq: seq,
            ack_fragment: frag_raw,
            duplicate: false,
        })
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn duplicated(&self) -> u64 {
        self.duplicated
    }

    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: usize = 8;

    #[test]
    fn single_fragment_round_trips() {
        let mut tx = ReliableFragmentState::new(false);
        let mut rx = ReliableFragmentState::new(false);
        let (_, frames) = tx.submit_send(b"short", BODY).unwrap();
        assert_eq!(frames.len(), 1);
        let out = rx.on_data(&frames[0].1).unwrap();
        assert_eq!(out.delivered, vec![Bytes::from_static(b"short")]);
    }

    #[test]
    fn multi_fragment_reassembles_in_any_arrival_order() {
        let mut tx = ReliableFragmentState::new(false);
        let mut rx = ReliableFragmentState::new(false);
        let payload = b"this payload needs several fragments to cross";
        let (_, mut frames) = tx.submit_send(payload, BODY).unwrap();
        assert!(frames.len() > 1);

        // Deliver the last fragment first.
        frames.reverse();
        let mut reassembled = None;
        for (_, frame) in &frames {
            let out = rx.on_data(frame).unwrap();
            if !out.delivered.is_empty() {
                assert!(reassembled.is_none(), "reassembled more than once");
                reassembled = Some(out.delivered[0].clone());
            }
        }
        assert_eq!(reassembled.unwrap(), Bytes::copy_from_slice(payload));
    }

    #[test]
    fn duplicate_fragment_is_counted_and_dropped() {
        let mut tx = ReliableFragmentState::new(false);
        let mut rx = ReliableFragmentState::new(false);
        let (_, frames) = tx.submit_send(b"0123456789abcdef", BODY).unwrap();
        rx.on_data(&frames[0].1).unwrap();
        let out = rx.on_data(&frames[0].1).unwrap();
        assert!(out.duplicate);
        assert_eq!(rx.duplicated(), 1);
    }

    #[test]
    fn ordered_waits_for_receive_seq() {
        let mut tx = ReliableFragmentState::new(true);
        let mut rx = ReliableFragmentState::new(true);
        let (_, f0) = tx.submit_send(b"first message body", BODY).unwrap();
        let (_, f1) = tx.submit_send(b"second message body", BODY).unwrap();

        for (_, frame) in &f1 {
            let out = rx.on_data(frame).unwrap();
            assert!(out.delivered.is_empty());
        }
        let mut delivered = Vec::new();
        for (_, frame) in &f0 {
            let out = rx.on_data(frame).unwrap();
            delivered.extend(out.delivered);
        }
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0], Bytes::copy_from_slice(b"first message body"));
        assert_eq!(delivered[1], Bytes::copy_from_slice(b"second message body"));
    }

    #[test]
    fn rejects_empty_payload() {
        let mut tx = ReliableFragmentState::new(false);
        assert!(tx.submit_send(b"", BODY).is_err());
    }

    #[test]
    fn rejects_too_many_fragments() {
        assert!(fragment_count(MAX_FRAGMENTS * BODY + 1, BODY).is_err());
        assert!(fragment_count(MAX_FRAGMENTS * BODY, BODY).is_ok());
    }

    #[test]
    fn large_payload_round_trips_byte_identical() {
        let mut tx = ReliableFragmentState::new(false);
        let mut rx = ReliableFragmentState::new(false);
        let payload: Vec<u8> = (0..4000u32).map(|i| (i % 256) as u8).collect();
        let (_, frames) = tx.submit_send(&payload, 1018).unwrap();
        let mut delivered = None;
        for (_, frame) in frames {
            let out = rx.on_data(&frame).unwrap();
            if !out.delivered.is_empty() {
                delivered = Some(out.delivered[0].clone());
            }
        }
        assert_eq!(delivered.unwrap(), Bytes::copy_from_slice(&payload));
    }
}
