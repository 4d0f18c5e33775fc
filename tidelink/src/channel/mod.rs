//! Per-channel glue: picks the delivery-semantics state for a channel kind,
//! wraps it together with a [`RetransmitEngine`] behind a single lock, and
//! exposes the kind-agnostic API `Connection` drives.
//!
//! The shared lock is the load-bearing design choice here: a receive that
//! acknowledges a pending packet and a resend timer that fires for the same
//! packet both need the channel's pending-packet state, and folding both
//! state and engine under one `Mutex` makes that race structurally
//! impossible rather than something callers have to get right.

mod reliable;
mod reliable_fragment;
mod ring;
mod sequenced;
mod unreliable;

use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::buffer::MAX_PACKET_SIZE;
use crate::config::ChannelConfig;
use crate::error::{Result, TransportError};
use crate::frame::read_u16_at;
use crate::retransmit::{pack_fragment_key, DueRetransmit, GivenUp, RetransmitEngine};

pub use reliable::ReliableState;
pub use reliable_fragment::{body_size as fragment_body_size, ReliableFragmentState};
pub use sequenced::SequencedState;
pub use unreliable::UnreliableState;

/// The delivery semantics a channel is configured with. Chosen at channel
/// registration time and fixed for the channel's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Unreliable,
    Sequenced,
    Reliable { ordered: bool },
    ReliableFragment { ordered: bool },
}

impl ChannelKind {
    pub fn supports_ack(self) -> bool {
        matches!(
            self,
            ChannelKind::Reliable { .. } | ChannelKind::ReliableFragment { .. }
        )
    }
}

#[derive(Debug)]
enum ChannelState {
    Unreliable(UnreliableState),
    Sequenced(SequencedState),
    Reliable(ReliableState),
    ReliableFragment(ReliableFragmentState),
}

/// An acknowledgement datagram body ready to send back to the peer, in the
/// format appropriate to the channel kind that produced it.
#[derive(Debug, Clone)]
pub enum AckToSend {
    /// Reliable channel: sequence plus a redundancy bitfield over the
    /// immediately preceding sequences.
    Bitfield { seq: u16, bitfield: Vec<u8> },
    /// Reliable-fragmented channel: one ack per fragment, never coalesced.
    Fragment { seq: u16, fragment: u16 },
}

impl AckToSend {
    /// Encode to the wire body that follows the `Acknowledgement` header and
    /// channel id.
    pub fn encode(&self) -> Bytes {
        use bytes::{BufMut, BytesMut};
        match self {
            AckToSend::Bitfield { seq, bitfield } => {
                let mut buf = BytesMut::with_capacity(2 + bitfield.len());
                buf.put_u16_le(*seq);
                buf.put_slice(bitfield);
                buf.freeze()
            }
            AckToSend::Fragment { seq, fragment } => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u16_le(*seq);
                buf.put_u16_le(*fragment);
                buf.freeze()
            }
        }
    }
}

/// Result of feeding an inbound `Data` datagram body to a channel.
pub struct ChannelReceiveOutcome {
    pub delivered: Vec<Bytes>,
    pub ack: Option<AckToSend>,
}

/// Point-in-time counters for a channel, surfaced for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStats {
    pub sent: u64,
    pub received: u64,
    pub duplicated: u64,
    pub out_of_order: u64,
    pub pending_acks: usize,
}

struct Body {
    state: ChannelState,
    retransmit: RetransmitEngine,
    closed: bool,
}

/// A single channel slot on a connection: framing/delivery state plus, for
/// the reliable kinds, the retransmit ledger, all behind one lock.
pub struct Channel {
    id: u8,
    kind: ChannelKind,
    config: ChannelConfig,
    body: Mutex<Body>,
}

impl Channel {
    pub fn new(id: u8, kind: ChannelKind, config: ChannelConfig) -> Self {
        let retransmit = RetransmitEngine::new(
            config.max_resend_attempts,
            config.min_resend_delay,
            config.backoff_factor,
        );
        let state = match kind {
            ChannelKind::Unreliable => ChannelState::Unreliable(UnreliableState::new()),
            ChannelKind::Sequenced => ChannelState::Sequenced(SequencedState::new()),
            ChannelKind::Reliable { ordered } => {
                ChannelState::Reliable(ReliableState::new(ordered, config.ack_bytes))
            }
            ChannelKind::ReliableFragment { ordered } => {
                ChannelState::ReliableFragment(ReliableFragmentState::new(ordered))
            }
        };
        Self {
            id,
            kind,
            config,
            body: Mutex::new(Body {
                state,
                retransmit,
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// The largest payload a single (non-fragmenting) datagram on this
    /// channel can carry. `None` for fragmenting channels, which split
    /// instead of rejecting.
    pub fn max_payload_size(&self) -> Option<usize> {
        match self.kind {
            ChannelKind::Unreliable => Some(MAX_PACKET_SIZE),
            ChannelKind::Sequenced | ChannelKind::Reliable { .. } => Some(MAX_PACKET_SIZE - 2),
            ChannelKind::ReliableFragment { .. } => None,
        }
    }

    /// Frame `payload` for sending and, for reliable kinds, register each
    /// resulting datagram as pending with the retransmit engine. Returns the
    /// datagram bodies in send order (more than one only for fragmenting
    /// channels). A closed channel silently produces nothing: subsequent
    /// sends are no-ops.
    pub fn submit_send(
        &self,
        payload: &[u8],
        base_delay_ms: f64,
        now: Instant,
    ) -> Result<Vec<Bytes>> {
        let mut body = self.body.lock();
        if body.closed {
            return Ok(Vec::new());
        }
        if let Some(max) = self.max_payload_size() {
            if payload.len() > max {
                return Err(TransportError::PayloadTooLarge {
                    size: payload.len(),
                    max,
                });
            }
        }

        match &mut body.state {
            ChannelState::Unreliable(s) => {
                s.on_send();
                Ok(vec![Bytes::copy_from_slice(payload)])
            }
            ChannelState::Sequenced(s) => Ok(vec![s.submit_send(payload)]),
            ChannelState::Reliable(s) => {
                let (seq, frame) = s.submit_send(payload);
                body.retransmit
                    .push(self.id, seq as u32, frame.clone(), base_delay_ms, now);
                Ok(vec![frame])
            }
            ChannelState::ReliableFragment(s) => {
                let chunk = fragment_body_size(MAX_PACKET_SIZE);
                let (seq, frames) = s.submit_send(payload, chunk)?;
                let mut out = Vec::with_capacity(frames.len());
                for (fragment, frame) in frames {
                    let key = pack_fragment_key(seq, fragment);
                    body.retransmit
                        .push(self.id, key, frame.clone(), base_delay_ms, now);
                    out.push(frame);
                }
                Ok(out)
            }
        }
    }

    /// Feed an inbound `Data` datagram body through the channel's delivery
    /// state, producing the payloads now ready for the application and, for
    /// the reliable kinds, the acknowledgement to send back.
    pub fn on_data(&self, datagram_body: &[u8]) -> Result<ChannelReceiveOutcome> {
        let mut body = self.body.lock();
        if body.closed {
            return Ok(ChannelReceiveOutcome {
                delivered: Vec::new(),
                ack: None,
            });
        }
        match &mut body.state {
            ChannelState::Unreliable(s) => {
                s.on_receive();
                Ok(ChannelReceiveOutcome {
                    delivered: vec![Bytes::copy_from_slice(datagram_body)],
                    ack: None,
                })
            }
            ChannelState::Sequenced(s) => {
                let delivered = s.on_receive(datagram_body)?.into_iter().collect();
                Ok(ChannelReceiveOutcome {
                    delivered,
                    ack: None,
                })
            }
            ChannelState::Reliable(s) => {
                let out = s.on_data(datagram_body)?;
                Ok(ChannelReceiveOutcome {
                    delivered: out.delivered,
                    ack: Some(AckToSend::Bitfield {
                        seq: out.ack_seq,
                        bitfield: out.ack_bitfield,
                    }),
                })
            }
            ChannelState::ReliableFragment(s) => {
                let out = s.on_data(datagram_body)?;
                Ok(ChannelReceiveOutcome {
                    delivered: out.delivered,
                    ack: Some(AckToSend::Fragment {
                        seq: out.ack_seq,
                        fragment: out.ack_fragment,
                    }),
                })
            }
        }
    }

    /// Feed an inbound `Acknowledgement` datagram body, retiring whichever
    /// pending packets it (and, for the reliable channel, its bitfield)
    /// confirms.
    pub fn on_ack(&self, ack_body: &[u8]) -> Result<()> {
        let mut body = self.body.lock();
        if body.closed {
            return Ok(());
        }
        match self.kind {
            ChannelKind::Unreliable | ChannelKind::Sequenced => {
                Err(TransportError::AckOnUnreliable(self.id))
            }
            ChannelKind::Reliable { .. } => {
                if ack_body.len() < 2 {
                    return Err(TransportError::Malformed(
                        "acknowledgement shorter than the 2-byte sequence field",
                    ));
                }
                let seq = read_u16_at(ack_body, 0);
                let bitfield = &ack_body[2..];
                for acked in ReliableState::implied_acks(seq, bitfield) {
                    body.retransmit.ack(self.id, acked as u32);
                }
                Ok(())
            }
            ChannelKind::ReliableFragment { .. } => {
                if ack_body.len() < 4 {
                    return Err(TransportError::Malformed(
                        "fragment acknowledgement shorter than 4 bytes",
                    ));
                }
                let seq = read_u16_at(ack_body, 0);
                let fragment = read_u16_at(ack_body, 2);
                body.retransmit.ack(self.id, pack_fragment_key(seq, fragment));
                Ok(())
            }
        }
    }

    /// Advance the retransmit clock, returning datagrams due for resend and
    /// any packets that exhausted their attempt budget.
    pub fn poll_retransmits(
        &self,
        now: Instant,
        base_delay_ms: f64,
    ) -> (Vec<DueRetransmit>, Vec<GivenUp>) {
        let mut body = self.body.lock();
        if body.closed {
            return (Vec::new(), Vec::new());
        }
        body.retransmit.poll(now, base_delay_ms)
    }

    /// Mark the channel closed: further sends/receives are no-ops and all
    /// pending retransmits are dropped without being reported.
    pub fn close(&self) {
        let mut body = self.body.lock();
        body.closed = true;
        body.retransmit.drain();
    }

    pub fn is_closed(&self) -> bool {
        self.body.lock().closed
    }

    pub fn stats(&self) -> ChannelStats {
        let body = self.body.lock();
        match &body.state {
            ChannelState::Unreliable(s) => ChannelStats {
                sent: s.sent(),
                received: s.received(),
                ..Default::default()
            },
            ChannelState::Sequenced(s) => ChannelStats {
                sent: s.sent(),
                received: s.received(),
                out_of_order: s.out_of_order(),
                ..Default::default()
            },
            ChannelState::Reliable(s) => ChannelStats {
                sent: s.sent(),
                received: s.received(),
                duplicated: s.duplicated(),
                out_of_order: s.out_of_order(),
                pending_acks: body.retransmit.pending_count(),
            },
            ChannelState::ReliableFragment(s) => ChannelStats {
                sent: s.sent(),
                received: s.received(),
                duplicated: s.duplicated(),
                out_of_order: s.out_of_order(),
                pending_acks: body.retransmit.pending_count(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> ChannelConfig {
        ChannelConfig::builder()
            .min_resend_delay(Duration::from_millis(5))
            .build()
            .unwrap()
    }

    #[test]
    fn unreliable_round_trips_without_ack() {
        let tx = Channel::new(1, ChannelKind::Unreliable, config());
        let rx = Channel::new(1, ChannelKind::Unreliable, config());
        let now = Instant::now();
        let frames = tx.submit_send(b"hello", -1.0, now).unwrap();
        let out = rx.on_data(&frames[0]).unwrap();
        assert_eq!(out.delivered, vec![Bytes::from_static(b"hello")]);
        assert!(out.ack.is_none());
    }

    #[test]
    fn reliable_send_registers_pending_and_ack_clears_it() {
        let tx = Channel::new(2, ChannelKind::Reliable { ordered: true }, config());
        let rx = Channel::new(2, ChannelKind::Reliable { ordered: true }, config());
        let now = Instant::now();
        let frames = tx.submit_send(b"payload", 50.0, now).unwrap();
        assert_eq!(tx.stats().pending_acks, 1);

        let outcome = rx.on_data(&frames[0]).unwrap();
        assert_eq!(outcome.delivered, vec![Bytes::from_static(b"payload")]);
        let ack = outcome.ack.unwrap().encode();
        tx.on_ack(&ack).unwrap();
        assert_eq!(tx.stats().pending_acks, 0);
    }

    #[test]
    fn fragment_channel_acks_each_fragment_independently() {
        let tx = Channel::new(3, ChannelKind::ReliableFragment { ordered: false }, config());
        let rx = Channel::new(3, ChannelKind::ReliableFragment { ordered: false }, config());
        let now = Instant::now();
        let payload = vec![7u8; 4000];
        let frames = tx.submit_send(&payload, 50.0, now).unwrap();
        assert!(frames.len() > 1);
        assert_eq!(tx.stats().pending_acks, frames.len());

        let mut delivered = None;
        for frame in &frames {
            let outcome = rx.on_data(frame).unwrap();
            let ack = outcome.ack.unwrap().encode();
            tx.on_ack(&ack).unwrap();
            if !outcome.delivered.is_empty() {
                delivered = Some(outcome.delivered[0].clone());
            }
        }
        assert_eq!(delivered.unwrap(), Bytes::copy_from_slice(&payload));
        assert_eq!(tx.stats().pending_acks, 0);
    }

    #[test]
    fn ack_on_unreliable_channel_is_rejected() {
        let ch = Channel::new(4, ChannelKind::Unreliable, config());
        assert!(matches!(
            ch.on_ack(&[0, 0]),
            Err(TransportError::AckOnUnreliable(4))
        ));
    }

    #[test]
    fn oversized_payload_on_non_fragmenting_channel_is_rejected() {
        let ch = Channel::new(5, ChannelKind::Reliable { ordered: false }, config());
        let max = ch.max_payload_size().unwrap();
        let now = Instant::now();
        assert!(ch.submit_send(&vec![0u8; max], -1.0, now).is_ok());
        assert!(matches!(
            ch.submit_send(&vec![0u8; max + 1], -1.0, now),
            Err(TransportError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn closed_channel_sends_and_receives_are_no_ops() {
        let ch = Channel::new(6, ChannelKind::Unreliable, config());
        ch.close();
        let now = Instant::now();
        assert!(ch.submit_send(b"x", -1.0, now).unwrap().is_empty());
        assert!(ch.on_data(b"x").unwrap().delivered.is_empty());
        assert!(ch.is_closed());
    }

    #[test]
    fn due_retransmit_carries_the_original_frame_verbatim() {
        let ch = Channel::new(7, ChannelKind::Reliable { ordered: false }, config());
        let now = Instant::now();
        let frames = ch.submit_send(b"retry-me", 1.0, now).unwrap();
        let later = now + Duration::from_millis(50);
        let (due, given_up) = ch.poll_retransmits(later, 1.0);
        assert_eq!(due.len(), 1);
        assert!(given_up.is_empty());
        assert_eq!(due[0].payload, frames[0]);
    }
}
