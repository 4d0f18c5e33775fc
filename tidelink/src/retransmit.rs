//! Per-pending-packet retransmission, driven by a `BinaryHeap` of fire
//! deadlines rather than one OS timer per packet.
//!
//! A pending packet is identified by `(channel_id, key)`, where `key` is an
//! opaque `u32` the channel chooses: a reliable channel's raw `u16`
//! sequence, or a reliable-fragmented channel's `(sequence, fragment)` pair
//! packed into 32 bits, since each fragment needs its own pending state, not
//! just each sequence. Acknowledging an entry removes the id from the live
//! set; the heap entry is left in place and is silently skipped the next
//! time it is popped (lazy deletion, rather than a heap-remove on ack).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use bytes::Bytes;

/// Pack a `(sequence, fragment)` pair into the opaque `u32` key.
pub fn pack_fragment_key(sequence: u16, fragment: u16) -> u32 {
    ((sequence as u32) << 16) | fragment as u32
}

/// A packet that exhausted `max_resend_attempts` without being acknowledged.
/// The caller is expected to treat this as a connection timeout.
#[derive(Debug)]
pub struct GivenUp {
    pub channel_id: u8,
    pub key: u32,
    pub attempts: u32,
}

/// A packet whose retransmit timer fired and must be re-sent verbatim.
#[derive(Debug)]
pub struct DueRetransmit {
    pub channel_id: u8,
    pub key: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
struct Entry {
    channel_id: u8,
    key: u32,
    payload: Bytes,
    fire_at: Instant,
    backoff: f64,
    attempts: u32,
    /// `true` if this entry was a deferred (no-RTT-estimate) reschedule that
    /// must not count against `max_resend_attempts` when it fires again.
    deferred: bool,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so the earliest deadline is popped first (min-heap).
        other.fire_at.cmp(&self.fire_at)
    }
}

/// Per-channel retransmit queue and pending-packet ledger.
///
/// One instance backs each reliable channel of each connection; see
/// `Connection` concurrency notes for the locking discipline around it.
pub struct RetransmitEngine {
    heap: BinaryHeap<Entry>,
    /// Presence means "not yet acknowledged". Used to skip stale heap
    /// entries for packets that were already acked.
    pending: HashMap<(u8, u32), ()>,
    max_resend_attempts: u32,
    min_resend_delay: Duration,
    backoff_factor: f64,
}

impl RetransmitEngine {
    pub fn new(max_resend_attempts: u32, min_resend_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            max_resend_attempts,
            min_resend_delay,
            backoff_factor,
        }
    }

    /// Register a freshly-sent packet. `base_delay_ms` comes from
    /// [`crate::rtt::RttEstimator::base_delay_ms`]; a negative value means no
    /// RTT estimate yet, in which case the first timer fire is deferred
    /// without transmitting or consuming an attempt.
    pub fn push(
        &mut self,
        channel_id: u8,
        key: u32,
        payload: Bytes,
        base_delay_ms: f64,
        now: Instant,
    ) {
        let (delay, deferred) = self.initial_delay(base_delay_ms);
        self.pending.insert((channel_id, key), ());
        self.heap.push(Entry {
            channel_id,
            key,
            payload,
            fire_at: now + delay,
            backoff: 1.0,
            attempts: 0,
            deferred,
        });
    }

    fn initial_delay(&self, base_delay_ms: f64) -> (Duration, bool) {
        if base_delay_ms < 0.0 {
            (self.min_resend_delay, true)
        } else {
            let base = Duration::from_secs_f64((base_delay_ms / 1000.0).max(0.0));
            (base.max(self.min_resend_delay), false)
        }
    }

    /// Acknowledge `(channel_id, key)`. Returns `true` if it was still
    /// pending (i.e. this ack actually retired a live retransmit).
    pub fn ack(&mut self, channel_id: u8, key: u32) -> bool {
        self.pending.remove(&(channel_id, key)).is_some()
    }

    /// Drain every pending entry without retransmitting (channel close).
    pub fn drain(&mut self) {
        self.pending.clear();
        self.heap.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Pop every entry due at or before `now`, re-arming survivors with
    /// backoff and reporting the rest as due or given up.
    pub fn poll(
        &mut self,
        now: Instant,
        base_delay_ms: f64,
    ) -> (Vec<DueRetransmit>, Vec<GivenUp>) {
        let mut due = Vec::new();
        let mut given_up = Vec::new();

        while let Some(top) = self.heap.peek() {
            if top.fire_at > now {
                break;
            }
            let entry = self.heap.pop().unwrap();
            let pending_key = (entry.channel_id, entry.key);
            if !self.pending.contains_key(&pending_key) {
                continue; // already acknowledged
            }

            if entry.deferred {
                // No RTT estimate was available when this was armed; retry
                // the same schedule without transmitting or counting it.
                let (delay, still_deferred) = self.initial_delay(base_delay_ms);
                self.heap.push(Entry {
                    fire_at: now + delay,
                    deferred: still_deferred,
                    ..entry
                });
                continue;
            }

            if entry.attempts >= self.max_resend_attempts {
                self.pending.remove(&pending_key);
                given_up.push(GivenUp {
                    channel_id: entry.channel_id,
                    key: entry.key,
                    attempts: entry.attempts,
                });
                continue;
            }

            due.push(DueRetransmit {
                channel_id: entry.channel_id,
                key: entry.key,
                payload: entry.payload.clone(),
            });

            let next_backoff = entry.backoff * self.backoff_factor;
            let next_delay = self.resend_delay(base_delay_ms, next_backoff);
            self.heap.push(Entry {
                fire_at: now + next_delay,
                backoff: next_backoff,
                attempts: entry.attempts + 1,
                ..entry
            });
        }

        (due, given_up)
    }

    fn resend_delay(&self, base_delay_ms: f64, backoff: f64) -> Duration {
        let base = if base_delay_ms < 0.0 {
            self.min_resend_delay
        } else {
            Duration::from_secs_f64((base_delay_ms / 1000.0).max(0.0)).max(self.min_resend_delay)
        };
        base.mul_f64(backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_retires_pending_entry() {
        let mut engine = RetransmitEngine::new(15, Duration::from_millis(100), 1.2);
        let now = Instant::now();
        engine.push(0, 1, Bytes::from_static(b"x"), 50.0, now);
        assert_eq!(engine.pending_count(), 1);
        assert!(engine.ack(0, 1));
        assert_eq!(engine.pending_count(), 0);
        assert!(!engine.ack(0, 1));
    }

    #[test]
    fn poll_before_deadline_yields_nothing() {
        let mut engine = RetransmitEngine::new(15, Duration::from_millis(100), 1.2);
        let now = Instant::now();
        engine.push(0, 1, Bytes::from_static(b"x"), 1000.0, now);
        let (due, given_up) = engine.poll(now, 1000.0);
        assert!(due.is_empty());
        assert!(given_up.is_empty());
    }

    #[test]
    fn poll_after_deadline_retransmits_and_backs_off() {
        let mut engine = RetransmitEngine::new(15, Duration::from_millis(10), 1.2);
        let now = Instant::now();
        engine.push(0, 1, Bytes::from_static(b"x"), 5.0, now);
        let later = now + Duration::from_millis(50);
        let (due, given_up) = engine.poll(later, 5.0);
        assert_eq!(due.len(), 1);
        assert!(given_up.is_empty());
        assert_eq!(due[0].payload, Bytes::from_static(b"x"));
    }

    #[test]
    fn exhausted_attempts_are_given_up() {
        let mut engine = RetransmitEngine::new(2, Duration::from_millis(1), 1.0);
        let mut now = Instant::now();
        engine.push(0, 1, Bytes::from_static(b"x"), 1.0, now);
        for _ in 0..2 {
            now += Duration::from_millis(10);
            let (due, given_up) = engine.poll(now, 1.0);
            assert_eq!(due.len(), 1);
            assert!(given_up.is_empty());
        }
        now += Duration::from_millis(10);
        let (due, given_up) = engine.poll(now, 1.0);
        assert!(due.is_empty());
        assert_eq!(given_up.len(), 1);
        assert_eq!(given_up[0].attempts, 2);
    }

    #[test]
    fn no_rtt_estimate_defers_without_consuming_attempt() {
        let mut engine = RetransmitEngine::new(15, Duration::from_millis(5), 1.2);
        let mut now = Instant::now();
        engine.push(0, 1, Bytes::from_static(b"x"), -1.0, now);
        now += Duration::from_millis(10);
        let (due, given_up) = engine.poll(now, -1.0);
        assert!(due.is_empty());
        assert!(given_up.is_empty());
        assert_eq!(engine.pending_count(), 1);

        // Once an estimate becomes available, the next fire transmits.
        now += Duration::from_millis(10);
        let (due, given_up) = engine.poll(now, 20.0);
        assert_eq!(due.len(), 1);
        assert!(given_up.is_empty());
    }

    #[test]
    fn drain_clears_without_reporting() {
        let mut engine = RetransmitEngine::new(15, Duration::from_millis(5), 1.2);
        let now = Instant::now();
        engine.push(0, 1, Bytes::from_static(b"x"), 5.0, now);
        engine.drain();
        assert_eq!(engine.pending_count(), 0);
        let (due, given_up) = engine.poll(now + Duration::from_secs(1), 5.0);
        assert!(due.is_empty());
        assert!(given_up.is_empty());
    }

    #[test]
    fn fragment_keys_pack_distinctly() {
        let a = pack_fragment_key(1, 0);
        let b = pack_fragment_key(1, 1);
        let c = pack_fragment_key(2, 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }
}
