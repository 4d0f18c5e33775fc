//! Unreliable channel: no framing beyond header+channel, no acknowledgement,
//! no ordering. A fire-and-forget send/receive pair with nothing but
//! counters to carry between calls.

#[derive(Debug, Default)]
pub struct UnreliableState {
    sent: u64,
    received: u64,
}

impl UnreliableState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_send(&mut self) {
        self.sent += 1;
    }

    pub fn on_receive(&mut self) {
        self.received += 1;
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_send_and_receive() {
        let mut s = UnreliableState::new();
        s.on_send();
        s.on_send();
        s.on_receive();
        assert_eq!(s.sent(), 2);
        assert_eq!(s.received(), 1);
    }
}
