//! Sequence bookkeeping for the UDP transport.
//!
//! Datagrams carry a sequence number plus a 32-wide ack bitfield used for
//! duplicate rejection and RTT estimation. Reliable messages carry their own
//! id and are acknowledged cumulatively, independent of datagram sequencing.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;
const ACK_WINDOW: u32 = 32;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    sequence: u32,
    sent_at: Instant,
}

/// Datagrams we sent and have not seen acknowledged yet.
#[derive(Debug)]
pub struct AckTracker {
    in_flight: VecDeque<InFlight>,
    capacity: usize,
    srtt: f32,
    rtt_var: f32,
}

impl AckTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            in_flight: VecDeque::with_capacity(capacity),
            capacity,
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    pub fn track(&mut self, sequence: u32) {
        while self.in_flight.len() >= self.capacity {
            self.in_flight.pop_front();
        }
        self.in_flight.push_back(InFlight {
            sequence,
            sent_at: Instant::now(),
        });
    }

    /// Drops every datagram covered by `ack`/`bitfield`, feeding the RTT
    /// estimate. Returns how many were acknowledged.
    pub fn process_ack(&mut self, ack: u32, bitfield: u32) -> usize {
        let now = Instant::now();
        let before = self.in_flight.len();
        let mut samples = Vec::new();

        self.in_flight.retain(|packet| {
            let acked = packet.sequence == ack
                || (sequence_greater_than(ack, packet.sequence) && {
                    let diff = ack.wrapping_sub(packet.sequence);
                    diff <= ACK_WINDOW && bitfield & (1 << (diff - 1)) != 0
                });
            if acked {
                samples.push(now.duration_since(packet.sent_at).as_secs_f32() * 1000.0);
            }
            !acked
        });

        for rtt in samples {
            self.update_rtt(rtt);
        }
        before - self.in_flight.len()
    }

    fn update_rtt(&mut self, rtt: f32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    /// Retransmission timeout in milliseconds, floored at `min_ms`.
    pub fn rto_ms(&self, min_ms: f32) -> f32 {
        (self.srtt + 4.0 * self.rtt_var).max(min_ms)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[derive(Debug)]
pub struct ReceiveTracker {
    latest: u32,
    bitfield: u32,
    recent: VecDeque<u32>,
    window: usize,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            latest: 0,
            bitfield: 0,
            recent: VecDeque::with_capacity(128),
            window: 128,
        }
    }

    /// Records `sequence`; false if it was already seen recently.
    pub fn record(&mut self, sequence: u32) -> bool {
        if self.recent.contains(&sequence) {
            return false;
        }
        if self.recent.len() >= self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(sequence);

        if sequence_greater_than(sequence, self.latest) {
            let diff = sequence.wrapping_sub(self.latest);
            self.bitfield = if diff <= ACK_WINDOW {
                self.bitfield.checked_shl(diff).unwrap_or(0) | (1 << (diff - 1))
            } else {
                0
            };
            self.latest = sequence;
        } else {
            let diff = self.latest.wrapping_sub(sequence);
            if diff > 0 && diff <= ACK_WINDOW {
                self.bitfield |= 1 << (diff - 1);
            }
        }
        true
    }

    /// Latest sequence seen plus bit `n` set for `latest - n - 1`.
    pub fn ack_data(&self) -> (u32, u32) {
        (self.latest, self.bitfield)
    }
}

#[derive(Debug, Clone)]
struct PendingReliable {
    id: u32,
    data: Vec<u8>,
    last_sent: Instant,
}

/// Reliable messages sent but not yet covered by the peer's cumulative ack.
#[derive(Debug)]
pub struct ReliableSender {
    next_id: u32,
    unacked: VecDeque<PendingReliable>,
}

impl Default for ReliableSender {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableSender {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            unacked: VecDeque::new(),
        }
    }

    /// Assigns the next id to `data` and keeps a copy for resending.
    pub fn queue(&mut self, data: &[u8]) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.unacked.push_back(PendingReliable {
            id,
            data: data.to_vec(),
            last_sent: Instant::now(),
        });
        id
    }

    /// Forgets everything up to and including `ack`.
    pub fn acknowledge(&mut self, ack: u32) -> usize {
        let before = self.unacked.len();
        while self
            .unacked
            .front()
            .is_some_and(|pending| !sequence_greater_than(pending.id, ack))
        {
            self.unacked.pop_front();
        }
        before - self.unacked.len()
    }

    /// Messages unacknowledged for longer than `rto`; their timers restart.
    pub fn due(&mut self, now: Instant, rto: Duration) -> Vec<(u32, Vec<u8>)> {
        self.unacked
            .iter_mut()
            .filter(|pending| now.duration_since(pending.last_sent) >= rto)
            .map(|pending| {
                pending.last_sent = now;
                (pending.id, pending.data.clone())
            })
            .collect()
    }

    pub fn unacked(&self) -> usize {
        self.unacked.len()
    }
}

/// Reorders reliable messages and releases them strictly in id order.
#[derive(Debug)]
pub struct ReliableReceiver {
    next_expected: u32,
    held: BTreeMap<u32, Vec<u8>>,
    max_held: usize,
}

impl Default for ReliableReceiver {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl ReliableReceiver {
    pub fn new(max_held: usize) -> Self {
        Self {
            next_expected: 1,
            held: BTreeMap::new(),
            max_held,
        }
    }

    /// Accepts message `id`, returning every message now deliverable in order.
    /// Duplicates and messages beyond the hold window are dropped.
    pub fn receive(&mut self, id: u32, data: Vec<u8>) -> Vec<Vec<u8>> {
        if id != self.next_expected {
            if sequence_greater_than(id, self.next_expected) && self.held.len() < self.max_held {
                self.held.entry(id).or_insert(data);
            }
            return Vec::new();
        }

        let mut ready = vec![data];
        self.next_expected = self.next_expected.wrapping_add(1);
        while let Some(next) = self.held.remove(&self.next_expected) {
            ready.push(next);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        ready
    }

    /// Cumulative ack: the last id delivered in order.
    pub fn ack(&self) -> u32 {
        self.next_expected.wrapping_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sequence_comparison_wraps() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn in_order_receipt_sets_bitfield() {
        let mut tracker = ReceiveTracker::new();
        tracker.record(1);
        tracker.record(2);
        tracker.record(3);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn out_of_order_receipt_sets_bitfield() {
        let mut tracker = ReceiveTracker::new();
        tracker.record(3);
        tracker.record(1);
        tracker.record(2);

        let (ack, bitfield) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bitfield & 0b11, 0b11);
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut tracker = ReceiveTracker::new();
        assert!(tracker.record(1));
        assert!(!tracker.record(1));
        assert!(tracker.record(2));
    }

    #[test]
    fn acks_clear_in_flight_and_sample_rtt() {
        let mut tracker = AckTracker::new(32);
        tracker.track(1);
        tracker.track(2);
        tracker.track(3);
        std::thread::sleep(Duration::from_millis(5));

        let acked = tracker.process_ack(3, 0b10);
        assert_eq!(acked, 2);
        assert_eq!(tracker.in_flight(), 1);
        assert!(tracker.srtt() > 0.0);
        assert!(tracker.rto_ms(50.0) >= 50.0);
    }

    #[test]
    fn reliable_receiver_reorders() {
        let mut receiver = ReliableReceiver::default();
        assert_eq!(receiver.ack(), 0);

        assert!(receiver.receive(2, b"two".to_vec()).is_empty());
        assert!(receiver.receive(3, b"three".to_vec()).is_empty());
        assert_eq!(
            receiver.receive(1, b"one".to_vec()),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
        assert_eq!(receiver.ack(), 3);

        assert!(receiver.receive(2, b"again".to_vec()).is_empty());
        assert_eq!(receiver.ack(), 3);
    }

    #[test]
    fn reliable_sender_resends_until_acked() {
        let mut sender = ReliableSender::new();
        let first = sender.queue(b"a");
        let second = sender.queue(b"b");
        assert_eq!((first, second), (1, 2));

        let later = Instant::now() + Duration::from_millis(200);
        let due = sender.due(later, Duration::from_millis(100));
        assert_eq!(due.len(), 2);
        assert!(sender.due(later, Duration::from_millis(100)).is_empty());

        assert_eq!(sender.acknowledge(0), 0);
        assert_eq!(sender.acknowledge(1), 1);
        assert_eq!(sender.unacked(), 1);
        assert_eq!(sender.acknowledge(5), 1);
    }
}
