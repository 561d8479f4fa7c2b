use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use super::protocol::{sequence_greater_than, PacketHeader};

static NEXT_CHANNEL_ID: AtomicU32 = AtomicU32::new(1);

/// Opaque, non-owning channel identity. Scheduler entries carry this
/// instead of a reference so a closed channel can be purged by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u32);

impl ChannelId {
    /// Allocates a fresh process-unique id.
    pub fn next() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Tracks which remote sequences we have seen, producing the ack +
/// 32-packet bitfield echoed in outgoing headers.
#[derive(Debug)]
pub struct ReceiveTracker {
    last_received: u32,
    received_bits: u32,
    recent: VecDeque<u32>,
    max_recent: usize,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            last_received: 0,
            received_bits: 0,
            recent: VecDeque::with_capacity(128),
            max_recent: 128,
        }
    }

    /// Records an incoming sequence; returns false for duplicates.
    pub fn record(&mut self, sequence: u32) -> bool {
        if self.recent.contains(&sequence) {
            return false;
        }

        if self.recent.len() >= self.max_recent {
            self.recent.pop_front();
        }
        self.recent.push_back(sequence);

        if sequence_greater_than(sequence, self.last_received) {
            let diff = sequence.wrapping_sub(self.last_received);
            if diff <= 32 {
                self.received_bits = (self.received_bits << diff) | 1;
            } else {
                self.received_bits = 0;
            }
            self.last_received = sequence;
        } else {
            let diff = self.last_received.wrapping_sub(sequence);
            if diff > 0 && diff <= 32 {
                self.received_bits |= 1 << (diff - 1);
            }
        }

        true
    }

    pub fn ack_data(&self) -> (u32, u32) {
        (self.last_received, self.received_bits)
    }
}

/// Smoothed RTT over acked outgoing sequences (RFC 6298 constants).
#[derive(Debug)]
struct RttEstimator {
    outstanding: VecDeque<(u32, Instant)>,
    srtt: f32,
    rtt_var: f32,
}

impl RttEstimator {
    fn new() -> Self {
        Self {
            outstanding: VecDeque::with_capacity(256),
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }

    fn on_send(&mut self, sequence: u32) {
        while self.outstanding.len() >= 256 {
            self.outstanding.pop_front();
        }
        self.outstanding.push_back((sequence, Instant::now()));
    }

    fn on_ack(&mut self, ack: u32, ack_bits: u32) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let now = Instant::now();
        while let Some(&(seq, sent_at)) = self.outstanding.front() {
            let acked = seq == ack
                || (sequence_greater_than(ack, seq) && {
                    let diff = ack.wrapping_sub(seq);
                    diff <= 32 && (ack_bits & (1 << (diff - 1))) != 0
                });
            if !acked && !sequence_greater_than(ack, seq) {
                break;
            }
            self.outstanding.pop_front();
            if acked {
                let rtt = now.duration_since(sent_at).as_secs_f32() * 1000.0;
                let diff = (rtt - self.srtt).abs();
                self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
                self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
            }
        }
    }
}

/// Per-session reliable+unreliable stream abstraction: outgoing sequence
/// numbers, incoming dedup/ack state, and inactivity tracking.
#[derive(Debug)]
pub struct NetChannel {
    id: ChannelId,
    remote_addr: SocketAddr,
    send_sequence: u32,
    receive_tracker: ReceiveTracker,
    rtt: RttEstimator,
    last_receive_time: Instant,
    created_at: Instant,
    pub packets_sent: u64,
    pub bytes_sent: u64,
}

impl NetChannel {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: ChannelId::next(),
            remote_addr,
            send_sequence: 0,
            receive_tracker: ReceiveTracker::new(),
            rtt: RttEstimator::new(),
            last_receive_time: Instant::now(),
            created_at: Instant::now(),
            packets_sent: 0,
            bytes_sent: 0,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_duration(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Next outgoing header; advances the send sequence and echoes the
    /// current ack state.
    pub fn next_header(&mut self) -> PacketHeader {
        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.rtt.on_send(sequence);

        let (ack, ack_bits) = self.receive_tracker.ack_data();
        PacketHeader::new(sequence, ack, ack_bits)
    }

    /// Processes an incoming header. Returns false when the sequence is a
    /// duplicate and the datagram should be dropped.
    pub fn receive_header(&mut self, header: &PacketHeader) -> bool {
        if !self.receive_tracker.record(header.sequence) {
            return false;
        }
        self.rtt.on_ack(header.ack, header.ack_bits);
        self.last_receive_time = Instant::now();
        true
    }

    pub fn touch(&mut self) {
        self.last_receive_time = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_receive_time.elapsed() > timeout
    }

    pub fn rtt_ms(&self) -> f32 {
        self.rtt.srtt
    }

    pub fn record_send(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:27025".parse().unwrap()
    }

    #[test]
    fn test_receive_tracker_bitfield() {
        let mut tracker = ReceiveTracker::new();

        tracker.record(1);
        tracker.record(2);
        tracker.record(3);

        let (ack, bits) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bits & 0b11, 0b11);
    }

    #[test]
    fn test_receive_tracker_out_of_order() {
        let mut tracker = ReceiveTracker::new();

        tracker.record(3);
        tracker.record(1);
        tracker.record(2);

        let (ack, bits) = tracker.ack_data();
        assert_eq!(ack, 3);
        assert_eq!(bits & 0b11, 0b11);
    }

    #[test]
    fn test_duplicate_detection() {
        let mut channel = NetChannel::new(test_addr());

        assert!(channel.receive_header(&PacketHeader::new(1, 0, 0)));
        assert!(!channel.receive_header(&PacketHeader::new(1, 0, 0)));
        assert!(channel.receive_header(&PacketHeader::new(2, 0, 0)));
    }

    #[test]
    fn test_channel_ids_unique() {
        let a = NetChannel::new(test_addr());
        let b = NetChannel::new(test_addr());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_header_sequence_advances() {
        let mut channel = NetChannel::new(test_addr());
        let h1 = channel.next_header();
        let h2 = channel.next_header();
        assert_eq!(h2.sequence, h1.sequence.wrapping_add(1));
    }

    #[test]
    fn test_timeout() {
        let channel = NetChannel::new(test_addr());
        assert!(!channel.is_timed_out(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(channel.is_timed_out(Duration::from_millis(1)));
    }
}
