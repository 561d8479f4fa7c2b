use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::channel::ChannelId;

pub const DEFAULT_SCHEDULER_CAPACITY: usize = 1024;

/// Upper bound on how long the worker sleeps without a wake, so it
/// re-checks the exit flag even when the queue is idle.
const WORKER_IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct QueuedPacket {
    due: Instant,
    seq: u64,
    channel: ChannelId,
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    payload: Vec<u8>,
}

impl PartialEq for QueuedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for QueuedPacket {}

impl PartialOrd for QueuedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedPacket {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // due-time first, enqueue order as tie-break so equal delays on the
        // same channel still go out FIFO.
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

struct SchedulerQueue {
    heap: BinaryHeap<Reverse<QueuedPacket>>,
    next_seq: u64,
}

struct Shared {
    queue: Mutex<SchedulerQueue>,
    wake: Condvar,
    exit: AtomicBool,
    dropped: AtomicU64,
    capacity: usize,
}

/// Time-ordered outbound datagram queue drained by a dedicated sender
/// thread, so the tick loop never blocks on a congested socket.
pub struct PacketScheduler {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PacketScheduler {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SCHEDULER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(SchedulerQueue {
                heap: BinaryHeap::with_capacity(capacity),
                next_seq: 0,
            }),
            wake: Condvar::new(),
            exit: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            capacity,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("packet-scheduler".into())
            .spawn(move || worker_loop(&worker_shared))
            .expect("failed to spawn packet scheduler thread");

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Queues a datagram for transmission `delay` from now. Returns false
    /// when the queue is full and the packet was dropped.
    pub fn enqueue(
        &self,
        channel: ChannelId,
        socket: Arc<UdpSocket>,
        dest: SocketAddr,
        payload: Vec<u8>,
        delay: Duration,
    ) -> bool {
        let due = Instant::now() + delay;

        {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.heap.len() >= self.shared.capacity {
                drop(queue);
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 128 == 0 {
                    log::warn!(
                        "packet scheduler queue full, {} packets dropped so far",
                        dropped
                    );
                }
                return false;
            }

            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.heap.push(Reverse(QueuedPacket {
                due,
                seq,
                channel,
                socket,
                dest,
                payload,
            }));
        }

        self.shared.wake.notify_one();
        true
    }

    /// Purges every pending entry for a closing channel. Safe to call while
    /// the worker is draining; removal happens under the queue lock.
    pub fn clear_for_channel(&self, channel: ChannelId) -> usize {
        let mut queue = self.shared.queue.lock().unwrap();
        let before = queue.heap.len();
        let retained: BinaryHeap<Reverse<QueuedPacket>> = std::mem::take(&mut queue.heap)
            .into_iter()
            .filter(|Reverse(p)| p.channel != channel)
            .collect();
        queue.heap = retained;
        before - queue.heap.len()
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().unwrap().heap.len()
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn shutdown(&mut self) {
        self.shared.exit.store(true, Ordering::SeqCst);
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        // Remaining entries are dropped with the queue.
        self.shared.queue.lock().unwrap().heap.clear();
    }
}

impl Default for PacketScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PacketScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    let mut due_batch: Vec<QueuedPacket> = Vec::new();
    let mut queue = shared.queue.lock().unwrap();

    while !shared.exit.load(Ordering::SeqCst) {
        let now = Instant::now();
        while queue.heap.peek().is_some_and(|Reverse(p)| p.due <= now) {
            let Reverse(packet) = queue.heap.pop().unwrap();
            due_batch.push(packet);
        }

        if !due_batch.is_empty() {
            drop(queue);
            for packet in due_batch.drain(..) {
                // Entries whose destination went away are removed but not
                // transmitted.
                if packet.dest.ip().is_unspecified() || packet.dest.port() == 0 {
                    continue;
                }
                if let Err(e) = packet.socket.send_to(&packet.payload, packet.dest) {
                    log::debug!("deferred send to {} failed: {}", packet.dest, e);
                }
            }
            queue = shared.queue.lock().unwrap();
            continue;
        }

        let wait = queue
            .heap
            .peek()
            .map(|Reverse(p)| p.due.saturating_duration_since(Instant::now()))
            .unwrap_or(WORKER_IDLE_WAIT)
            .min(WORKER_IDLE_WAIT);
        let (guard, _timeout) = shared.wake.wait_timeout(queue, wait).unwrap();
        queue = guard;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_pair() -> (Arc<UdpSocket>, UdpSocket, SocketAddr) {
        let sender = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let dest = receiver.local_addr().unwrap();
        (sender, receiver, dest)
    }

    #[test]
    fn test_immediate_delivery() {
        let scheduler = PacketScheduler::new();
        let (sender, receiver, dest) = loopback_pair();
        let channel = crate::net::NetChannel::new(dest).id();

        assert!(scheduler.enqueue(channel, sender, dest, b"deferred".to_vec(), Duration::ZERO));

        let mut buf = [0u8; 64];
        let (size, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..size], b"deferred");
    }

    #[test]
    fn test_overflow_drops_and_counts() {
        let scheduler = PacketScheduler::with_capacity(4);
        let (sender, _receiver, dest) = loopback_pair();
        let channel = crate::net::NetChannel::new(dest).id();

        // Far-future due times keep everything queued while we overflow.
        let delay = Duration::from_secs(60);
        for _ in 0..4 {
            assert!(scheduler.enqueue(
                channel,
                Arc::clone(&sender),
                dest,
                vec![0u8; 8],
                delay
            ));
        }
        assert!(!scheduler.enqueue(channel, sender, dest, vec![0u8; 8], delay));
        assert_eq!(scheduler.dropped(), 1);
        assert_eq!(scheduler.pending(), 4);
    }

    #[test]
    fn test_clear_for_channel() {
        let scheduler = PacketScheduler::new();
        let (sender, _receiver, dest) = loopback_pair();
        let keep = crate::net::NetChannel::new(dest).id();
        let purge = crate::net::NetChannel::new(dest).id();

        let delay = Duration::from_secs(60);
        for _ in 0..3 {
            scheduler.enqueue(purge, Arc::clone(&sender), dest, vec![1], delay);
        }
        scheduler.enqueue(keep, sender, dest, vec![2], delay);

        assert_eq!(scheduler.clear_for_channel(purge), 3);
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn test_shutdown_joins_worker() {
        let mut scheduler = PacketScheduler::new();
        scheduler.shutdown();
        // Idempotent.
        scheduler.shutdown();
    }
}
