mod demo;

pub use demo::{
    decode_frame_body, encode_frame_body, DemoError, DemoReader, DemoRecord, DemoSource,
    DemoWriter, DEMO_BASELINE_INTERVAL, DEMO_MAGIC, DEMO_VERSION,
};

use std::net::SocketAddr;
use std::sync::Arc;

pub const DEFAULT_FRAME_RING: usize = 256;

/// One tick's bundle of outgoing message buffers, produced once and shared
/// by reference with every consumer that needs that tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub tick: u32,
    /// Frame carries a full (non-delta) snapshot; a client can start from
    /// it without any prior state.
    pub is_full: bool,
    pub director: Vec<u8>,
    pub reliable: Vec<u8>,
    pub unreliable: Vec<u8>,
    pub voice: Vec<u8>,
    pub sounds: Vec<u8>,
    pub temp_entities: Vec<u8>,
}

impl Frame {
    pub fn new(tick: u32) -> Self {
        Self {
            tick,
            ..Default::default()
        }
    }

    pub fn buffers(&self) -> [&Vec<u8>; 6] {
        [
            &self.director,
            &self.reliable,
            &self.unreliable,
            &self.voice,
            &self.sounds,
            &self.temp_entities,
        ]
    }

    pub fn buffers_mut(&mut self) -> [&mut Vec<u8>; 6] {
        [
            &mut self.director,
            &mut self.reliable,
            &mut self.unreliable,
            &mut self.voice,
            &mut self.sounds,
            &mut self.temp_entities,
        ]
    }

    pub fn total_len(&self) -> usize {
        self.buffers().iter().map(|b| b.len()).sum()
    }
}

/// Bounded ring of recent frames, indexed by tick. Depth bounds the
/// worst-case client lag served without a full resync.
#[derive(Debug)]
pub struct FrameRing {
    slots: Vec<Option<Arc<Frame>>>,
    capacity: usize,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            capacity,
        }
    }

    /// Appends a frame; ownership moves to the ring and the retained copy
    /// is returned.
    pub fn push(&mut self, frame: Frame) -> Arc<Frame> {
        let index = (frame.tick as usize) % self.capacity;
        let stored = Arc::new(frame);
        self.slots[index] = Some(Arc::clone(&stored));
        stored
    }

    pub fn get(&self, tick: u32) -> Option<Arc<Frame>> {
        let index = (tick as usize) % self.capacity;
        self.slots[index]
            .as_ref()
            .filter(|f| f.tick == tick)
            .cloned()
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.slots
            .iter()
            .flatten()
            .max_by_key(|f| f.tick)
            .cloned()
    }

    /// Oldest tick still resident; anything older needs a full resync.
    pub fn oldest_tick(&self) -> Option<u32> {
        self.slots.iter().flatten().map(|f| f.tick).min()
    }

    /// Newest self-contained frame, if any survive in the ring.
    pub fn latest_full(&self) -> Option<Arc<Frame>> {
        self.slots
            .iter()
            .flatten()
            .filter(|f| f.is_full)
            .max_by_key(|f| f.tick)
            .cloned()
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Broadcasting,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayRole {
    /// Attached directly to the primary server's snapshot stream.
    Master,
    /// Chained behind another relay instance; forwarding is pure
    /// pass-through of already-encoded frames.
    Relay { upstream: SocketAddr },
    /// Sources frames from a recorded demo stream.
    DemoPlayer,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay already started")]
    NotIdle,
    #[error("relay is not broadcasting")]
    NotBroadcasting,
}

#[derive(Debug)]
pub struct Downstream {
    pub addr: SocketAddr,
    pub last_sent_tick: Option<u32>,
    pub needs_full: bool,
}

/// What to transmit to one downstream this dispatch round.
#[derive(Debug)]
pub enum DispatchPlan {
    /// Downstream lagged past the ring (or just attached): serve the
    /// sign-on blob plus the newest frame as a fresh starting point.
    FullSync {
        signon: Vec<u8>,
        frame: Arc<Frame>,
    },
    /// In-window downstream: forward the frames it is missing.
    Frames(Vec<Arc<Frame>>),
}

#[derive(Debug)]
pub struct Dispatch {
    pub addr: SocketAddr,
    pub plan: DispatchPlan,
}

struct Playback {
    reader: DemoReader<Box<dyn DemoSource>>,
    rate: f32,
    paused: bool,
    accumulator: f32,
}

/// Broadcast relay: consumes the tick snapshot stream of a master server,
/// another relay, or a recorded demo, and fans frames out to its own
/// downstream consumers. A lagging downstream is resynced with a full
/// baseline, never dropped with an error.
pub struct Relay {
    role: Option<RelayRole>,
    state: RelayState,
    frames: FrameRing,
    signon: Vec<u8>,
    downstreams: Vec<Downstream>,
    playback: Option<Playback>,
}

impl Relay {
    pub fn new() -> Self {
        Self::with_ring_depth(DEFAULT_FRAME_RING)
    }

    pub fn with_ring_depth(depth: usize) -> Self {
        Self {
            role: None,
            state: RelayState::Idle,
            frames: FrameRing::new(depth),
            signon: Vec::new(),
            downstreams: Vec::new(),
            playback: None,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn role(&self) -> Option<&RelayRole> {
        self.role.as_ref()
    }

    /// Binds this relay to a live upstream session's snapshot stream.
    pub fn start_master(&mut self, signon: Vec<u8>) -> Result<(), RelayError> {
        if self.state != RelayState::Idle {
            return Err(RelayError::NotIdle);
        }
        self.role = Some(RelayRole::Master);
        self.signon = signon;
        self.state = RelayState::Broadcasting;
        log::info!("relay started as master");
        Ok(())
    }

    /// Chains this instance behind another relay at `upstream`.
    pub fn connect_relay(&mut self, upstream: SocketAddr) -> Result<(), RelayError> {
        if self.state != RelayState::Idle {
            return Err(RelayError::NotIdle);
        }
        self.role = Some(RelayRole::Relay { upstream });
        self.state = RelayState::Broadcasting;
        log::info!("relay chained to upstream {}", upstream);
        Ok(())
    }

    /// Starts demo playback in place of a live upstream.
    pub fn start_playback(
        &mut self,
        reader: DemoReader<Box<dyn DemoSource>>,
    ) -> Result<(), RelayError> {
        if self.state != RelayState::Idle {
            return Err(RelayError::NotIdle);
        }
        self.signon = reader.signon().to_vec();
        self.playback = Some(Playback {
            reader,
            rate: 1.0,
            paused: false,
            accumulator: 0.0,
        });
        self.role = Some(RelayRole::DemoPlayer);
        self.state = RelayState::Broadcasting;
        log::info!("relay started demo playback");
        Ok(())
    }

    /// Whether the ring still holds a self-contained frame. A producer
    /// should force its next frame full when this goes false, or a resync
    /// has no valid baseline to serve.
    pub fn has_full_frame(&self) -> bool {
        self.frames.latest_full().is_some()
    }

    /// Appends one tick's frame; the ring retains ownership and the stored
    /// copy is returned for any same-tick reuse by the caller.
    pub fn add_frame(&mut self, frame: Frame) -> Result<Arc<Frame>, RelayError> {
        if self.state != RelayState::Broadcasting {
            return Err(RelayError::NotBroadcasting);
        }
        Ok(self.frames.push(frame))
    }

    /// Advances demo playback by `dt_ticks` tick-times, honoring pause and
    /// rate scaling. Returns the frames that became current. Reaching the
    /// end of the stream stops the relay.
    pub fn advance_playback(&mut self, dt_ticks: f32) -> Result<Vec<Arc<Frame>>, DemoError> {
        let Some(playback) = self.playback.as_mut() else {
            return Ok(Vec::new());
        };
        if playback.paused || self.state != RelayState::Broadcasting {
            return Ok(Vec::new());
        }

        playback.accumulator += dt_ticks * playback.rate;
        let mut produced = Vec::new();
        let mut ended = false;

        while playback.accumulator >= 1.0 {
            playback.accumulator -= 1.0;
            match playback.reader.next()? {
                Some(record) => {
                    produced.push(self.frames.push(record.frame));
                }
                None => {
                    ended = true;
                    break;
                }
            }
        }

        if ended {
            log::info!("demo playback reached end of stream");
            self.stop();
        }
        Ok(produced)
    }

    pub fn set_playback_rate(&mut self, rate: f32) {
        if let Some(playback) = self.playback.as_mut() {
            playback.rate = rate.max(0.0);
        }
    }

    pub fn set_playback_paused(&mut self, paused: bool) {
        if let Some(playback) = self.playback.as_mut() {
            playback.paused = paused;
        }
    }

    /// Bounded backward seek; every downstream is resynced from a full
    /// baseline afterwards.
    pub fn seek_back(&mut self, tick: u32) -> Result<u32, DemoError> {
        let Some(playback) = self.playback.as_mut() else {
            return Err(DemoError::Corrupt("no playback source"));
        };
        let resumed = playback.reader.seek_back(tick)?;
        playback.accumulator = 0.0;
        self.frames.clear();
        for downstream in &mut self.downstreams {
            downstream.needs_full = true;
        }
        Ok(resumed)
    }

    /// Registers a downstream consumer, optionally resuming from a tick it
    /// already holds.
    pub fn add_downstream(&mut self, addr: SocketAddr, resume_tick: Option<u32>) -> usize {
        self.downstreams.push(Downstream {
            addr,
            last_sent_tick: resume_tick,
            needs_full: resume_tick.is_none(),
        });
        self.downstreams.len() - 1
    }

    pub fn drop_downstream(&mut self, addr: SocketAddr) {
        self.downstreams.retain(|d| d.addr != addr);
    }

    pub fn downstream_count(&self) -> usize {
        self.downstreams.len()
    }

    /// Best-effort fan-out decision for every downstream. A slow or absent
    /// downstream never blocks the others; one that lagged past the ring
    /// depth is served a fresh full baseline instead of an error.
    pub fn dispatch(&mut self) -> Vec<Dispatch> {
        if self.state != RelayState::Broadcasting {
            return Vec::new();
        }
        let Some(latest) = self.frames.latest() else {
            return Vec::new();
        };
        let oldest = self.frames.oldest_tick().unwrap_or(latest.tick);
        // Resyncs start from a self-contained frame when one is still in
        // the ring; followers then catch up through the deltas after it.
        let baseline = self.frames.latest_full().unwrap_or_else(|| Arc::clone(&latest));

        let mut plans = Vec::new();
        for downstream in &mut self.downstreams {
            let in_window = match downstream.last_sent_tick {
                Some(t) => t >= oldest.saturating_sub(1) && t <= latest.tick,
                None => false,
            };

            if downstream.needs_full || !in_window {
                downstream.last_sent_tick = Some(baseline.tick);
                downstream.needs_full = false;
                plans.push(Dispatch {
                    addr: downstream.addr,
                    plan: DispatchPlan::FullSync {
                        signon: self.signon.clone(),
                        frame: Arc::clone(&baseline),
                    },
                });
                continue;
            }

            let from = downstream.last_sent_tick.unwrap();
            if from == latest.tick {
                continue;
            }
            let mut missing = Vec::new();
            for tick in (from + 1)..=latest.tick {
                if let Some(frame) = self.frames.get(tick) {
                    missing.push(frame);
                }
            }
            downstream.last_sent_tick = Some(latest.tick);
            if !missing.is_empty() {
                plans.push(Dispatch {
                    addr: downstream.addr,
                    plan: DispatchPlan::Frames(missing),
                });
            }
        }
        plans
    }

    /// Stops broadcasting (explicit shutdown or broken upstream). Returns
    /// the downstream addresses that must be notified.
    pub fn stop(&mut self) -> Vec<SocketAddr> {
        if self.state == RelayState::Stopped {
            return Vec::new();
        }
        self.state = RelayState::Stopped;
        log::info!("relay stopped");
        self.downstreams.iter().map(|d| d.addr).collect()
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn frame(tick: u32) -> Frame {
        let mut f = Frame::new(tick);
        f.unreliable = vec![tick as u8; 8];
        f
    }

    #[test]
    fn test_state_machine() {
        let mut relay = Relay::new();
        assert_eq!(relay.state(), RelayState::Idle);
        assert_eq!(
            relay.add_frame(frame(1)),
            Err(RelayError::NotBroadcasting)
        );

        relay.start_master(b"signon".to_vec()).unwrap();
        assert_eq!(relay.state(), RelayState::Broadcasting);
        assert_eq!(relay.start_master(vec![]), Err(RelayError::NotIdle));

        relay.stop();
        assert_eq!(relay.state(), RelayState::Stopped);
    }

    #[test]
    fn test_add_frame_returns_retained_copy() {
        let mut relay = Relay::new();
        relay.start_master(vec![]).unwrap();

        let stored = relay.add_frame(frame(7)).unwrap();
        assert_eq!(stored.tick, 7);
        assert!(Arc::ptr_eq(&stored, &relay.frames.get(7).unwrap()));
    }

    #[test]
    fn test_new_downstream_gets_full_sync() {
        let mut relay = Relay::new();
        relay.start_master(b"signon".to_vec()).unwrap();
        for tick in 1..=5 {
            relay.add_frame(frame(tick)).unwrap();
        }

        relay.add_downstream(addr(9000), None);
        let plans = relay.dispatch();
        assert_eq!(plans.len(), 1);
        match &plans[0].plan {
            DispatchPlan::FullSync { signon, frame } => {
                assert_eq!(signon, b"signon");
                assert_eq!(frame.tick, 5);
            }
            other => panic!("expected full sync, got {:?}", other),
        }
    }

    #[test]
    fn test_in_window_downstream_gets_missing_frames() {
        let mut relay = Relay::new();
        relay.start_master(vec![]).unwrap();
        for tick in 1..=5 {
            relay.add_frame(frame(tick)).unwrap();
        }

        relay.add_downstream(addr(9000), Some(3));
        let plans = relay.dispatch();
        assert_eq!(plans.len(), 1);
        match &plans[0].plan {
            DispatchPlan::Frames(frames) => {
                let ticks: Vec<u32> = frames.iter().map(|f| f.tick).collect();
                assert_eq!(ticks, vec![4, 5]);
            }
            other => panic!("expected frames, got {:?}", other),
        }

        // Nothing new: no plan for an up-to-date downstream.
        assert!(relay.dispatch().is_empty());
    }

    #[test]
    fn test_lagged_downstream_resynced_with_full_baseline() {
        let mut relay = Relay::with_ring_depth(64);
        relay.start_master(b"signon".to_vec()).unwrap();
        for tick in 1..=200 {
            relay.add_frame(frame(tick)).unwrap();
        }

        // Downstream attaches holding tick 10, far older than the ring.
        relay.add_downstream(addr(9000), Some(10));
        let plans = relay.dispatch();
        assert_eq!(plans.len(), 1);
        assert!(matches!(
            plans[0].plan,
            DispatchPlan::FullSync { ref frame, .. } if frame.tick == 200
        ));
    }

    #[test]
    fn test_full_sync_starts_from_newest_full_frame() {
        let mut relay = Relay::new();
        relay.start_master(vec![]).unwrap();
        for tick in 1..=20 {
            let mut f = frame(tick);
            f.is_full = tick % 8 == 0;
            relay.add_frame(f).unwrap();
        }

        relay.add_downstream(addr(9000), None);
        let plans = relay.dispatch();
        assert!(matches!(
            plans[0].plan,
            DispatchPlan::FullSync { ref frame, .. } if frame.tick == 16
        ));

        // The follow-up dispatch forwards the deltas after the baseline.
        let plans = relay.dispatch();
        match &plans[0].plan {
            DispatchPlan::Frames(frames) => {
                let ticks: Vec<u32> = frames.iter().map(|f| f.tick).collect();
                assert_eq!(ticks, vec![17, 18, 19, 20]);
            }
            other => panic!("expected frames, got {:?}", other),
        }
    }

    #[test]
    fn test_stop_reports_downstreams() {
        let mut relay = Relay::new();
        relay.start_master(vec![]).unwrap();
        relay.add_downstream(addr(9000), None);
        relay.add_downstream(addr(9001), None);

        let notify = relay.stop();
        assert_eq!(notify, vec![addr(9000), addr(9001)]);
        // Idempotent.
        assert!(relay.stop().is_empty());
    }

    fn recorded_demo(ticks: std::ops::Range<u32>) -> Vec<u8> {
        let mut writer = DemoWriter::new(Vec::new(), ticks.start, b"demo signon").unwrap();
        for tick in ticks {
            let mut f = frame(tick);
            f.is_full = tick % 16 == 0;
            writer.write_frame(&f).unwrap();
        }
        writer.finish().unwrap()
    }

    fn playback_reader(data: Vec<u8>) -> DemoReader<Box<dyn DemoSource>> {
        DemoReader::new(Box::new(Cursor::new(data)) as Box<dyn DemoSource>).unwrap()
    }

    #[test]
    fn test_playback_produces_frames_at_rate() {
        let mut relay = Relay::new();
        relay
            .start_playback(playback_reader(recorded_demo(0..32)))
            .unwrap();
        assert_eq!(relay.signon, b"demo signon");

        let produced = relay.advance_playback(3.0).unwrap();
        assert_eq!(produced.len(), 3);
        assert_eq!(produced[0].tick, 0);

        // Double rate covers twice the ticks per call.
        relay.set_playback_rate(2.0);
        let produced = relay.advance_playback(3.0).unwrap();
        assert_eq!(produced.len(), 6);
    }

    #[test]
    fn test_playback_pause() {
        let mut relay = Relay::new();
        relay
            .start_playback(playback_reader(recorded_demo(0..8)))
            .unwrap();

        relay.set_playback_paused(true);
        assert!(relay.advance_playback(5.0).unwrap().is_empty());
        relay.set_playback_paused(false);
        assert!(!relay.advance_playback(1.0).unwrap().is_empty());
    }

    #[test]
    fn test_playback_end_stops_relay() {
        let mut relay = Relay::new();
        relay
            .start_playback(playback_reader(recorded_demo(0..4)))
            .unwrap();

        relay.advance_playback(10.0).unwrap();
        assert_eq!(relay.state(), RelayState::Stopped);
    }

    #[test]
    fn test_playback_seek_back_forces_full_resync() {
        let mut relay = Relay::new();
        relay
            .start_playback(playback_reader(recorded_demo(0..40)))
            .unwrap();
        relay.add_downstream(addr(9000), None);

        relay.advance_playback(40.0).unwrap();
        relay.dispatch();

        let resumed = relay.seek_back(20).unwrap();
        assert_eq!(resumed, 16);

        relay.advance_playback(1.0).unwrap();
        let plans = relay.dispatch();
        assert!(matches!(plans[0].plan, DispatchPlan::FullSync { .. }));
    }
}
