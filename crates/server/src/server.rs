use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use castnet::CoreError;
use castnet::net::{
    ChallengeManager, ChannelId, ConnectionlessMessage, ConnectionlessPacket, Endpoint,
    PacketScheduler, RateLimiter, RateLimiterConfig, ServerInfo, SessionMessage, SessionPacket,
    ValidationResult, is_connectionless,
};
use castnet::relay::{
    DEMO_BASELINE_INTERVAL, DemoWriter, DispatchPlan, Frame, Relay, RelayState, encode_frame_body,
};
use castnet::session::{AdmissionPolicy, SessionConfig, SessionEvent, SessionTable};
use castnet::snapshot::{
    BaselineTable, DeltaCache, EntityState, TickHistory, TickSnapshot, build_snapshot,
};

use crate::config::ServerConfig;
use crate::events::{DisconnectReason, ServerEvent};

pub struct SessionServer {
    endpoint: Endpoint,
    limiter: RateLimiter,
    challenges: ChallengeManager,
    sessions: SessionTable,
    history: TickHistory,
    baselines: BaselineTable,
    cache: DeltaCache,
    scheduler: PacketScheduler,
    relay: Option<Relay>,
    relay_channel: ChannelId,
    relay_full_interval: u32,
    last_relay_tick: Option<u32>,
    demo: Option<DemoWriter<BufWriter<File>>>,
    entities: Vec<EntityState>,
    tick_events: Vec<u8>,
    signon: Vec<u8>,
    config: ServerConfig,
    tick: u32,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    running: Arc<AtomicBool>,
    pending_events: VecDeque<ServerEvent>,
}

impl SessionServer {
    pub fn new(bind_addr: &str, config: ServerConfig) -> Result<Self> {
        let endpoint = Endpoint::bind(bind_addr)
            .with_context(|| format!("failed to bind {}", bind_addr))?;
        let tick_duration = Duration::from_secs_f64(1.0 / config.tick_rate as f64);

        let sessions = SessionTable::new(SessionConfig {
            max_clients: config.max_clients,
            timeout: Duration::from_secs(config.timeout_secs),
            policy: AdmissionPolicy {
                password: config.password.clone(),
                ..Default::default()
            },
        });

        Ok(Self {
            endpoint,
            limiter: RateLimiter::new(RateLimiterConfig::default()),
            challenges: ChallengeManager::new(Duration::from_secs(
                config.challenge_lifetime_secs,
            )),
            sessions,
            history: TickHistory::new(config.history_size),
            baselines: BaselineTable::new(config.class_count),
            cache: DeltaCache::new(),
            scheduler: PacketScheduler::new(),
            relay: None,
            relay_channel: ChannelId::next(),
            // Full frames must recur within the frame ring's depth or a
            // lagged downstream has no self-contained frame to resync
            // from.
            relay_full_interval: (config.history_size as u32 / 2)
                .clamp(1, DEMO_BASELINE_INTERVAL),
            last_relay_tick: None,
            demo: None,
            entities: Vec::new(),
            tick_events: Vec::new(),
            signon: Vec::new(),
            tick: 0,
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            running: Arc::new(AtomicBool::new(true)),
            pending_events: VecDeque::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn current_tick(&self) -> u32 {
        self.tick
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    /// Sign-on blob served to every connecting client (and written into
    /// demo headers). Set before clients arrive.
    pub fn set_signon(&mut self, data: Vec<u8>) {
        self.signon = data;
    }

    pub fn set_baseline(&mut self, class: u8, state: EntityState) {
        self.baselines.set(class, state);
    }

    /// Replaces or inserts the current state for one entity. The next tick
    /// captures it into the history.
    pub fn update_entity(&mut self, state: EntityState) {
        match self.entities.iter_mut().find(|e| e.entity == state.entity) {
            Some(slot) => *slot = state,
            None => self.entities.push(state),
        }
    }

    pub fn remove_entity(&mut self, entity: u16) {
        self.entities.retain(|e| e.entity != entity);
    }

    /// Appends opaque game event data to the current tick's broadcast
    /// frame.
    pub fn queue_tick_events(&mut self, data: &[u8]) {
        self.tick_events.extend_from_slice(data);
    }

    /// Attaches an HLTV-style broadcast master to the snapshot stream.
    pub fn enable_relay(&mut self) -> Result<()> {
        let mut relay = Relay::with_ring_depth(self.config.history_size);
        relay.start_master(self.signon.clone())?;
        self.relay = Some(relay);
        Ok(())
    }

    pub fn add_relay_downstream(&mut self, addr: SocketAddr) {
        if let Some(relay) = self.relay.as_mut() {
            relay.add_downstream(addr, None);
        }
    }

    pub fn start_recording(&mut self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create demo {}", path.display()))?;
        let writer = DemoWriter::new(BufWriter::new(file), self.tick, &self.signon)?;
        log::info!("recording demo to {}", path.display());
        self.demo = Some(writer);
        Ok(())
    }

    pub fn stop_recording(&mut self) -> Result<()> {
        if let Some(writer) = self.demo.take() {
            let frames = writer.frames_written();
            writer.finish()?;
            log::info!("demo closed after {} frames", frames);
        }
        Ok(())
    }

    pub fn set_paused(&mut self, paused: bool) {
        if paused {
            self.sessions.pause_all();
            self.sessions
                .broadcast(&mut self.endpoint, &SessionMessage::Pause, |_| true);
        } else {
            self.sessions.unpause_all();
            self.sessions
                .broadcast(&mut self.endpoint, &SessionMessage::Unpause, |_| true);
        }
    }

    pub fn kick_user(&mut self, user_id: u32) {
        let Some(slot) = self
            .sessions
            .iter()
            .find(|s| s.user_id == user_id)
            .map(|s| s.slot)
        else {
            return;
        };

        self.sessions.broadcast(
            &mut self.endpoint,
            &SessionMessage::Disconnect {
                reason: "kicked".into(),
            },
            |s| s.user_id == user_id,
        );

        if let Some(session) = self.sessions.remove(slot) {
            self.scheduler.clear_for_channel(session.channel.id());
            self.pending_events
                .push_back(ServerEvent::ClientDisconnected {
                    user_id,
                    reason: DisconnectReason::Kicked,
                });
        }
    }

    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        self.sessions.broadcast(
            &mut self.endpoint,
            &SessionMessage::Disconnect {
                reason: "server shutting down".into(),
            },
            |_| true,
        );
        for slot in 0..self.config.max_clients {
            self.sessions.remove(slot);
        }

        if let Some(relay) = self.relay.as_mut() {
            for addr in relay.stop() {
                log::info!("relay downstream {} orphaned by shutdown", addr);
            }
        }
        if let Err(e) = self.stop_recording() {
            log::error!("failed to close demo: {}", e);
        }
        self.scheduler.shutdown();
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        let delta = now - self.last_tick_time;
        self.last_tick_time = now;
        self.accumulator += delta;

        if let Err(e) = self.process_network() {
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("network error: {}", e),
            });
        }

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick();
        }
    }

    fn tick(&mut self) {
        self.tick += 1;
        self.history
            .push(TickSnapshot::new(self.tick, self.entities.clone()));
        let tick_events = std::mem::take(&mut self.tick_events);

        if self.tick % self.config.snapshot_send_rate == 0 {
            let info = self.server_info();
            let events = self.sessions.run_frame(
                self.tick,
                &self.history,
                &self.baselines,
                &mut self.cache,
                &mut self.endpoint,
                &self.signon,
                &info,
                &tick_events,
                self.config.max_delta_ticks,
            );
            self.collect_session_events(events);
            self.broadcast_relay_frame(&tick_events);
        }

        let timed_out = self.sessions.check_timeouts();
        for dropped in timed_out {
            self.scheduler.clear_for_channel(dropped.channel);
            self.pending_events
                .push_back(ServerEvent::ClientDisconnected {
                    user_id: dropped.user_id,
                    reason: DisconnectReason::Timeout,
                });
        }
    }

    fn collect_session_events(&mut self, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::SignonSent { slot } => {
                    log::debug!("sign-on data sent to slot {}", slot);
                }
                SessionEvent::Activated { slot } => {
                    if let Some(session) = self.sessions.get_client(slot) {
                        self.pending_events.push_back(ServerEvent::ClientActivated {
                            user_id: session.user_id,
                            slot,
                        });
                    }
                }
                SessionEvent::UserInfoChanged { slot } => {
                    if let Some(session) = self.sessions.get_client(slot) {
                        self.pending_events.push_back(ServerEvent::UserInfoChanged {
                            user_id: session.user_id,
                            name: session.name.clone(),
                        });
                    }
                }
                SessionEvent::ChannelFault {
                    user_id, channel, ..
                } => {
                    self.scheduler.clear_for_channel(channel);
                    self.pending_events
                        .push_back(ServerEvent::ClientDisconnected {
                            user_id,
                            reason: DisconnectReason::ChannelFault,
                        });
                }
            }
        }
    }

    /// Builds the spectator frame for this tick, records it, and fans it
    /// out to relay downstreams through the deferred scheduler.
    fn broadcast_relay_frame(&mut self, tick_events: &[u8]) {
        let Some(relay) = self.relay.as_mut() else {
            return;
        };
        if relay.state() != RelayState::Broadcasting {
            return;
        }

        // Delta frames reference the previous broadcast tick, not the
        // previous simulation tick; with a send rate above 1 the
        // intermediate ticks are never transmitted.
        let is_full = self.last_relay_tick.is_none()
            || self.tick % self.relay_full_interval == 0
            || !relay.has_full_frame();
        let reference = if is_full { None } else { self.last_relay_tick };
        let built = match build_snapshot(
            &self.history,
            &self.baselines,
            &mut self.cache,
            reference,
            self.tick,
            &[],
            self.config.max_delta_ticks,
        ) {
            Ok(built) => built,
            Err(e) => {
                log::debug!("relay frame skipped for tick {}: {}", self.tick, e);
                return;
            }
        };

        let mut frame = Frame::new(self.tick);
        frame.is_full = built.is_full();
        frame.unreliable = built.payload;
        frame.temp_entities = tick_events.to_vec();

        let stored = match relay.add_frame(frame) {
            Ok(stored) => stored,
            Err(e) => {
                log::warn!("relay rejected frame: {}", e);
                return;
            }
        };
        self.last_relay_tick = Some(self.tick);

        if let Some(writer) = self.demo.as_mut() {
            if let Err(e) = writer.write_frame(&stored) {
                log::error!("demo write failed, recording aborted: {}", e);
                self.demo = None;
            }
        }

        for dispatch in relay.dispatch() {
            let payloads: Vec<Vec<u8>> = match dispatch.plan {
                DispatchPlan::FullSync { signon, frame } => {
                    vec![signon, encode_frame_body(&frame)]
                }
                DispatchPlan::Frames(frames) => {
                    frames.iter().map(|f| encode_frame_body(f)).collect()
                }
            };
            for payload in payloads {
                let queued = self.scheduler.enqueue(
                    self.relay_channel,
                    self.endpoint.socket(),
                    dispatch.addr,
                    payload,
                    Duration::ZERO,
                );
                if !queued {
                    log::warn!(
                        "relay frame for {} lost: {}",
                        dispatch.addr,
                        CoreError::ResourceExhausted("packet scheduler queue")
                    );
                }
            }
        }
    }

    /// Drains the socket. A malformed datagram drops only itself; a
    /// socket-level failure is propagated as a channel fault.
    fn process_network(&mut self) -> std::result::Result<(), CoreError> {
        let datagrams = self.endpoint.recv().map_err(CoreError::ChannelFault)?;
        for (data, addr) in datagrams {
            let result = if is_connectionless(&data) {
                self.handle_connectionless(&data, addr)
            } else {
                self.handle_session(&data, addr)
            };
            if let Err(e) = result {
                log::debug!("dropped datagram from {}: {}", addr, e);
            }
        }
        Ok(())
    }

    fn handle_connectionless(
        &mut self,
        data: &[u8],
        addr: SocketAddr,
    ) -> std::result::Result<(), CoreError> {
        if !self.limiter.check(addr) {
            log::debug!("rate limited query from {}", addr);
            return Ok(());
        }

        let packet = ConnectionlessPacket::decode(data).map_err(CoreError::Protocol)?;

        match packet.message {
            ConnectionlessMessage::GetChallenge => {
                self.pending_events
                    .push_back(ServerEvent::ClientConnecting { addr });
                let value = self.challenges.issue(addr);
                self.send_connectionless(ConnectionlessMessage::Challenge { value }, addr);
            }
            ConnectionlessMessage::Connect(request) => {
                match self.challenges.validate(addr, request.challenge) {
                    ValidationResult::Valid => {}
                    result => {
                        log::debug!("connect from {} refused: {:?}", addr, result);
                        let reason = CoreError::ChallengeInvalid.to_string();
                        self.send_connectionless(
                            ConnectionlessMessage::Reject {
                                reason: reason.clone(),
                            },
                            addr,
                        );
                        self.pending_events
                            .push_back(ServerEvent::ConnectionDenied { addr, reason });
                        return Ok(());
                    }
                }

                match self.sessions.try_admit(addr, &request, None) {
                    Ok((slot, user_id)) => {
                        self.send_connectionless(
                            ConnectionlessMessage::ConnectAck { user_id },
                            addr,
                        );
                        self.pending_events.push_back(ServerEvent::ClientConnected {
                            user_id,
                            slot,
                            addr,
                        });
                    }
                    Err(e) => {
                        let reason = CoreError::AdmissionRejected(e).to_string();
                        self.send_connectionless(
                            ConnectionlessMessage::Reject {
                                reason: reason.clone(),
                            },
                            addr,
                        );
                        self.pending_events
                            .push_back(ServerEvent::ConnectionDenied { addr, reason });
                    }
                }
            }
            ConnectionlessMessage::Ping => {
                self.send_connectionless(ConnectionlessMessage::Pong, addr);
            }
            ConnectionlessMessage::Info => {
                let info = self.server_info();
                self.send_connectionless(ConnectionlessMessage::InfoReply(info), addr);
            }
            ConnectionlessMessage::Rules => {
                self.send_connectionless(
                    ConnectionlessMessage::RulesReply {
                        rules: self.config.rules.clone(),
                    },
                    addr,
                );
            }
            ConnectionlessMessage::Rcon { password, command } => {
                match self.config.rcon_password.as_deref() {
                    Some(expected) if expected == password => {
                        self.pending_events
                            .push_back(ServerEvent::RconCommand { addr, command });
                    }
                    _ => log::warn!("rejected rcon attempt from {}", addr),
                }
            }
            // Server-to-client replies arriving here are stray reflections.
            other => {
                log::debug!("ignoring unexpected query from {}: {:?}", addr, other);
            }
        }
        Ok(())
    }

    fn handle_session(
        &mut self,
        data: &[u8],
        addr: SocketAddr,
    ) -> std::result::Result<(), CoreError> {
        let packet = SessionPacket::decode(data).map_err(CoreError::Protocol)?;

        let Some(slot) = self.sessions.by_addr(addr) else {
            log::debug!("session packet from unknown address {}", addr);
            return Ok(());
        };
        let Some(session) = self.sessions.get_client_mut(slot) else {
            return Ok(());
        };

        if !session.channel.receive_header(&packet.header) {
            // Duplicate or stale sequence.
            return Ok(());
        }
        session.channel.touch();

        match packet.message {
            SessionMessage::Ack { tick } => session.on_ack(tick),
            SessionMessage::UserInfo { name, settings } => {
                session.on_user_info(name, settings);
            }
            SessionMessage::Pause => {
                let user_id = session.user_id;
                self.pending_events
                    .push_back(ServerEvent::PauseRequested { user_id, pause: true });
            }
            SessionMessage::Unpause => {
                let user_id = session.user_id;
                self.pending_events.push_back(ServerEvent::PauseRequested {
                    user_id,
                    pause: false,
                });
            }
            SessionMessage::Disconnect { .. } => {
                if let Some(session) = self.sessions.remove(slot) {
                    self.scheduler.clear_for_channel(session.channel.id());
                    self.pending_events
                        .push_back(ServerEvent::ClientDisconnected {
                            user_id: session.user_id,
                            reason: DisconnectReason::Graceful,
                        });
                }
            }
            // Server-originated messages have no meaning inbound.
            SessionMessage::SignonData { .. }
            | SessionMessage::ServerInfo(_)
            | SessionMessage::Snapshot { .. } => {}
        }
        Ok(())
    }

    fn send_connectionless(&mut self, message: ConnectionlessMessage, addr: SocketAddr) {
        let data = match ConnectionlessPacket::new(message).encode() {
            Ok(data) => data,
            Err(e) => {
                log::error!("failed to encode reply to {}: {}", addr, e);
                return;
            }
        };
        if let Err(e) = self.endpoint.send_to(&data, addr) {
            log::debug!("failed to send reply to {}: {}", addr, e);
        }
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            hostname: self.config.hostname.clone(),
            map: self.config.map.clone(),
            protocol: castnet::net::PROTOCOL_VERSION,
            players: self.sessions.active_count() as u8,
            max_players: self.config.max_clients as u8,
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            tick: self.tick,
            client_count: self.sessions.client_count(),
            active_count: self.sessions.active_count(),
            max_clients: self.config.max_clients,
            scheduler_pending: self.scheduler.pending(),
            scheduler_dropped: self.scheduler.dropped(),
            cache_hits: self.cache.hit_rate().0,
            cache_misses: self.cache.hit_rate().1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub tick: u32,
    pub client_count: usize,
    pub active_count: usize,
    pub max_clients: usize,
    pub scheduler_pending: usize,
    pub scheduler_dropped: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use castnet::snapshot::apply_snapshot;

    fn test_server(config: ServerConfig) -> SessionServer {
        SessionServer::new("127.0.0.1:0", config).unwrap()
    }

    #[test]
    fn test_relay_resync_baseline_is_always_self_contained() {
        let mut server = test_server(ServerConfig::default());
        server.set_signon(b"signon".to_vec());
        server.enable_relay().unwrap();
        server.update_entity(EntityState::new(1, 0));

        // Run well past the frame ring depth before anyone attaches.
        for _ in 0..300 {
            server.tick();
        }

        let relay = server.relay.as_mut().unwrap();
        relay.add_downstream("127.0.0.1:9100".parse().unwrap(), None);
        let plans = relay.dispatch();
        assert_eq!(plans.len(), 1);
        match &plans[0].plan {
            DispatchPlan::FullSync { frame, .. } => {
                assert!(
                    frame.is_full,
                    "resync served delta frame at tick {}",
                    frame.tick
                );
            }
            other => panic!("expected full sync, got {:?}", other),
        }
    }

    #[test]
    fn test_relay_deltas_reference_the_previous_broadcast_tick() {
        let mut server = test_server(ServerConfig {
            snapshot_send_rate: 3,
            ..Default::default()
        });
        server.enable_relay().unwrap();

        let mut state = EntityState::new(1, 0);
        for i in 0..12u32 {
            state.health = i as i16;
            if i == 3 {
                // Changes once, then stays constant: a delta encoded
                // against the wrong reference tick omits it.
                state.origin = [64, 0, 0];
            }
            server.update_entity(state);
            server.tick();
        }

        let relay = server.relay.as_mut().unwrap();
        relay.add_downstream("127.0.0.1:9101".parse().unwrap(), None);

        let full = match &relay.dispatch()[0].plan {
            DispatchPlan::FullSync { frame, .. } => Arc::clone(frame),
            other => panic!("expected full sync, got {:?}", other),
        };
        assert_eq!(full.tick, 3);
        let deltas = match &relay.dispatch()[0].plan {
            DispatchPlan::Frames(frames) => frames.clone(),
            other => panic!("expected frames, got {:?}", other),
        };
        let ticks: Vec<u32> = deltas.iter().map(|f| f.tick).collect();
        assert_eq!(ticks, vec![6, 9, 12]);

        // The chain must reconstruct the final world state exactly.
        let (mut view, _) =
            apply_snapshot(None, &server.baselines, &full.unreliable, full.tick).unwrap();
        for frame in &deltas {
            let (next, _) =
                apply_snapshot(Some(&view), &server.baselines, &frame.unreliable, frame.tick)
                    .unwrap();
            view = next;
        }

        let mut cache = DeltaCache::new();
        let expect =
            build_snapshot(&server.history, &server.baselines, &mut cache, None, 12, &[], 192)
                .unwrap();
        let (expect_view, _) =
            apply_snapshot(None, &server.baselines, &expect.payload, 12).unwrap();
        assert_eq!(view.entities(), expect_view.entities());
    }

    #[test]
    fn test_malformed_session_datagram_is_a_protocol_error() {
        let mut server = test_server(ServerConfig::default());
        let addr = "127.0.0.1:9200".parse().unwrap();

        let err = server
            .handle_session(&[1, 0, 0, 0, 0xff, 0xff], addr)
            .unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
    }
}
