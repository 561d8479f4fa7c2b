use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::net::{
    ChannelId, ConnectRequest, Endpoint, NetChannel, ServerInfo, SessionMessage, SessionPacket,
    PROTOCOL_VERSION,
};
use crate::snapshot::{build_snapshot, BaselineTable, DeltaCache, TickHistory};

/// User ids wrap at this bound; an id is only reused once no active
/// session holds it.
pub const USER_ID_WRAP: u32 = 1 << 16;

/// External ticket/identity validator invoked during admission.
pub trait TicketValidator {
    fn validate_ticket(&self, ticket: &[u8]) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Admitted, waiting for sign-on data to go out.
    Connecting,
    /// Sign-on sent, waiting for the first full snapshot baseline.
    Spawning,
    Active,
    Paused,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("server is full")]
    ServerFull,
    #[error("protocol version mismatch (server {server}, client {client})")]
    BadProtocol { server: u32, client: u32 },
    #[error("bad password")]
    BadPassword,
    #[error("ticket validation failed")]
    BadTicket,
}

#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    pub protocol: u32,
    pub password: Option<String>,
    pub require_ticket: bool,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            protocol: PROTOCOL_VERSION,
            password: None,
            require_ticket: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_clients: usize,
    pub timeout: Duration,
    pub policy: AdmissionPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_clients: 32,
            timeout: Duration::from_secs(30),
            policy: AdmissionPolicy::default(),
        }
    }
}

/// Server-side state for one connected client. Owned exclusively by the
/// session table; the channel is owned exclusively by the session.
#[derive(Debug)]
pub struct ClientSession {
    pub slot: usize,
    pub user_id: u32,
    pub name: String,
    pub addr: SocketAddr,
    pub channel: NetChannel,
    pub state: SessionState,
    pub last_received_tick: u32,
    pub acked_tick: Option<u32>,
    pub settings: Vec<(String, String)>,
    user_info_version: u32,
    applied_info_version: u32,
    pub connected_at: Instant,
}

impl ClientSession {
    fn new(slot: usize, user_id: u32, name: String, addr: SocketAddr) -> Self {
        Self {
            slot,
            user_id,
            name,
            addr,
            channel: NetChannel::new(addr),
            state: SessionState::Connecting,
            last_received_tick: 0,
            acked_tick: None,
            settings: Vec::new(),
            user_info_version: 0,
            applied_info_version: 0,
            connected_at: Instant::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Active | SessionState::Paused)
    }

    /// Records a client ack of `tick`; older acks are ignored.
    pub fn on_ack(&mut self, tick: u32) {
        if self.acked_tick.is_none_or(|t| tick > t) {
            self.acked_tick = Some(tick);
        }
        if tick > self.last_received_tick {
            self.last_received_tick = tick;
        }
    }

    pub fn on_user_info(&mut self, name: String, settings: Vec<(String, String)>) {
        if self.name == name && self.settings == settings {
            return;
        }
        self.name = name;
        self.settings = settings;
        self.user_info_version = self.user_info_version.wrapping_add(1);
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    SignonSent { slot: usize },
    Activated { slot: usize },
    UserInfoChanged { slot: usize },
    ChannelFault { slot: usize, user_id: u32, channel: ChannelId },
}

#[derive(Debug)]
pub struct DroppedSession {
    pub slot: usize,
    pub user_id: u32,
    pub channel: ChannelId,
}

/// Fixed-capacity table of client sessions indexed by slot.
pub struct SessionTable {
    slots: Vec<Option<ClientSession>>,
    next_user_id: u32,
    config: SessionConfig,
    paused: bool,
}

impl SessionTable {
    pub fn new(config: SessionConfig) -> Self {
        let slots = (0..config.max_clients).map(|_| None).collect();
        Self {
            slots,
            next_user_id: 0,
            config,
            paused: false,
        }
    }

    /// Admission: challenge validation has already happened at the
    /// connectionless layer. Runs the protocol/password/ticket checks and
    /// allocates a slot. Re-sending `Connect` for an address that already
    /// has a session returns the existing slot instead of allocating a
    /// second one.
    pub fn try_admit(
        &mut self,
        addr: SocketAddr,
        request: &ConnectRequest,
        tickets: Option<&dyn TicketValidator>,
    ) -> Result<(usize, u32), AdmissionError> {
        if let Some(slot) = self.by_addr(addr) {
            let session = self.slots[slot].as_ref().unwrap();
            return Ok((slot, session.user_id));
        }

        if request.protocol != self.config.policy.protocol {
            return Err(AdmissionError::BadProtocol {
                server: self.config.policy.protocol,
                client: request.protocol,
            });
        }

        if let Some(password) = &self.config.policy.password {
            if request.password.as_deref() != Some(password.as_str()) {
                return Err(AdmissionError::BadPassword);
            }
        }

        if self.config.policy.require_ticket {
            let valid = match (&request.ticket, tickets) {
                (Some(ticket), Some(validator)) => validator.validate_ticket(ticket),
                _ => false,
            };
            if !valid {
                return Err(AdmissionError::BadTicket);
            }
        }

        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(AdmissionError::ServerFull)?;

        let user_id = self.alloc_user_id();
        let session = ClientSession::new(slot, user_id, request.name.clone(), addr);
        log::info!(
            "admitted {} as user {} (slot {})",
            addr,
            user_id,
            slot
        );
        self.slots[slot] = Some(session);
        Ok((slot, user_id))
    }

    fn alloc_user_id(&mut self) -> u32 {
        loop {
            self.next_user_id = (self.next_user_id + 1) % USER_ID_WRAP;
            if self.next_user_id == 0 {
                continue;
            }
            let candidate = self.next_user_id;
            let in_use = self
                .slots
                .iter()
                .flatten()
                .any(|s| s.user_id == candidate);
            if !in_use {
                return candidate;
            }
        }
    }

    pub fn by_addr(&self, addr: SocketAddr) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.addr == addr))
    }

    pub fn get_client(&self, slot: usize) -> Option<&ClientSession> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    pub fn get_client_mut(&mut self, slot: usize) -> Option<&mut ClientSession> {
        self.slots.get_mut(slot).and_then(|s| s.as_mut())
    }

    pub fn client_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|s| s.is_connected())
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.config.max_clients
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.slots.iter().flatten()
    }

    /// Frees a slot. The caller is responsible for purging the channel's
    /// scheduler entries with the returned session's channel id.
    pub fn remove(&mut self, slot: usize) -> Option<ClientSession> {
        self.slots.get_mut(slot).and_then(|s| s.take())
    }

    /// Server-wide pause: every connected session flips to `Paused`; no
    /// per-session data is discarded.
    pub fn pause_all(&mut self) {
        self.paused = true;
        for session in self.slots.iter_mut().flatten() {
            if session.state == SessionState::Active {
                session.state = SessionState::Paused;
            }
        }
    }

    pub fn unpause_all(&mut self) {
        self.paused = false;
        for session in self.slots.iter_mut().flatten() {
            if session.state == SessionState::Paused {
                session.state = SessionState::Active;
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Per-tick driver: sends pending sign-on data to `Connecting`
    /// sessions, the first full baseline to `Spawning` sessions, and a
    /// delta snapshot to every `Active` session. `tick_events` is this
    /// tick's opaque game-event blob, carried inside each snapshot
    /// payload. A send failure on an established channel drops that one
    /// session only.
    pub fn run_frame(
        &mut self,
        tick: u32,
        history: &TickHistory,
        baselines: &BaselineTable,
        cache: &mut DeltaCache,
        endpoint: &mut Endpoint,
        signon: &[u8],
        server_info: &ServerInfo,
        tick_events: &[u8],
        max_delta_ticks: u32,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let mut faulted = Vec::new();

        for index in 0..self.slots.len() {
            let Some(session) = self.slots[index].as_mut() else {
                continue;
            };

            let result = match session.state {
                SessionState::Connecting => {
                    let sent = send_message(
                        session,
                        endpoint,
                        SessionMessage::ServerInfo(server_info.clone()),
                    )
                    .and_then(|_| {
                        send_message(
                            session,
                            endpoint,
                            SessionMessage::SignonData {
                                data: signon.to_vec(),
                            },
                        )
                    });
                    if sent.is_ok() {
                        session.state = SessionState::Spawning;
                        events.push(SessionEvent::SignonSent { slot: index });
                    }
                    sent
                }
                SessionState::Spawning => {
                    // First update is always full, regardless of acks.
                    match build_snapshot(
                        history,
                        baselines,
                        cache,
                        None,
                        tick,
                        tick_events,
                        max_delta_ticks,
                    ) {
                        Ok(built) => {
                            let sent = send_message(
                                session,
                                endpoint,
                                SessionMessage::Snapshot {
                                    tick: built.tick,
                                    delta_tick: built.delta_tick,
                                    payload: built.payload,
                                },
                            );
                            if sent.is_ok() {
                                session.state = SessionState::Active;
                                events.push(SessionEvent::Activated { slot: index });
                            }
                            sent
                        }
                        Err(e) => {
                            log::debug!("no baseline for tick {}: {}", tick, e);
                            Ok(())
                        }
                    }
                }
                SessionState::Active => {
                    match build_snapshot(
                        history,
                        baselines,
                        cache,
                        session.acked_tick,
                        tick,
                        tick_events,
                        max_delta_ticks,
                    ) {
                        Ok(built) => send_message(
                            session,
                            endpoint,
                            SessionMessage::Snapshot {
                                tick: built.tick,
                                delta_tick: built.delta_tick,
                                payload: built.payload,
                            },
                        ),
                        Err(e) => {
                            log::debug!("snapshot build failed for slot {}: {}", index, e);
                            Ok(())
                        }
                    }
                }
                SessionState::Paused => Ok(()),
            };

            if session.user_info_version != session.applied_info_version {
                session.applied_info_version = session.user_info_version;
                events.push(SessionEvent::UserInfoChanged { slot: index });
            }

            if result.is_err() {
                faulted.push(index);
            }
        }

        for index in faulted {
            if let Some(session) = self.remove(index) {
                log::warn!(
                    "dropping user {} (slot {}): channel send failed",
                    session.user_id,
                    index
                );
                events.push(SessionEvent::ChannelFault {
                    slot: index,
                    user_id: session.user_id,
                    channel: session.channel.id(),
                });
            }
        }

        events
    }

    /// Drops every session whose channel has been silent past the
    /// configured inactivity interval.
    pub fn check_timeouts(&mut self) -> Vec<DroppedSession> {
        let timeout = self.config.timeout;
        let mut dropped = Vec::new();

        for index in 0..self.slots.len() {
            let timed_out = self.slots[index]
                .as_ref()
                .is_some_and(|s| s.channel.is_timed_out(timeout));
            if timed_out {
                let session = self.slots[index].take().unwrap();
                log::info!("user {} timed out (slot {})", session.user_id, index);
                dropped.push(DroppedSession {
                    slot: index,
                    user_id: session.user_id,
                    channel: session.channel.id(),
                });
            }
        }

        dropped
    }

    /// Sends a message to every connected session matching `filter`;
    /// returns how many sends succeeded. Exposed for game-rule code.
    pub fn broadcast<F>(
        &mut self,
        endpoint: &mut Endpoint,
        message: &SessionMessage,
        filter: F,
    ) -> usize
    where
        F: Fn(&ClientSession) -> bool,
    {
        let mut sent = 0;
        for session in self.slots.iter_mut().flatten() {
            if !session.is_connected() || !filter(session) {
                continue;
            }
            match send_message(session, endpoint, message.clone()) {
                Ok(()) => sent += 1,
                Err(e) => log::debug!("broadcast to {} failed: {}", session.addr, e),
            }
        }
        sent
    }
}

fn send_message(
    session: &mut ClientSession,
    endpoint: &mut Endpoint,
    message: SessionMessage,
) -> Result<(), std::io::Error> {
    let header = session.channel.next_header();
    let packet = SessionPacket::new(header, message);
    let data = packet
        .encode()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let bytes = endpoint.send_to(&data, session.addr)?;
    session.channel.record_send(bytes);
    Ok(())
}
