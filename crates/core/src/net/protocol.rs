use rkyv::{rancor, Archive, Deserialize, Serialize};

pub const MAX_PACKET_SIZE: usize = 1400;
pub const PROTOCOL_VERSION: u32 = 7;
pub const PROTOCOL_MAGIC: u32 = 0x4353_4E54;
pub const DEFAULT_PORT: u16 = 27025;
pub const DEFAULT_TICK_RATE: u32 = 60;

/// Leading u32 shared by every connectionless datagram. Anything else is
/// routed to the owning session's channel.
pub const CONNECTIONLESS_HEADER: u32 = 0xFFFF_FFFF;

/// Leading u32 on in-session datagrams, so classification never depends on
/// serialized payload bytes.
pub const SESSION_HEADER: u32 = 0x0000_0001;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("datagram too short")]
    Truncated,
    #[error("bad protocol magic")]
    BadMagic,
    #[error("payload exceeds MTU")]
    Oversize,
}

/// Payload of a `Connect` query. The challenge value must echo what the
/// server handed out for this address.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ConnectRequest {
    pub protocol: u32,
    pub challenge: i32,
    pub name: String,
    pub password: Option<String>,
    pub ticket: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ServerInfo {
    pub hostname: String,
    pub map: String,
    pub protocol: u32,
    pub players: u8,
    pub max_players: u8,
}

/// Out-of-band queries and replies exchanged before a session exists.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ConnectionlessMessage {
    GetChallenge,
    Challenge { value: i32 },
    Connect(ConnectRequest),
    ConnectAck { user_id: u32 },
    Reject { reason: String },
    Ping,
    Pong,
    Info,
    InfoReply(ServerInfo),
    Rules,
    RulesReply { rules: Vec<(String, String)> },
    Rcon { password: String, command: String },
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ConnectionlessPacket {
    pub magic: u32,
    pub version: u32,
    pub message: ConnectionlessMessage,
}

impl ConnectionlessPacket {
    pub fn new(message: ConnectionlessMessage) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let body = rkyv::to_bytes::<rancor::Error>(self).map_err(WireError::Serialize)?;
        let mut data = Vec::with_capacity(4 + body.len());
        data.extend_from_slice(&CONNECTIONLESS_HEADER.to_le_bytes());
        data.extend_from_slice(&body);
        if data.len() > MAX_PACKET_SIZE {
            return Err(WireError::Oversize);
        }
        Ok(data)
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if !is_connectionless(data) {
            return Err(WireError::BadMagic);
        }
        let packet: Self = from_unaligned(&data[4..])?;
        if packet.magic != PROTOCOL_MAGIC {
            return Err(WireError::BadMagic);
        }
        Ok(packet)
    }
}

/// True when the datagram carries the shared connectionless header value.
pub fn is_connectionless(data: &[u8]) -> bool {
    data.len() > 4 && data[..4] == CONNECTIONLESS_HEADER.to_le_bytes()
}

/// Datagram bodies arrive at arbitrary offsets; rkyv validation wants an
/// aligned buffer, so decode through a copy.
fn from_unaligned<T>(body: &[u8]) -> Result<T, WireError>
where
    T: rkyv::Archive,
    T::Archived: for<'a> rkyv::bytecheck::CheckBytes<rkyv::api::high::HighValidator<'a, rancor::Error>>
        + rkyv::Deserialize<T, rkyv::api::high::HighDeserializer<rancor::Error>>,
{
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(body);
    rkyv::from_bytes::<T, rancor::Error>(&aligned).map_err(WireError::Deserialize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub sequence: u32,
    pub ack: u32,
    pub ack_bits: u32,
}

impl PacketHeader {
    pub fn new(sequence: u32, ack: u32, ack_bits: u32) -> Self {
        Self {
            sequence,
            ack,
            ack_bits,
        }
    }
}

/// Messages carried on an established session channel.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum SessionMessage {
    /// Sign-on blob sent once while the client is connecting.
    SignonData { data: Vec<u8> },
    ServerInfo(ServerInfo),
    /// Delta-compressed entity snapshot. `delta_tick` is the reference tick,
    /// or -1 for a full update against the class baselines.
    Snapshot {
        tick: u32,
        delta_tick: i32,
        payload: Vec<u8>,
    },
    /// Client acknowledgment of the newest snapshot tick it holds.
    Ack { tick: u32 },
    /// Client-side settings update; applied at most once per change.
    UserInfo {
        name: String,
        settings: Vec<(String, String)>,
    },
    Pause,
    Unpause,
    Disconnect { reason: String },
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct SessionPacket {
    pub header: PacketHeader,
    pub message: SessionMessage,
}

impl SessionPacket {
    pub fn new(header: PacketHeader, message: SessionMessage) -> Self {
        Self { header, message }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let body = rkyv::to_bytes::<rancor::Error>(self).map_err(WireError::Serialize)?;
        let mut data = Vec::with_capacity(4 + body.len());
        data.extend_from_slice(&SESSION_HEADER.to_le_bytes());
        data.extend_from_slice(&body);
        if data.len() > MAX_PACKET_SIZE {
            return Err(WireError::Oversize);
        }
        Ok(data)
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < 8 {
            return Err(WireError::Truncated);
        }
        if data[..4] != SESSION_HEADER.to_le_bytes() {
            return Err(WireError::BadMagic);
        }
        from_unaligned(&data[4..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn test_connectionless_roundtrip() {
        let packet = ConnectionlessPacket::new(ConnectionlessMessage::Connect(ConnectRequest {
            protocol: PROTOCOL_VERSION,
            challenge: -432187,
            name: "player".into(),
            password: Some("hunter2".into()),
            ticket: None,
        }));

        let data = packet.encode().unwrap();
        assert!(is_connectionless(&data));

        let decoded = ConnectionlessPacket::decode(&data).unwrap();
        match decoded.message {
            ConnectionlessMessage::Connect(req) => {
                assert_eq!(req.challenge, -432187);
                assert_eq!(req.name, "player");
                assert_eq!(req.password.as_deref(), Some("hunter2"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_session_packet_not_connectionless() {
        let packet = SessionPacket::new(
            PacketHeader::new(1, 0, 0),
            SessionMessage::Ack { tick: 100 },
        );
        let data = packet.encode().unwrap();
        assert!(!is_connectionless(&data));

        let decoded = SessionPacket::decode(&data).unwrap();
        assert_eq!(decoded.header, packet.header);
    }

    #[test]
    fn test_decode_rejects_short_datagram() {
        assert!(matches!(
            SessionPacket::decode(&[1, 2, 3]),
            Err(WireError::Truncated)
        ));
        assert!(ConnectionlessPacket::decode(&[0xFF; 3]).is_err());
    }
}
