mod challenge;
mod channel;
mod endpoint;
mod limiter;
mod protocol;
mod scheduler;

pub use challenge::{
    Challenge, ChallengeManager, ValidationResult, CHALLENGE_RING_CAPACITY,
    DEFAULT_CHALLENGE_LIFETIME,
};
pub use channel::{ChannelId, NetChannel, ReceiveTracker};
pub use endpoint::{Endpoint, EndpointStats};
pub use limiter::{RateLimiter, RateLimiterConfig};
pub use protocol::{
    is_connectionless, sequence_greater_than, ConnectRequest, ConnectionlessMessage,
    ConnectionlessPacket, PacketHeader, ServerInfo, SessionMessage, SessionPacket, WireError,
    CONNECTIONLESS_HEADER, DEFAULT_PORT, DEFAULT_TICK_RATE, MAX_PACKET_SIZE, PROTOCOL_MAGIC,
    PROTOCOL_VERSION, SESSION_HEADER,
};
pub use scheduler::{PacketScheduler, DEFAULT_SCHEDULER_CAPACITY};
