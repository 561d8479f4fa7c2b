pub mod error;
pub mod net;
pub mod relay;
pub mod session;
pub mod snapshot;

pub use error::CoreError;
pub use net::{
    ChallengeManager, Endpoint, NetChannel, PacketScheduler, RateLimiter, DEFAULT_PORT,
    DEFAULT_TICK_RATE, MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
pub use session::{SessionConfig, SessionTable};
pub use snapshot::{BaselineTable, DeltaCache, TickHistory, TickSnapshot};
