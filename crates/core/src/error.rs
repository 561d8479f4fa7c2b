use std::io;

use crate::net::WireError;
use crate::session::AdmissionError;

/// Top-level error for the session core. Module-local errors stay close to
/// where they arise; this covers the surfaces where a caller handles all of
/// them in one place.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("wire protocol error: {0}")]
    Protocol(#[from] WireError),

    #[error("admission rejected: {0}")]
    AdmissionRejected(#[from] AdmissionError),

    #[error("invalid or expired challenge from client")]
    ChallengeInvalid,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("channel fault: {0}")]
    ChannelFault(#[from] io::Error),
}
