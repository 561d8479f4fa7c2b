use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnecting {
        addr: SocketAddr,
    },
    ClientConnected {
        user_id: u32,
        slot: usize,
        addr: SocketAddr,
    },
    ClientActivated {
        user_id: u32,
        slot: usize,
    },
    ClientDisconnected {
        user_id: u32,
        reason: DisconnectReason,
    },
    ConnectionDenied {
        addr: SocketAddr,
        reason: String,
    },
    UserInfoChanged {
        user_id: u32,
        name: String,
    },
    /// Authenticated remote console command; execution is up to the
    /// embedding application.
    RconCommand {
        addr: SocketAddr,
        command: String,
    },
    PauseRequested {
        user_id: u32,
        pause: bool,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
    ChannelFault,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::ChannelFault => "dropped on channel fault",
        }
    }
}
