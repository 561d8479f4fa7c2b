use std::path::PathBuf;

use castnet::net::DEFAULT_TICK_RATE;
use castnet::snapshot::DEFAULT_MAX_DELTA_TICKS;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub map: String,
    pub tick_rate: u32,
    pub max_clients: usize,
    pub password: Option<String>,
    pub rcon_password: Option<String>,
    pub timeout_secs: u64,
    /// Oldest delta reference served before falling back to a full update.
    pub max_delta_ticks: u32,
    pub challenge_lifetime_secs: u64,
    /// Snapshots go out every Nth tick.
    pub snapshot_send_rate: u32,
    pub history_size: usize,
    pub class_count: u8,
    pub rules: Vec<(String, String)>,
    pub relay_enabled: bool,
    pub demo_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "castnet server".into(),
            map: "default".into(),
            tick_rate: DEFAULT_TICK_RATE,
            max_clients: 32,
            password: None,
            rcon_password: None,
            timeout_secs: 30,
            max_delta_ticks: DEFAULT_MAX_DELTA_TICKS,
            challenge_lifetime_secs: 3600,
            snapshot_send_rate: 1,
            history_size: 256,
            class_count: 16,
            rules: Vec::new(),
            relay_enabled: false,
            demo_path: None,
        }
    }
}
