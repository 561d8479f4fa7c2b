mod config;
mod events;
mod server;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use config::ServerConfig;
use events::ServerEvent;
use server::SessionServer;

#[derive(Parser)]
#[command(name = "castnet-server")]
#[command(about = "Castnet session server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = castnet::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = castnet::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(long, default_value = "castnet server")]
    hostname: String,

    #[arg(long, default_value = "default")]
    map: String,

    #[arg(long, help = "Connect password required from clients")]
    password: Option<String>,

    #[arg(long, help = "Password for remote console commands")]
    rcon_password: Option<String>,

    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[arg(long, help = "Run an HLTV-style broadcast relay")]
    relay: bool,

    #[arg(long, help = "Record the broadcast to a demo file")]
    record: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let config = ServerConfig {
        hostname: args.hostname,
        map: args.map,
        tick_rate: args.tick_rate,
        max_clients: args.max_clients,
        password: args.password,
        rcon_password: args.rcon_password,
        timeout_secs: args.timeout,
        relay_enabled: args.relay || args.record.is_some(),
        demo_path: args.record,
        ..Default::default()
    };

    let mut server = SessionServer::new(&bind_addr, config.clone())?;
    log::info!("server started on {}", server.local_addr());

    if config.relay_enabled {
        server.enable_relay()?;
    }
    if let Some(path) = &config.demo_path {
        server.start_recording(path)?;
    }

    run_loop(&mut server);

    log::info!("server shutting down");
    Ok(())
}

fn run_loop(server: &mut SessionServer) {
    use std::sync::atomic::Ordering;
    let running = server.running();
    while running.load(Ordering::SeqCst) {
        server.tick_once();

        for event in server.drain_events() {
            match event {
                ServerEvent::ClientConnecting { addr } => {
                    log::info!("connection request from {}", addr);
                }
                ServerEvent::ClientConnected {
                    user_id,
                    slot,
                    addr,
                } => {
                    log::info!("user {} admitted from {} (slot {})", user_id, addr, slot);
                }
                ServerEvent::ClientActivated { user_id, slot } => {
                    log::info!("user {} active (slot {})", user_id, slot);
                }
                ServerEvent::ClientDisconnected { user_id, reason } => {
                    log::info!("user {} {}", user_id, reason.as_str());
                }
                ServerEvent::ConnectionDenied { addr, reason } => {
                    log::warn!("connection denied to {}: {}", addr, reason);
                }
                ServerEvent::UserInfoChanged { user_id, name } => {
                    log::info!("user {} is now \"{}\"", user_id, name);
                }
                ServerEvent::RconCommand { addr, command } => {
                    log::info!("rcon from {}: {}", addr, command);
                }
                ServerEvent::PauseRequested { user_id, pause } => {
                    log::info!(
                        "user {} requested {}",
                        user_id,
                        if pause { "pause" } else { "unpause" }
                    );
                }
                ServerEvent::Error { message } => {
                    log::error!("{}", message);
                }
            }
        }

        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    server.shutdown();
}
