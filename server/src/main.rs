use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use log::{error, info, warn};
use server::config::{DEFAULT_RACE_PORT, DEFAULT_ROOM_PORT, DEFAULT_TICK_RATE};
use server::{Player, RoomEventHandler, RoomServer, RoomServerConfig, UpdateManifest, UpdateServer};
use shared::sign::SIGNATURE_LEN;
use shared::{Keypair, PlayerId, Version};
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Room (TCP) port
    #[arg(short, long, default_value_t = DEFAULT_ROOM_PORT)]
    port: u16,

    /// Race (UDP) port
    #[arg(short, long, default_value_t = DEFAULT_RACE_PORT)]
    race_port: u16,

    /// Ticks per second
    #[arg(short, long, default_value_t = DEFAULT_TICK_RATE)]
    tick_rate: u32,

    /// Transport secret key as hex; a fresh one is generated when omitted
    #[arg(short = 'k', long)]
    key: Option<String>,

    /// Serve this file as a signed update
    #[arg(long, requires_all = ["update_signature", "update_version"])]
    update_payload: Option<PathBuf>,

    /// Hex Ed25519ph signature of the update payload
    #[arg(long)]
    update_signature: Option<String>,

    /// Version of the update payload, e.g. 1.4.0
    #[arg(long)]
    update_version: Option<String>,

    /// Update server port
    #[arg(long, default_value_t = server::config::DEFAULT_UPDATE_PORT)]
    update_port: u16,
}

/// Logs room activity for an unattended server
struct LogHandler;

impl RoomEventHandler for LogHandler {
    fn on_player_join(&mut self, player_id: PlayerId, player: &Player) {
        info!(
            "Player {} joined as '{}' from location {}",
            player_id, player.identity.name, player.location.location
        );
    }

    fn on_player_leave(&mut self, player_id: PlayerId) {
        info!("Player {} left", player_id);
    }

    fn on_receive_comment(&mut self, player_id: PlayerId, message_id: u32) {
        info!("Player {} says #{}", player_id, message_id);
    }

    fn on_settings_change(&mut self, settings: &[u32]) {
        info!("Settings now {:?}", settings);
    }
}

fn parse_version(text: &str) -> Result<Version, Box<dyn std::error::Error>> {
    let parts: Vec<u16> = text
        .split('.')
        .map(str::parse)
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [major, minor, patch] => Ok(Version::new(*major, *minor, *patch)),
        _ => Err(format!("version '{}' is not major.minor.patch", text).into()),
    }
}

fn load_manifest(args: &Args) -> Result<Option<UpdateManifest>, Box<dyn std::error::Error>> {
    let (Some(path), Some(signature), Some(version)) = (
        &args.update_payload,
        &args.update_signature,
        &args.update_version,
    ) else {
        return Ok(None);
    };

    let payload = fs::read(path)?;
    let mut signature_bytes = [0u8; SIGNATURE_LEN];
    hex::decode_to_slice(signature.trim(), &mut signature_bytes)?;
    Ok(Some(UpdateManifest::new(
        parse_version(version)?,
        payload,
        signature_bytes,
    )))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let identity = match &args.key {
        Some(hex_key) => Keypair::from_secret_hex(hex_key)?,
        None => {
            warn!("No key given, generated a temporary one");
            Keypair::generate()
        }
    };
    info!("Server public key: {}", identity.public_key().to_hex());

    let host: std::net::IpAddr = args.host.parse()?;
    let config = RoomServerConfig {
        room_addr: SocketAddr::new(host, args.port),
        race_addr: SocketAddr::new(host, args.race_port),
        ..RoomServerConfig::default()
    }
    .with_tick_rate(args.tick_rate);

    let update_server = match load_manifest(&args)? {
        Some(manifest) => {
            info!("Offering update {}", manifest.version);
            Some(UpdateServer::spawn(
                SocketAddr::new(host, args.update_port),
                identity.clone(),
                manifest,
            )?)
        }
        None => None,
    };

    let mut room = RoomServer::bind(config, identity)?;
    let mut handler = LogHandler;

    let mut ticker = interval(Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Running at {} ticks per second", args.tick_rate);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = room.calc(&mut handler) {
                    error!("Tick failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    if let Some(update_server) = update_server {
        update_server.shutdown();
    }
    Ok(())
}
