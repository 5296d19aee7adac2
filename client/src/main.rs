use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use client::update::DEFAULT_UPDATE_PORT;
use client::{
    RaceAccessor, RaceClient, RaceHandler, RoomClient, RoomClientConfig, RoomHandler, RoomPlayer,
    UpdateConfig, UpdateWorker, WorkerResult,
};
use log::{error, info, warn};
use shared::{Identity, Keypair, PlayerFrame, PlayerId, PublicKey, RaceServerFrame, Vec3, Version};
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Room server address
    #[arg(short = 's', long, default_value = "127.0.0.1:21330")]
    server: SocketAddr,

    /// Room server public key as hex, as printed by racelink-server
    #[arg(short = 'k', long)]
    key: String,

    /// Display name shown to other players
    #[arg(short, long, default_value = "Racer")]
    name: String,

    /// Ticks per second
    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    /// Stop after this many ticks; 0 runs until Ctrl+C
    #[arg(long, default_value_t = 0)]
    ticks: u64,

    /// Check the update server at startup and install a newer version
    #[arg(long)]
    update: bool,

    /// Update server address
    #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_UPDATE_PORT)))]
    update_server: SocketAddr,

    /// Where a verified update is installed
    #[arg(long, default_value = "contents.arc")]
    install_path: PathBuf,
}

/// Logs what happens in the room
struct LogHandler;

impl RoomHandler for LogHandler {
    fn on_player_join(&mut self, player_id: PlayerId, player: &RoomPlayer) {
        info!("Player {} '{}' is in the room", player_id, player.identity.name);
    }

    fn on_player_leave(&mut self, player_id: PlayerId) {
        info!("Player {} left the room", player_id);
    }

    fn on_receive_comment(&mut self, player_id: PlayerId, message_id: u32) {
        info!("Player {} says #{}", player_id, message_id);
    }

    fn on_settings_change(&mut self, settings: &[u32]) {
        info!("Room settings: {:?}", settings);
    }
}

impl RaceHandler for LogHandler {
    fn on_race_frame_accepted(&mut self, frame: &RaceServerFrame) {
        if frame.time % 300 == 0 {
            info!("Server frame {} with {} karts", frame.time, frame.players.len());
        }
    }
}

/// Stand-in for the game: one local kart driving in a straight line
struct DemoKarts {
    time: u32,
    local: PlayerId,
    karts: Vec<PlayerFrame>,
}

impl DemoKarts {
    fn new() -> Self {
        Self {
            time: 0,
            local: 0,
            karts: Vec::new(),
        }
    }

    fn step(&mut self, local: PlayerId, player_count: usize) {
        self.time += 1;
        self.local = local;
        self.karts.resize(player_count.max(local as usize + 1), PlayerFrame::default());
        if let Some(kart) = self.karts.get_mut(local as usize) {
            kart.internal_speed = 80.0;
            kart.pos = Vec3::new(kart.pos.x + 80.0 / 60.0, 0.0, 0.0);
        }
    }
}

impl RaceAccessor for DemoKarts {
    fn current_time(&self) -> u32 {
        self.time
    }

    fn local_player_count(&self) -> u8 {
        1
    }

    fn screen_player_ids(&self) -> Vec<PlayerId> {
        vec![self.local]
    }

    fn player_physical_state(&self, player_id: PlayerId) -> PlayerFrame {
        self.karts
            .get(player_id as usize)
            .copied()
            .unwrap_or_default()
    }

    fn apply_physical_state(&mut self, player_id: PlayerId, state: &PlayerFrame) {
        // the local kart is driven here, not by the server
        if player_id == self.local {
            return;
        }
        if let Some(kart) = self.karts.get_mut(player_id as usize) {
            *kart = *state;
        }
    }
}

fn start_update(args: &Args) -> Result<UpdateWorker, Box<dyn std::error::Error>> {
    let version = env!("CARGO_PKG_VERSION")
        .split('.')
        .map(str::parse)
        .collect::<Result<Vec<u16>, _>>()?;
    let version = match version.as_slice() {
        [major, minor, patch] => Version::new(*major, *minor, *patch),
        _ => Version::default(),
    };

    let mut config = UpdateConfig::new(args.update_server, version)?;
    config.install_path = args.install_path.clone();
    let worker = UpdateWorker::spawn(config)?;
    worker.request_check()?;
    Ok(worker)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let identity = Identity::new(&args.name, 0);
    if !identity.is_valid() {
        return Err(format!("name '{}' must be 1 to 10 characters", args.name).into());
    }

    let mut updates = if args.update {
        Some(start_update(&args)?)
    } else {
        None
    };

    let config = RoomClientConfig::new(args.server, PublicKey::from_hex(&args.key)?, identity);
    let mut room = RoomClient::connect(config, &Keypair::generate())?;
    let mut race: Option<RaceClient> = None;
    let mut karts = DemoKarts::new();
    let mut handler = LogHandler;

    let mut ticker = interval(Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut tick: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tick += 1;
                if let Err(e) = room.calc(&mut handler) {
                    error!("Room connection lost ({}): {}", e.code(), e);
                    break;
                }

                if race.is_none() && room.is_main() {
                    race = Some(RaceClient::from_room(&room)?);
                }
                // frames list present players in slot order
                let kart_index = room
                    .player_id()
                    .and_then(|me| room.players().position(|(id, _)| id == me));
                if let (Some(race), Some(kart_index)) = (&mut race, kart_index) {
                    karts.step(kart_index as PlayerId, room.player_count());
                    if let Err(e) = race.calc_write(&karts) {
                        warn!("Race send failed: {}", e);
                    }
                    if let Err(e) = race.calc_read(room.player_count(), &mut handler) {
                        warn!("Race receive failed: {}", e);
                    }
                    race.apply_frame(&mut karts);
                }

                if let Some(worker) = &mut updates {
                    match worker.poll() {
                        Some(WorkerResult::Checked { available: true }) => {
                            info!("Downloading update");
                            worker.request_update()?;
                        }
                        Some(WorkerResult::Checked { available: false }) => info!("No update available"),
                        Some(WorkerResult::Updated) => info!("Update installed, restart to apply"),
                        Some(WorkerResult::Failed { code, message }) => {
                            warn!("Update failed ({}): {}", code, message);
                        }
                        None => {}
                    }
                }

                if args.ticks != 0 && tick >= args.ticks {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    room.leave();
    if let Some(worker) = updates {
        worker.shutdown();
    }
    Ok(())
}
