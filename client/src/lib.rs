//! # Game Client Library
//!
//! Client side of the multiplayer transport: joining a room, exchanging race
//! frames with the relay and fetching signed content updates. The game stays
//! in charge of simulation and UI; this crate only talks to it through the
//! traits in [`accessor`].
//!
//! ## Architecture Overview
//!
//! ### Room Connection
//! [`RoomClient`] keeps one encrypted TCP connection to the room server. It
//! is stepped once per frame by [`RoomClient::calc`] and never blocks, not
//! even while connecting. It mirrors the server roster and reports joins,
//! leaves, comments and settings changes to a [`RoomHandler`].
//!
//! ### Race Channel
//! [`RaceClient`] sends one encrypted UDP datagram per frame and drains the
//! relay's frames. Keys are exported from the room session, so there is no
//! second handshake. Frames that go back in time or carry implausible values
//! are dropped before the game ever sees them.
//!
//! ### Content Updates
//! [`UpdateChecker`] performs the blocking check and download.
//! [`UpdateWorker`] runs it on its own thread behind two bounded queues so
//! the frame loop only ever polls.
//!
//! ## Module Organization
//! - `accessor`: traits the game implements
//! - `network`: room connection state machine
//! - `race`: race datagram exchange and frame validation
//! - `update`: check, download, verify and install
//! - `update_worker`: background thread around `update`
//! - `error`: error types with stable user-facing codes
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{NoopHandler, RaceClient, RoomClient, RoomClientConfig};
//! use shared::{Identity, Keypair, PublicKey};
//! # struct Karts;
//! # impl client::RaceAccessor for Karts {
//! #     fn current_time(&self) -> u32 { 0 }
//! #     fn local_player_count(&self) -> u8 { 1 }
//! #     fn screen_player_ids(&self) -> Vec<u8> { vec![0] }
//! #     fn player_physical_state(&self, _: u8) -> shared::PlayerFrame { Default::default() }
//! #     fn apply_physical_state(&mut self, _: u8, _: &shared::PlayerFrame) {}
//! # }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server_key = PublicKey::from_hex("a349b03d7bd1282a99f3498d4233a2da1cf7703f8fa325377f1f9d9aae88d564")?;
//! let config = RoomClientConfig::new("127.0.0.1:21330".parse()?, server_key, Identity::new("Luigi", 0));
//! let mut room = RoomClient::connect(config, &Keypair::generate())?;
//! let mut race: Option<RaceClient> = None;
//! let mut game = Karts;
//!
//! loop {
//!     room.calc(&mut NoopHandler)?;
//!     if race.is_none() && room.is_main() {
//!         race = Some(RaceClient::from_room(&room)?);
//!     }
//!     if let Some(race) = &mut race {
//!         race.calc_write(&game)?;
//!         race.calc_read(room.player_count(), &mut NoopHandler)?;
//!         race.apply_frame(&mut game);
//!     }
//! }
//! # }
//! ```

pub mod accessor;
pub mod error;
pub mod network;
pub mod race;
pub mod update;
pub mod update_worker;

pub use accessor::{NoopHandler, RaceAccessor, RaceHandler, RoomHandler, RoomPlayer};
pub use error::{RoomError, UpdateError};
pub use network::{ClientState, RoomClient, RoomClientConfig};
pub use race::RaceClient;
pub use update::{UpdateChecker, UpdateConfig, UpdateInfo, UpdateStatus};
pub use update_worker::{UpdateWorker, WorkerRequest, WorkerResult};
