//! # Room Server Library
//!
//! Authoritative side of the multiplayer room: accepts encrypted client
//! connections, owns the roster and relays race state between racers. It also
//! carries the small update server that hands out signed content updates.
//!
//! ## Architecture
//!
//! ### Single-Threaded Tick Loop
//! [`network::RoomServer::calc`] is called once per tick by the host
//! application. Every socket is non-blocking, so one call steps every client
//! once, broadcasts what is due and returns. Timeouts are counted in ticks.
//!
//! ### Per-Client State Machine
//! Each accepted socket becomes a [`client::ClientSession`] that moves through
//! Connect (key exchange), Setup (waiting for a join) and Main (joined). Any
//! failure tears the session down; the roster never sees a half-joined player.
//!
//! ### Bounded Broadcast Queues
//! Comments and disconnects go through fixed-capacity ring buffers. At most
//! one comment and one settings change leave the server per tick.
//!
//! ### Race Relay
//! [`race::RaceRelay`] owns a UDP socket. Datagrams are encrypted with keys
//! exported from each player's room session, so the relay knows who sent
//! what without a second handshake.
//!
//! ## Module Organization
//! - `network`: the [`RoomServer`] tick loop
//! - `client`: per-connection state machine
//! - `roster`: slot bookkeeping
//! - `race`: race datagram relay
//! - `handler`: callbacks into the host application
//! - `update_server`: blocking update distribution
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{NoopHandler, RoomServer, RoomServerConfig};
//! use shared::Keypair;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = RoomServer::bind(RoomServerConfig::default(), Keypair::generate())?;
//!     let mut handler = NoopHandler;
//!     let mut ticker = tokio::time::interval(Duration::from_millis(16));
//!
//!     loop {
//!         ticker.tick().await;
//!         server.calc(&mut handler)?;
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod network;
pub mod race;
pub mod roster;
pub mod update_server;

pub use config::RoomServerConfig;
pub use error::ServerError;
pub use handler::{NoopHandler, RoomEventHandler};
pub use network::RoomServer;
pub use roster::{Player, Roster};
pub use update_server::{UpdateManifest, UpdateServer};
