//! Contracts between the network core and the game
//!
//! The core never reaches into kart physics. It reads the local players'
//! state through [`RaceAccessor`] when sending and writes accepted server
//! state back through the same trait. Room and race happenings are reported
//! through [`RoomHandler`] and [`RaceHandler`].
//!
//! Player ids used by the accessor are kart indices within the race, which
//! is also the order of entries in a [`RaceServerFrame`].

use shared::{ClientId, Identity, Location, PlayerFrame, PlayerId, RaceServerFrame};

pub trait RaceAccessor {
    /// Local race clock, in frames since the race started
    fn current_time(&self) -> u32;

    fn local_player_count(&self) -> u8;

    /// Karts driven on this machine, in screen order
    fn screen_player_ids(&self) -> Vec<PlayerId>;

    fn player_physical_state(&self, player_id: PlayerId) -> PlayerFrame;

    fn apply_physical_state(&mut self, player_id: PlayerId, state: &PlayerFrame);
}

/// Roster entry as seen by a client
#[derive(Debug, Clone, PartialEq)]
pub struct RoomPlayer {
    pub client: ClientId,
    pub identity: Identity,
    pub location: Location,
    pub settings: Vec<u32>,
}

pub trait RoomHandler {
    fn on_player_join(&mut self, _player_id: PlayerId, _player: &RoomPlayer) {}

    fn on_player_leave(&mut self, _player_id: PlayerId) {}

    fn on_receive_comment(&mut self, _player_id: PlayerId, _message_id: u32) {}

    fn on_settings_change(&mut self, _settings: &[u32]) {}
}

pub trait RaceHandler {
    fn on_race_frame_accepted(&mut self, _frame: &RaceServerFrame) {}
}

/// Handler that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl RoomHandler for NoopHandler {}

impl RaceHandler for NoopHandler {}
