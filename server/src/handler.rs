//! Callbacks from the room server into the hosting application

use shared::PlayerId;

use crate::roster::Player;

/// Notified by [`RoomServer::calc`](crate::network::RoomServer::calc).
/// Every method has an empty default so implementors pick what they need.
pub trait RoomEventHandler {
    /// Once per tick while at least one client is in Main
    fn on_main(&mut self) {}

    fn on_player_join(&mut self, _player_id: PlayerId, _player: &Player) {}

    fn on_player_leave(&mut self, _player_id: PlayerId) {}

    /// Called when the comment is broadcast, not when it is received
    fn on_receive_comment(&mut self, _player_id: PlayerId, _message_id: u32) {}

    fn on_settings_change(&mut self, _settings: &[u32]) {}
}

/// Handler that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl RoomEventHandler for NoopHandler {}
