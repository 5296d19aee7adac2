//! Player roster for a single room
//!
//! This module tracks who occupies each of the room's fixed slots:
//! - Slot assignment on join, always the lowest free index
//! - Identity, location and settings reported by each player
//! - Two-phase removal so a slot is only reused after its Leave went out
//!
//! A player that disconnects is first marked as leaving. From then on it no
//! longer counts as present, but its slot stays occupied until the server has
//! broadcast the Leave event and calls [`Roster::release`]. This keeps the
//! slot index unambiguous for every client still listening.

use log::{debug, info};
use shared::{ClientId, Identity, Location, PlayerId, RejectReason, SlotArena, ROOM_CAPACITY};

/// A player occupying a roster slot
#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub client: ClientId,
    pub identity: Identity,
    pub location: Location,
    pub settings: Vec<u32>,
    leaving: bool,
}

impl Player {
    pub fn new(client: ClientId, identity: Identity, location: Location, settings: Vec<u32>) -> Self {
        Self {
            client,
            identity,
            location,
            settings,
            leaving: false,
        }
    }

    /// True between disconnect detection and the Leave broadcast
    pub fn is_leaving(&self) -> bool {
        self.leaving
    }
}

/// Fixed-capacity set of players with stable slot indices
#[derive(Debug, Default)]
pub struct Roster {
    slots: SlotArena<Player, ROOM_CAPACITY>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a player in the lowest free slot
    ///
    /// Slots held by leaving players are not free yet, so a room with a
    /// pending Leave can still report itself as full.
    pub fn join(&mut self, player: Player) -> Result<PlayerId, RejectReason> {
        let name = player.identity.name.clone();
        let slot = self.slots.insert(player).ok_or(RejectReason::RoomFull)?;
        info!("Player '{}' took slot {}", name, slot);
        Ok(slot as PlayerId)
    }

    /// Marks a player as leaving. Returns false if the slot was empty or
    /// already leaving.
    pub fn mark_leaving(&mut self, player_id: PlayerId) -> bool {
        match self.slots.get_mut(player_id as usize) {
            Some(player) if !player.leaving => {
                player.leaving = true;
                debug!("Slot {} marked leaving", player_id);
                true
            }
            _ => false,
        }
    }

    /// Frees a slot once its Leave has been broadcast
    pub fn release(&mut self, player_id: PlayerId) -> Option<Player> {
        let player = self.slots.remove(player_id as usize)?;
        debug!("Slot {} released", player_id);
        Some(player)
    }

    /// Present player by slot; leaving players are not returned
    pub fn get(&self, player_id: PlayerId) -> Option<&Player> {
        self.slots
            .get(player_id as usize)
            .filter(|player| !player.leaving)
    }

    pub fn get_mut(&mut self, player_id: PlayerId) -> Option<&mut Player> {
        self.slots
            .get_mut(player_id as usize)
            .filter(|player| !player.leaving)
    }

    /// Number of present players, excluding those already leaving
    pub fn player_count(&self) -> usize {
        self.iter().count()
    }

    /// True when no slot can be handed out
    pub fn is_full(&self) -> bool {
        self.slots.is_full()
    }

    /// Present players in slot order
    pub fn iter(&self) -> impl Iterator<Item = (PlayerId, &Player)> + '_ {
        self.slots
            .iter()
            .filter(|(_, player)| !player.leaving)
            .map(|(slot, player)| (slot as PlayerId, player))
    }

    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.iter().map(|(id, _)| id).collect()
    }
}
