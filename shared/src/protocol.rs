//! Wire messages for the room stream, race datagrams and update sessions
//!
//! All messages are serde types encoded with the codec in [`crate::framing`].
//! Variant order is part of the wire format; append new variants at the end.

use serde::{Deserialize, Serialize};

use crate::{MAX_NAME_LEN, ROOM_SETTINGS_COUNT};

pub type PlayerId = u8;

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// Who a player is at the account level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientId {
    LoggedIn { device: u32, licence: u32 },
    Guest { id: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub avatar: u32,
}

impl Identity {
    pub fn new(name: &str, avatar: u32) -> Self {
        Self {
            name: name.to_string(),
            avatar,
        }
    }

    /// Display names must be present and short enough for the roster UI
    pub fn is_valid(&self) -> bool {
        let chars = self.name.chars().count();
        chars > 0 && chars <= MAX_NAME_LEN
    }
}

/// Coarse geographic hint shown next to a player
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub location: u32,
    pub latitude: u16,
    pub longitude: u16,
}

pub fn settings_are_valid(settings: &[u32]) -> bool {
    settings.len() == ROOM_SETTINGS_COUNT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    RoomFull,
    InvalidIdentity,
    InvalidSettings,
}

/// Client to server, on the room stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoomRequest {
    Join {
        client: ClientId,
        identity: Identity,
        location: Location,
        settings: Vec<u32>,
    },
    Comment {
        message_id: u32,
    },
    /// Only honoured from the host
    Settings {
        settings: Vec<u32>,
    },
    Heartbeat,
    Leave,
}

/// Server to client, on the room stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoomEvent {
    Welcome {
        player_id: PlayerId,
        is_host: bool,
        race_port: u16,
    },
    Rejected {
        reason: RejectReason,
    },
    Join {
        player_id: PlayerId,
        client: ClientId,
        identity: Identity,
        location: Location,
        settings: Vec<u32>,
    },
    Leave {
        player_id: PlayerId,
    },
    Comment {
        player_id: PlayerId,
        message_id: u32,
    },
    Settings {
        settings: Vec<u32>,
    },
}

// ---------------------------------------------------------------------------
// Race
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Quat = Quat {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

pub const BOOST_TIMER_COUNT: usize = 6;
pub const WHEEL_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoostState {
    pub times_before_end: [u16; BOOST_TIMER_COUNT],
    pub types: u16,
    pub multiplier: f32,
    pub acceleration: f32,
    pub unk_1c: f32,
    pub speed_limit: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WheelPhysics {
    pub real_pos: Vec3,
    pub last_pos: Vec3,
    pub last_pos_diff: Vec3,
}

/// Physical state of one kart, as saved and restored by the simulation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerFrame {
    pub pos: Vec3,
    pub external_vel: Vec3,
    pub internal_vel: Vec3,
    pub in_bullet: bool,
    pub main_rot: Quat,
    pub internal_speed: f32,
    pub boost_state: BoostState,
    pub wheel_physics: [WheelPhysics; WHEEL_COUNT],
}

/// One tick of local input sent by a racing client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceInput {
    /// Local race time
    pub time: u32,
    /// Time of the last server frame this client accepted, 0 if none yet
    pub server_time: u32,
    pub players: Vec<PlayerFrame>,
}

/// Client to server race datagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RacePacket {
    Ping,
    Race(RaceInput),
}

/// Authoritative snapshot relayed to every racer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceServerFrame {
    pub time: u32,
    /// Cumulative race time per player, in slot order
    pub player_times: Vec<u32>,
    pub players: Vec<PlayerFrame>,
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildType {
    Debug,
    Test,
    #[default]
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// false asks only for metadata; true asks for the payload after it
    pub wants_update: bool,
    pub version: Version,
    pub build_type: BuildType,
    pub game_name: String,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub version: Version,
    pub size: u32,
    pub signature: Vec<u8>,
}

/// Server to client on an update session: one `Info`, then the payload as
/// `Chunk`s of at most [`UPDATE_CHUNK_SIZE`](crate::UPDATE_CHUNK_SIZE) bytes
/// when it was requested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateReply {
    Info(UpdateResponse),
    Chunk(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{decode, encode};

    #[test]
    fn test_identity_validation() {
        assert!(Identity::new("A", 0).is_valid());
        assert!(Identity::new("ÀÉÎÕÜàéîõü", 0).is_valid());
        assert!(!Identity::new("", 0).is_valid());
        assert!(!Identity::new("ElevenChars", 0).is_valid());
    }

    #[test]
    fn test_settings_validation() {
        assert!(settings_are_valid(&[0; ROOM_SETTINGS_COUNT]));
        assert!(!settings_are_valid(&[0; ROOM_SETTINGS_COUNT - 1]));
        assert!(!settings_are_valid(&[]));
    }

    #[test]
    fn test_version_ordering_and_display() {
        assert!(Version::new(1, 2, 0) > Version::new(1, 1, 9));
        assert!(Version::new(2, 0, 0) > Version::new(1, 99, 99));
        assert_eq!(Version::new(0, 4, 12).to_string(), "0.4.12");
    }

    #[test]
    fn test_player_frame_fits_in_one_datagram() {
        let input = RacePacket::Race(RaceInput {
            time: 1200,
            server_time: 1190,
            players: vec![PlayerFrame::default(); 4],
        });
        let bytes = encode(&input).unwrap();
        assert!(bytes.len() < 1200);
        assert_eq!(decode::<RacePacket>(&bytes).unwrap(), input);
    }
}
