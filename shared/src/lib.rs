//! Shared transport layer for room, race and update connections
//!
//! Everything both ends of a connection need lives here:
//! - [`session`]: authenticated key exchange and encrypted record stream
//! - [`framing`]: typed, length-prefixed messages over a session or raw socket
//! - [`datagram`]: encrypted race datagrams keyed from a room session
//! - [`protocol`]: the wire messages themselves
//! - [`frame`]: plausibility checks for race frames
//! - [`ring`]: fixed-capacity containers for room bookkeeping
//! - [`sign`]: streaming verification of signed update payloads

pub mod crypto;
pub mod datagram;
pub mod error;
pub mod frame;
pub mod framing;
pub mod protocol;
pub mod ring;
pub mod session;
pub mod sign;

pub use crypto::{decode_hex_key, Keypair, PublicKey, SessionContext};
pub use datagram::DatagramChannel;
pub use error::{ErrorKind, NetError, Result};
pub use frame::{validate_frame, FrameRejection};
pub use framing::{FramedChannel, PlainTransport, Transport};
pub use protocol::*;
pub use ring::{RingBuffer, SlotArena};
pub use session::{Role, SecureSession};

/// Players in one room
pub const ROOM_CAPACITY: usize = 12;
/// Comments waiting to be broadcast before the oldest is dropped
pub const COMMENT_QUEUE_CAPACITY: usize = 18;
/// Leaves waiting to be broadcast
pub const DISCONNECT_QUEUE_CAPACITY: usize = 12;
pub const ROOM_SETTINGS_COUNT: usize = 8;
pub const MAX_NAME_LEN: usize = 10;
/// Plaintext bytes carried by one encrypted record
pub const MAX_RECORD_PLAINTEXT: usize = 8 * 1024;
/// Payload bytes per update chunk
pub const UPDATE_CHUNK_SIZE: usize = 4 * 1024;
