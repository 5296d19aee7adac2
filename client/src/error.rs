//! Errors surfaced to the game by the room, race and update clients
//!
//! Every variant maps to a stable numeric code so the UI can show something
//! short and searchable instead of a message string.

use std::io;

use shared::{ErrorKind, NetError, RejectReason};
use thiserror::Error;

use crate::network::ClientState;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("could not reach room server: {0}")]
    Connect(#[source] io::Error),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error("join rejected: {0:?}")]
    Rejected(RejectReason),

    #[error("no progress within timeout while in {0:?}")]
    Timeout(ClientState),

    #[error("operation needs {needed:?}, client is in {actual:?}")]
    WrongState {
        needed: ClientState,
        actual: ClientState,
    },

    #[error("only the host may change room settings")]
    NotHost,

    #[error("room connection already failed")]
    Closed,

    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

impl RoomError {
    pub fn code(&self) -> u32 {
        match self {
            RoomError::Connect(_) => 30000,
            RoomError::Net(e) => match e.kind() {
                ErrorKind::Transport => 30001,
                ErrorKind::Cryptographic => 30002,
                ErrorKind::Protocol => 30003,
            },
            RoomError::Rejected(RejectReason::RoomFull) => 30010,
            RoomError::Rejected(RejectReason::InvalidIdentity) => 30011,
            RoomError::Rejected(RejectReason::InvalidSettings) => 30012,
            RoomError::Timeout(_) => 30020,
            RoomError::WrongState { .. } => 30030,
            RoomError::NotHost => 30031,
            RoomError::Closed => 30040,
            RoomError::Protocol(_) => 30003,
        }
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("updates are only offered to release builds")]
    UnsupportedBuild,

    #[error("no update info cached, run a check first")]
    NotChecked,

    #[error("server metadata changed since the last check")]
    MetadataChanged,

    #[error("signature of {0} bytes, expected 64")]
    BadSignatureLength(usize),

    #[error("downloaded payload failed signature verification")]
    BadSignature,

    #[error("server sent an unexpected reply: {0}")]
    Protocol(&'static str),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error("staging or install failed: {0}")]
    Storage(#[source] io::Error),

    #[error("update worker is busy")]
    Busy,

    #[error("update worker has stopped")]
    WorkerGone,
}

impl UpdateError {
    pub fn code(&self) -> u32 {
        match self {
            UpdateError::UnsupportedBuild => 40000,
            UpdateError::Net(e) => match e.kind() {
                ErrorKind::Transport => 40001,
                ErrorKind::Cryptographic => 40002,
                ErrorKind::Protocol => 40003,
            },
            UpdateError::Protocol(_) => 40003,
            UpdateError::NotChecked => 40010,
            UpdateError::MetadataChanged => 40011,
            UpdateError::BadSignatureLength(_) => 40012,
            UpdateError::BadSignature => 40013,
            UpdateError::Storage(_) => 40020,
            UpdateError::Busy => 40030,
            UpdateError::WorkerGone => 40031,
        }
    }
}
