//! Errors raised by the room server, race relay and update server

use std::io;
use std::net::SocketAddr;

use shared::{NetError, RejectReason};
use thiserror::Error;

use crate::client::SessionState;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error("no traffic within timeout while in {0:?}")]
    Timeout(SessionState),

    #[error("join rejected: {0:?}")]
    Rejected(RejectReason),

    #[error("client left the room")]
    Left,

    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

impl ServerError {
    /// True when the client went away on purpose or the link simply dropped
    pub fn is_graceful(&self) -> bool {
        match self {
            ServerError::Left => true,
            ServerError::Net(e) => e.is_disconnect(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graceful_classification() {
        assert!(ServerError::Left.is_graceful());
        assert!(ServerError::Net(NetError::Closed).is_graceful());
        assert!(!ServerError::Net(NetError::Decrypt).is_graceful());
        assert!(!ServerError::Timeout(SessionState::Setup).is_graceful());
        assert!(!ServerError::Protocol("comment before join").is_graceful());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ServerError::Rejected(RejectReason::RoomFull).to_string(),
            "join rejected: RoomFull"
        );
        assert_eq!(
            ServerError::Timeout(SessionState::Connect).to_string(),
            "no traffic within timeout while in Connect"
        );
    }
}
