//! Error taxonomy shared by every layer of the transport
//!
//! Three kinds of failure can surface from a socket-facing call:
//! - **Transport**: the underlying stream failed or closed
//! - **Cryptographic**: key exchange, record authentication or signature checks failed
//! - **Protocol**: a peer sent something outside the message schema or state machine
//!
//! "Would block" is deliberately absent: non-blocking reads report it as
//! `Ok(None)`. Race-frame plausibility failures are not errors either, see
//! [`crate::frame::FrameRejection`].

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetError>;

/// Coarse classification used by callers to decide how to react to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Cryptographic,
    Protocol,
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("key exchange failed: {0}")]
    Handshake(&'static str),

    #[error("record failed authentication")]
    Decrypt,

    #[error("nonce counter exhausted")]
    NonceExhausted,

    #[error("datagram counter {0} already seen")]
    Replayed(u64),

    #[error("signature verification failed")]
    BadSignature,

    #[error("invalid key material")]
    InvalidKey,

    #[error("session is not established yet")]
    NotEstablished,

    #[error("message of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("malformed message: {0}")]
    Decode(#[from] bincode::Error),

    #[error("unexpected message: {0}")]
    Unexpected(&'static str),
}

impl NetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::Io(_) | NetError::Closed => ErrorKind::Transport,
            NetError::Handshake(_)
            | NetError::Decrypt
            | NetError::NonceExhausted
            | NetError::Replayed(_)
            | NetError::BadSignature
            | NetError::InvalidKey => ErrorKind::Cryptographic,
            NetError::NotEstablished
            | NetError::TooLarge { .. }
            | NetError::Decode(_)
            | NetError::Unexpected(_) => ErrorKind::Protocol,
        }
    }

    /// Returns true when the error means the peer is simply gone
    pub fn is_disconnect(&self) -> bool {
        match self {
            NetError::Closed => true,
            NetError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(NetError::Closed.kind(), ErrorKind::Transport);
        assert_eq!(NetError::Decrypt.kind(), ErrorKind::Cryptographic);
        assert_eq!(NetError::BadSignature.kind(), ErrorKind::Cryptographic);
        assert_eq!(NetError::Unexpected("join").kind(), ErrorKind::Protocol);
        assert_eq!(
            NetError::TooLarge { size: 10, limit: 5 }.kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn test_disconnect_detection() {
        assert!(NetError::Closed.is_disconnect());
        assert!(NetError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_disconnect());
        assert!(!NetError::Decrypt.is_disconnect());
        assert!(!NetError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_disconnect());
    }

    #[test]
    fn test_error_message_formatting() {
        let err = NetError::TooLarge {
            size: 9000,
            limit: 8192,
        };
        assert_eq!(err.to_string(), "message of 9000 bytes exceeds limit of 8192");
    }
}
