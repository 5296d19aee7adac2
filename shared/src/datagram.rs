//! Encrypted datagrams for the race channel
//!
//! Keys come from [`SecureSession::export_keys`](crate::session::SecureSession::export_keys)
//! on the room session, so no second handshake is needed. Each datagram is
//! `counter: u64 BE | ciphertext`; the counter is both the nonce and the AAD.
//! Datagrams may be lost or reordered, so the receiver keeps only the highest
//! counter seen and drops anything at or below it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use zeroize::Zeroizing;

use crate::crypto::{CipherState, TAG_LEN};
use crate::error::{NetError, Result};
use crate::framing::{decode, encode};
use crate::session::{ExportedKeys, Role};

const COUNTER_LEN: usize = 8;

/// Largest datagram either side will send or accept
pub const MAX_DATAGRAM_SIZE: usize = 8 * 1024;

pub struct DatagramChannel {
    send: CipherState,
    recv: CipherState,
    next_send: u64,
    last_received: Option<u64>,
}

impl DatagramChannel {
    pub fn new(keys: &ExportedKeys, role: Role) -> Self {
        let (send, recv) = match role {
            Role::Initiator => (&keys.client_to_server, &keys.server_to_client),
            Role::Responder => (&keys.server_to_client, &keys.client_to_server),
        };
        Self {
            send: CipherState::new(send),
            recv: CipherState::new(recv),
            next_send: 0,
            last_received: None,
        }
    }

    pub fn seal<T: Serialize>(&mut self, message: &T) -> Result<Vec<u8>> {
        let counter = self.next_send;
        self.next_send = counter.checked_add(1).ok_or(NetError::NonceExhausted)?;

        let aad = counter.to_be_bytes();
        let mut body = encode(message)?;
        self.send.seal_at(counter, &aad, &mut body)?;

        let mut datagram = Vec::with_capacity(COUNTER_LEN + body.len());
        datagram.extend_from_slice(&aad);
        datagram.extend_from_slice(&body);
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(NetError::TooLarge {
                size: datagram.len(),
                limit: MAX_DATAGRAM_SIZE,
            });
        }
        Ok(datagram)
    }

    /// Authenticates and decodes a datagram. State only changes on success,
    /// so a receiver may try several channels against the same bytes.
    pub fn open<T: DeserializeOwned>(&mut self, datagram: &[u8]) -> Result<T> {
        if datagram.len() < COUNTER_LEN + TAG_LEN || datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(NetError::Unexpected("datagram size"));
        }

        let mut aad = [0u8; COUNTER_LEN];
        aad.copy_from_slice(&datagram[..COUNTER_LEN]);
        let counter = u64::from_be_bytes(aad);

        let mut body = Zeroizing::new(datagram[COUNTER_LEN..].to_vec());
        self.recv.open_at(counter, &aad, &mut body)?;

        if matches!(self.last_received, Some(last) if counter <= last) {
            return Err(NetError::Replayed(counter));
        }

        let message = decode(&body)?;
        self.last_received = Some(counter);
        Ok(message)
    }
}

impl std::fmt::Debug for DatagramChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramChannel")
            .field("next_send", &self.next_send)
            .field("last_received", &self.last_received)
            .finish_non_exhaustive()
    }
}
