//! Authenticated key exchange and encrypted record stream over a byte stream
//!
//! The handshake is two messages long:
//!
//! ```text
//! initiator -> responder: ephemeral_pk (32) | static_pk (32)
//! responder -> initiator: ephemeral_pk (32) | confirmation tag (16)
//! ```
//!
//! Both sides mix three Diffie-Hellman results (ee, es, se) into a key schedule
//! salted by a transcript hash over the protocol name, the session context and
//! all four public keys. The responder proves possession of its static secret
//! with an AEAD tag over the transcript; the initiator proves possession of its
//! own by being able to derive the traffic keys at all.
//!
//! After the handshake every record is `len: u16 BE | ciphertext`, with the
//! length header authenticated as associated data. The session works on
//! blocking and non-blocking streams alike: on a non-blocking stream any call
//! that cannot make progress returns `Ok(None)` / `Ok(false)` and keeps its
//! partial state for the next poll.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use log::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{
    hkdf_expand, hkdf_extract, CipherState, Keypair, PublicKey, SessionContext, Transcript,
    KEY_LEN, TAG_LEN,
};
use crate::error::{NetError, Result};
use crate::MAX_RECORD_PLAINTEXT;

const PROTOCOL_NAME: &[u8] = b"racelink_x25519_chachapoly_sha256";
const CLIENT_HELLO_LEN: usize = 2 * KEY_LEN;
const SERVER_HELLO_LEN: usize = KEY_LEN + TAG_LEN;
const RECORD_HEADER_LEN: usize = 2;
const READ_CHUNK: usize = 4096;

/// Outbound ciphertext allowed to queue up behind a slow peer
pub const MAX_PENDING_OUTPUT: usize = 1 << 20;

/// Which end of the key exchange this side played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Per-direction keys exported from an established session for a sub-channel
pub struct ExportedKeys {
    pub client_to_server: Zeroizing<[u8; KEY_LEN]>,
    pub server_to_client: Zeroizing<[u8; KEY_LEN]>,
}

struct Traffic {
    send: CipherState,
    recv: CipherState,
    exporter: Zeroizing<[u8; KEY_LEN]>,
}

enum Handshake {
    AwaitingServerHello {
        ephemeral: Keypair,
        identity: Keypair,
        server_static: PublicKey,
    },
    AwaitingClientHello {
        identity: Keypair,
    },
    Established(Traffic),
    Failed,
}

struct HandshakeKeys {
    client_to_server: Zeroizing<[u8; KEY_LEN]>,
    server_to_client: Zeroizing<[u8; KEY_LEN]>,
    exporter: Zeroizing<[u8; KEY_LEN]>,
    transcript: [u8; 32],
}

/// Public keys in transcript order
struct HandshakeKeysIn<'a> {
    server_static: &'a PublicKey,
    client_ephemeral: &'a PublicKey,
    client_static: &'a PublicKey,
    server_ephemeral: &'a PublicKey,
}

fn derive_keys(
    context: SessionContext,
    public: HandshakeKeysIn<'_>,
    shared: [&[u8; KEY_LEN]; 3],
) -> Result<HandshakeKeys> {
    let mut transcript = Transcript::new(PROTOCOL_NAME, context);
    transcript.mix(public.server_static.as_bytes());
    transcript.mix(public.client_ephemeral.as_bytes());
    transcript.mix(public.client_static.as_bytes());
    transcript.mix(public.server_ephemeral.as_bytes());
    let transcript = transcript.finish();

    let mut ikm = Zeroizing::new([0u8; 3 * KEY_LEN]);
    for (i, secret) in shared.iter().enumerate() {
        ikm[i * KEY_LEN..(i + 1) * KEY_LEN].copy_from_slice(&secret[..]);
    }
    let prk = hkdf_extract(&transcript, &ikm[..])?;

    Ok(HandshakeKeys {
        client_to_server: hkdf_expand(&prk, &[b"c2s"])?,
        server_to_client: hkdf_expand(&prk, &[b"s2c"])?,
        exporter: hkdf_expand(&prk, &[b"exporter"])?,
        transcript,
    })
}

fn key_at(message: &[u8], offset: usize) -> Result<PublicKey> {
    let bytes = message
        .get(offset..offset + KEY_LEN)
        .and_then(|slice| <[u8; KEY_LEN]>::try_from(slice).ok())
        .ok_or(NetError::Handshake("truncated hello"))?;
    Ok(PublicKey::from_bytes(bytes))
}

/// Encrypted, mutually authenticated channel over any byte stream
pub struct SecureSession<S> {
    stream: S,
    role: Role,
    context: SessionContext,
    handshake: Handshake,
    peer: Option<PublicKey>,
    rx_buf: Vec<u8>,
    tx_buf: Vec<u8>,
    plaintext: Zeroizing<Vec<u8>>,
    plaintext_pos: usize,
}

impl<S: Read + Write> SecureSession<S> {
    /// Starts a client-side handshake against a known server key.
    /// The first message is queued immediately and sent on the next poll.
    pub fn new_initiator(
        stream: S,
        server_static: PublicKey,
        identity: &Keypair,
        context: SessionContext,
    ) -> Self {
        let ephemeral = Keypair::generate();
        let mut tx_buf = Vec::with_capacity(CLIENT_HELLO_LEN);
        tx_buf.extend_from_slice(ephemeral.public_key().as_bytes());
        tx_buf.extend_from_slice(identity.public_key().as_bytes());

        Self {
            stream,
            role: Role::Initiator,
            context,
            handshake: Handshake::AwaitingServerHello {
                ephemeral,
                identity: identity.clone(),
                server_static,
            },
            peer: Some(server_static),
            rx_buf: Vec::new(),
            tx_buf,
            plaintext: Zeroizing::new(Vec::with_capacity(MAX_RECORD_PLAINTEXT)),
            plaintext_pos: 0,
        }
    }

    /// Waits for a client hello on an accepted stream
    pub fn new_responder(stream: S, identity: &Keypair, context: SessionContext) -> Self {
        Self {
            stream,
            role: Role::Responder,
            context,
            handshake: Handshake::AwaitingClientHello {
                identity: identity.clone(),
            },
            peer: None,
            rx_buf: Vec::new(),
            tx_buf: Vec::new(),
            plaintext: Zeroizing::new(Vec::with_capacity(MAX_RECORD_PLAINTEXT)),
            plaintext_pos: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn context(&self) -> SessionContext {
        self.context
    }

    pub fn is_established(&self) -> bool {
        matches!(self.handshake, Handshake::Established(_))
    }

    /// Static key of the other side; known up front for initiators,
    /// learned from the hello for responders
    pub fn peer_public_key(&self) -> Option<PublicKey> {
        self.peer
    }

    pub fn pending_output(&self) -> usize {
        self.tx_buf.len()
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Drives the key exchange as far as the stream allows.
    /// Returns `Ok(true)` once traffic keys are in place.
    pub fn poll_handshake(&mut self) -> Result<bool> {
        loop {
            let needed = match &self.handshake {
                Handshake::Established(_) => {
                    self.flush()?;
                    return Ok(true);
                }
                Handshake::Failed => return Err(NetError::Closed),
                Handshake::AwaitingServerHello { .. } => {
                    self.flush()?;
                    SERVER_HELLO_LEN
                }
                Handshake::AwaitingClientHello { .. } => CLIENT_HELLO_LEN,
            };

            if self.rx_buf.len() < needed {
                if !self.fill_rx()? {
                    return Ok(false);
                }
                continue;
            }

            let message: Vec<u8> = self.rx_buf.drain(..needed).collect();
            let result = match std::mem::replace(&mut self.handshake, Handshake::Failed) {
                Handshake::AwaitingServerHello {
                    ephemeral,
                    identity,
                    server_static,
                } => self.finish_initiator(&ephemeral, &identity, &server_static, &message),
                Handshake::AwaitingClientHello { identity } => {
                    self.finish_responder(&identity, &message)
                }
                Handshake::Established(_) | Handshake::Failed => {
                    Err(NetError::Unexpected("handshake already finished"))
                }
            };

            match result {
                Ok(traffic) => {
                    self.handshake = Handshake::Established(traffic);
                    debug!(
                        "{:?} session established as {:?}",
                        self.context, self.role
                    );
                }
                Err(e) => {
                    warn!("{:?} handshake failed: {}", self.context, e);
                    return Err(e);
                }
            }
        }
    }

    fn finish_initiator(
        &mut self,
        ephemeral: &Keypair,
        identity: &Keypair,
        server_static: &PublicKey,
        message: &[u8],
    ) -> Result<Traffic> {
        let server_ephemeral = key_at(message, 0)?;
        let ee = ephemeral.diffie_hellman(&server_ephemeral)?;
        let es = ephemeral.diffie_hellman(server_static)?;
        let se = identity.diffie_hellman(&server_ephemeral)?;

        let keys = derive_keys(
            self.context,
            HandshakeKeysIn {
                server_static,
                client_ephemeral: &ephemeral.public_key(),
                client_static: &identity.public_key(),
                server_ephemeral: &server_ephemeral,
            },
            [&ee, &es, &se],
        )?;

        let mut recv = CipherState::new(&keys.server_to_client);
        let mut tag = message[KEY_LEN..].to_vec();
        recv.open(&keys.transcript, &mut tag)
            .map_err(|_| NetError::Handshake("server failed key confirmation"))?;

        Ok(Traffic {
            send: CipherState::new(&keys.client_to_server),
            recv,
            exporter: keys.exporter,
        })
    }

    fn finish_responder(&mut self, identity: &Keypair, message: &[u8]) -> Result<Traffic> {
        let client_ephemeral = key_at(message, 0)?;
        let client_static = key_at(message, KEY_LEN)?;
        let ephemeral = Keypair::generate();

        let ee = ephemeral.diffie_hellman(&client_ephemeral)?;
        let es = identity.diffie_hellman(&client_ephemeral)?;
        let se = ephemeral.diffie_hellman(&client_static)?;

        let keys = derive_keys(
            self.context,
            HandshakeKeysIn {
                server_static: &identity.public_key(),
                client_ephemeral: &client_ephemeral,
                client_static: &client_static,
                server_ephemeral: &ephemeral.public_key(),
            },
            [&ee, &es, &se],
        )?;

        let mut send = CipherState::new(&keys.server_to_client);
        let mut tag = Vec::with_capacity(TAG_LEN);
        send.seal(&keys.transcript, &mut tag)?;

        self.tx_buf.extend_from_slice(ephemeral.public_key().as_bytes());
        self.tx_buf.extend_from_slice(&tag);
        self.peer = Some(client_static);

        Ok(Traffic {
            send,
            recv: CipherState::new(&keys.client_to_server),
            exporter: keys.exporter,
        })
    }

    /// Reads decrypted bytes. `Ok(None)` means nothing is available yet.
    /// Authentication failures poison the session.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        if !self.poll_handshake()? {
            return Ok(None);
        }

        loop {
            if self.plaintext_pos < self.plaintext.len() {
                let available = &self.plaintext[self.plaintext_pos..];
                let n = buf.len().min(available.len());
                buf[..n].copy_from_slice(&available[..n]);
                self.plaintext_pos += n;
                if self.plaintext_pos == self.plaintext.len() {
                    self.plaintext.zeroize();
                    self.plaintext_pos = 0;
                }
                return Ok(Some(n));
            }

            if self.open_record()? {
                continue;
            }

            if !self.fill_rx()? {
                return Ok(None);
            }
        }
    }

    /// Encrypts `data` into as many records as needed and tries to send them
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let Handshake::Established(traffic) = &mut self.handshake else {
            return Err(NetError::NotEstablished);
        };

        for chunk in data.chunks(MAX_RECORD_PLAINTEXT) {
            let len = chunk.len() + TAG_LEN;
            let header = (len as u16).to_be_bytes();
            let mut record = Vec::with_capacity(len);
            record.extend_from_slice(chunk);
            traffic.send.seal(&header, &mut record)?;

            self.tx_buf.extend_from_slice(&header);
            self.tx_buf.extend_from_slice(&record);
        }

        if self.tx_buf.len() > MAX_PENDING_OUTPUT {
            return Err(NetError::TooLarge {
                size: self.tx_buf.len(),
                limit: MAX_PENDING_OUTPUT,
            });
        }

        self.flush()?;
        Ok(())
    }

    /// Pushes queued ciphertext to the stream. Returns true once nothing is left.
    pub fn flush(&mut self) -> Result<bool> {
        while !self.tx_buf.is_empty() {
            match self.stream.write(&self.tx_buf) {
                Ok(0) => return Err(NetError::Closed),
                Ok(n) => {
                    self.tx_buf.drain(..n);
                }
                Err(e) if is_would_block(&e) => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.stream.flush()?;
        Ok(true)
    }

    /// Derives a fresh key pair for a sub-channel bound to this session
    pub fn export_keys(&self, context: SessionContext) -> Result<ExportedKeys> {
        let Handshake::Established(traffic) = &self.handshake else {
            return Err(NetError::NotEstablished);
        };

        Ok(ExportedKeys {
            client_to_server: hkdf_expand(&traffic.exporter, &[context.label(), b"c2s"])?,
            server_to_client: hkdf_expand(&traffic.exporter, &[context.label(), b"s2c"])?,
        })
    }

    /// Decrypts one complete record from `rx_buf` into the plaintext buffer
    fn open_record(&mut self) -> Result<bool> {
        if self.rx_buf.len() < RECORD_HEADER_LEN {
            return Ok(false);
        }

        let header = [self.rx_buf[0], self.rx_buf[1]];
        let len = u16::from_be_bytes(header) as usize;
        if !(TAG_LEN..=MAX_RECORD_PLAINTEXT + TAG_LEN).contains(&len) {
            self.handshake = Handshake::Failed;
            return Err(NetError::TooLarge {
                size: len,
                limit: MAX_RECORD_PLAINTEXT + TAG_LEN,
            });
        }
        if self.rx_buf.len() < RECORD_HEADER_LEN + len {
            return Ok(false);
        }

        let mut record: Vec<u8> = self
            .rx_buf
            .drain(..RECORD_HEADER_LEN + len)
            .skip(RECORD_HEADER_LEN)
            .collect();

        let Handshake::Established(traffic) = &mut self.handshake else {
            return Err(NetError::NotEstablished);
        };
        if let Err(e) = traffic.recv.open(&header, &mut record) {
            self.handshake = Handshake::Failed;
            return Err(e);
        }

        self.plaintext.extend_from_slice(&record);
        record.zeroize();
        Ok(true)
    }

    /// Appends whatever the stream has to `rx_buf`. Returns false on would-block.
    fn fill_rx(&mut self) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(NetError::Closed),
                Ok(n) => {
                    self.rx_buf.extend_from_slice(&chunk[..n]);
                    return Ok(true);
                }
                Err(e) if is_would_block(&e) => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl SecureSession<TcpStream> {
    /// Blocking connect plus handshake. A read timeout set by the caller
    /// surfaces as `TimedOut`.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        server_static: PublicKey,
        identity: &Keypair,
        context: SessionContext,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let mut session = Self::new_initiator(stream, server_static, identity, context);
        if !session.poll_handshake()? {
            return Err(io::Error::from(io::ErrorKind::TimedOut).into());
        }
        Ok(session)
    }

    /// Blocking handshake on an accepted stream
    pub fn accept(stream: TcpStream, identity: &Keypair, context: SessionContext) -> Result<Self> {
        stream.set_nodelay(true)?;
        let mut session = Self::new_responder(stream, identity, context);
        if !session.poll_handshake()? {
            return Err(io::Error::from(io::ErrorKind::TimedOut).into());
        }
        Ok(session)
    }
}

impl<S> std::fmt::Debug for SecureSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("role", &self.role)
            .field("context", &self.context)
            .field("established", &matches!(self.handshake, Handshake::Established(_)))
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// NotConnected shows up while a non-blocking connect is still in flight
pub(crate) fn is_would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// In-memory non-blocking stream; one half of a pipe pair
    pub struct MemoryStream {
        inbound: Rc<RefCell<VecDeque<u8>>>,
        outbound: Rc<RefCell<VecDeque<u8>>>,
    }

    pub fn pipe() -> (MemoryStream, MemoryStream) {
        let a = Rc::new(RefCell::new(VecDeque::new()));
        let b = Rc::new(RefCell::new(VecDeque::new()));
        (
            MemoryStream {
                inbound: Rc::clone(&a),
                outbound: Rc::clone(&b),
            },
            MemoryStream {
                inbound: b,
                outbound: a,
            },
        )
    }

    impl MemoryStream {
        /// Flips a byte in whatever the peer will read next
        pub fn corrupt_outbound(&self, index: usize) {
            if let Some(byte) = self.outbound.borrow_mut().get_mut(index) {
                *byte ^= 0x01;
            }
        }
    }

    impl Read for MemoryStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inbound = self.inbound.borrow_mut();
            if inbound.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(inbound.len());
            for (slot, byte) in buf.iter_mut().zip(inbound.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for MemoryStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.borrow_mut().extend(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub fn established_pair(
        context: SessionContext,
    ) -> (SecureSession<MemoryStream>, SecureSession<MemoryStream>) {
        let server_key = Keypair::generate();
        let client_key = Keypair::generate();
        let (a, b) = pipe();

        let mut client = SecureSession::new_initiator(a, server_key.public_key(), &client_key, context);
        let mut server = SecureSession::new_responder(b, &server_key, context);

        assert!(!client.poll_handshake().unwrap());
        assert!(server.poll_handshake().unwrap());
        assert!(client.poll_handshake().unwrap());
        (client, server)
    }

    #[test]
    fn test_handshake_and_records() {
        let (mut client, mut server) = established_pair(SessionContext::Room);
        assert!(client.is_established() && server.is_established());

        client.write(b"hello room").unwrap();
        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello room");

        server.write(b"welcome").unwrap();
        let n = client.read(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"welcome");

        assert_eq!(server.read(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_server_learns_client_static_key() {
        let server_key = Keypair::generate();
        let client_key = Keypair::generate();
        let (a, b) = pipe();

        let mut client =
            SecureSession::new_initiator(a, server_key.public_key(), &client_key, SessionContext::Room);
        let mut server = SecureSession::new_responder(b, &server_key, SessionContext::Room);
        client.poll_handshake().unwrap();
        server.poll_handshake().unwrap();

        assert_eq!(server.peer_public_key(), Some(client_key.public_key()));
        assert_eq!(client.peer_public_key(), Some(server_key.public_key()));
    }

    #[test]
    fn test_large_write_spans_records() {
        let (mut client, mut server) = established_pair(SessionContext::Update);
        let payload: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        client.write(&payload).unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 3000];
        while let Some(n) = server.read(&mut buf).unwrap() {
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, payload);
    }

    #[test]
    fn test_plaintext_buffer_never_reallocates() {
        let (mut client, mut server) = established_pair(SessionContext::Update);
        let capacity = server.plaintext.capacity();
        assert!(capacity >= MAX_RECORD_PLAINTEXT);

        client.write(&vec![0xA5; 3 * MAX_RECORD_PLAINTEXT]).unwrap();
        let mut buf = [0u8; 1000];
        let mut total = 0;
        while let Some(n) = server.read(&mut buf).unwrap() {
            total += n;
            assert_eq!(server.plaintext.capacity(), capacity);
        }
        assert_eq!(total, 3 * MAX_RECORD_PLAINTEXT);
    }

    #[test]
    fn test_context_mismatch_fails_handshake() {
        let server_key = Keypair::generate();
        let client_key = Keypair::generate();
        let (a, b) = pipe();

        let mut client =
            SecureSession::new_initiator(a, server_key.public_key(), &client_key, SessionContext::Race);
        let mut server = SecureSession::new_responder(b, &server_key, SessionContext::Room);
        client.poll_handshake().unwrap();
        server.poll_handshake().unwrap();

        assert!(matches!(
            client.poll_handshake(),
            Err(NetError::Handshake(_))
        ));
    }

    #[test]
    fn test_wrong_server_key_fails_handshake() {
        let server_key = Keypair::generate();
        let impostor = Keypair::generate();
        let client_key = Keypair::generate();
        let (a, b) = pipe();

        let mut client =
            SecureSession::new_initiator(a, server_key.public_key(), &client_key, SessionContext::Room);
        let mut server = SecureSession::new_responder(b, &impostor, SessionContext::Room);
        client.poll_handshake().unwrap();
        server.poll_handshake().unwrap();

        assert!(client.poll_handshake().is_err());
        assert!(!client.is_established());
    }

    #[test]
    fn test_tampered_record_is_fatal() {
        let (mut client, mut server) = established_pair(SessionContext::Room);
        client.write(b"settings").unwrap();
        client.get_ref().corrupt_outbound(5);

        let mut buf = [0u8; 64];
        assert!(matches!(server.read(&mut buf), Err(NetError::Decrypt)));
        assert!(server.read(&mut buf).is_err());
    }

    #[test]
    fn test_write_before_handshake_rejected() {
        let server_key = Keypair::generate();
        let (a, _b) = pipe();
        let mut client = SecureSession::new_initiator(
            a,
            server_key.public_key(),
            &Keypair::generate(),
            SessionContext::Room,
        );
        assert!(matches!(client.write(b"x"), Err(NetError::NotEstablished)));
    }

    #[test]
    fn test_exported_keys_agree() {
        let (client, server) = established_pair(SessionContext::Room);
        let a = client.export_keys(SessionContext::Race).unwrap();
        let b = server.export_keys(SessionContext::Race).unwrap();
        assert_eq!(*a.client_to_server, *b.client_to_server);
        assert_eq!(*a.server_to_client, *b.server_to_client);
        assert_ne!(*a.client_to_server, *a.server_to_client);
    }

    #[test]
    fn test_blocking_tcp_session() {
        use std::net::TcpListener;
        use std::thread;

        let server_key = Keypair::generate();
        let server_public = server_key.public_key();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut session =
                SecureSession::accept(stream, &server_key, SessionContext::Update).unwrap();
            let mut buf = [0u8; 16];
            let n = session.read(&mut buf).unwrap().unwrap();
            session.write(&buf[..n]).unwrap();
        });

        let mut client = SecureSession::connect(
            addr,
            server_public,
            &Keypair::generate(),
            SessionContext::Update,
        )
        .unwrap();
        client.write(b"echo").unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], b"echo");
        handle.join().unwrap();
    }
}
