//! Update distribution server
//!
//! Unlike the room server this one is blocking and thread-per-connection:
//! update sessions are rare, short and bulk, so they stay off the tick loop.
//! A connection carries one [`UpdateRequest`]; the server answers with the
//! current manifest and, if asked, streams the payload in 4 KiB chunks.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use log::{debug, error, info, warn};
use shared::sign::{sign_payload, SIGNATURE_LEN};
use shared::{
    FramedChannel, Keypair, SecureSession, SessionContext, UpdateReply, UpdateRequest,
    UpdateResponse, Version, UPDATE_CHUNK_SIZE,
};

use crate::error::ServerError;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// The update currently on offer
#[derive(Debug, Clone)]
pub struct UpdateManifest {
    pub version: Version,
    pub payload: Arc<Vec<u8>>,
    pub signature: [u8; SIGNATURE_LEN],
}

impl UpdateManifest {
    pub fn new(version: Version, payload: Vec<u8>, signature: [u8; SIGNATURE_LEN]) -> Self {
        Self {
            version,
            payload: Arc::new(payload),
            signature,
        }
    }

    /// Signs `payload` on the spot; handy for tests and local setups
    pub fn signed(version: Version, payload: Vec<u8>, key: &SigningKey) -> Result<Self, ServerError> {
        let signature = sign_payload(key, &payload)?;
        Ok(Self::new(version, payload, signature))
    }

    fn response(&self) -> Result<UpdateResponse, ServerError> {
        let size = u32::try_from(self.payload.len())
            .map_err(|_| ServerError::Protocol("payload larger than 4 GiB"))?;
        Ok(UpdateResponse {
            version: self.version,
            size,
            signature: self.signature.to_vec(),
        })
    }
}

type SharedManifest = Arc<RwLock<Arc<UpdateManifest>>>;

pub struct UpdateServer {
    addr: SocketAddr,
    manifest: SharedManifest,
    shutdown: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl UpdateServer {
    /// Binds and starts accepting on a background thread
    pub fn spawn(
        addr: SocketAddr,
        identity: Keypair,
        manifest: UpdateManifest,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let addr = listener.local_addr()?;
        let manifest: SharedManifest = Arc::new(RwLock::new(Arc::new(manifest)));
        let shutdown = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let manifest = Arc::clone(&manifest);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("update-acceptor".to_string())
                .spawn(move || accept_loop(listener, identity, manifest, shutdown))?
        };

        info!("Update server listening on {}", addr);
        Ok(Self {
            addr,
            manifest,
            shutdown,
            acceptor: Some(acceptor),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Replaces the offered update; connections already streaming keep the old one
    pub fn set_manifest(&self, manifest: UpdateManifest) {
        info!("Now offering update {}", manifest.version);
        match self.manifest.write() {
            Ok(mut current) => *current = Arc::new(manifest),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(manifest),
        }
    }

    /// Stops accepting and waits for the acceptor thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // wake the blocking accept
        let _ = TcpStream::connect(self.addr);
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                error!("Update acceptor thread panicked");
            }
        }
    }
}

impl Drop for UpdateServer {
    fn drop(&mut self) {
        if self.acceptor.is_some() {
            self.stop();
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    identity: Keypair,
    manifest: SharedManifest,
    shutdown: Arc<AtomicBool>,
) {
    for stream in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Update accept failed: {}", e);
                continue;
            }
        };

        let identity = identity.clone();
        let current = match manifest.read() {
            Ok(current) => Arc::clone(&current),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        };
        let spawned = thread::Builder::new()
            .name("update-connection".to_string())
            .spawn(move || {
                let peer = stream.peer_addr().ok();
                match serve_connection(stream, &identity, &current) {
                    Ok(()) => debug!("Update session with {:?} finished", peer),
                    Err(e) => warn!("Update session with {:?} failed: {}", peer, e),
                }
            });
        if let Err(e) = spawned {
            error!("Could not spawn update connection thread: {}", e);
        }
    }
}

fn serve_connection(
    stream: TcpStream,
    identity: &Keypair,
    manifest: &UpdateManifest,
) -> Result<(), ServerError> {
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    let session = SecureSession::accept(stream, identity, SessionContext::Update)?;
    let mut channel: FramedChannel<_, UpdateRequest, UpdateReply> = FramedChannel::new(session);

    let request = channel.expect_message()?;
    info!(
        "Update request from {} {} ({:?}) at {}, wants payload: {}",
        request.game_name, request.platform, request.build_type, request.version, request.wants_update
    );

    channel.write_message(&UpdateReply::Info(manifest.response()?))?;
    if request.wants_update {
        for chunk in manifest.payload.chunks(UPDATE_CHUNK_SIZE) {
            channel.write_message(&UpdateReply::Chunk(chunk.to_vec()))?;
        }
    }

    if !channel.flush()? {
        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
    }
    Ok(())
}
