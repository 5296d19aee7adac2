//! Signed content updates
//!
//! ```text
//! check():  Idle -> Checking -> Idle            (metadata only)
//! update(): Idle -> Checking -> Downloading -> Moving -> Idle
//! ```
//!
//! Both calls block on the network and are meant for the worker thread in
//! [`crate::update_worker`]. `update` needs the info cached by a successful
//! `check`, refuses to continue if the server now advertises something
//! else, and streams the payload into a staging file while hashing it. The
//! staged file only replaces the installed one after the Ed25519ph
//! signature verifies against the compiled-in signing key. Any failure
//! drops the cached info, removes the staging file and returns to `Idle`.

use std::fs::{self, File};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use shared::sign::{verifying_key, StreamVerifier, SIGNATURE_LEN, SIGNING_KEY_LEN};
use shared::{
    decode_hex_key, BuildType, FramedChannel, Keypair, NetError, PublicKey, SecureSession,
    SessionContext, UpdateReply, UpdateRequest, UpdateResponse, Version, UPDATE_CHUNK_SIZE,
};

use crate::error::UpdateError;

/// Update server transport key (X25519)
pub const UPDATE_SERVER_KEY: &str =
    "a349b03d7bd1282a99f3498d4233a2da1cf7703f8fa325377f1f9d9aae88d564";

/// Key that signs update payloads (Ed25519)
pub const UPDATE_SIGNING_KEY: &str =
    "c29366a74c2c48a131353595fbea6945a3165f6bd1892f1625387293ae9cc7ee";

pub const DEFAULT_UPDATE_PORT: u16 = 21328;

type UpdateChannel = FramedChannel<SecureSession<TcpStream>, UpdateReply, UpdateRequest>;

#[derive(Debug, Clone)]
pub struct UpdateConfig {
    pub addr: SocketAddr,
    pub server_key: PublicKey,
    pub signing_key: [u8; SIGNING_KEY_LEN],
    pub version: Version,
    pub build_type: BuildType,
    pub game_name: String,
    pub platform: String,
    pub staging_path: PathBuf,
    pub install_path: PathBuf,
    /// Bound on connect and on every blocking read or write
    pub io_timeout: Duration,
}

impl UpdateConfig {
    /// Configuration using the compiled-in keys
    pub fn new(addr: SocketAddr, version: Version) -> Result<Self, UpdateError> {
        Ok(Self {
            addr,
            server_key: PublicKey::from_hex(UPDATE_SERVER_KEY)?,
            signing_key: decode_hex_key(UPDATE_SIGNING_KEY)?,
            version,
            build_type: BuildType::Release,
            game_name: env!("CARGO_PKG_NAME").to_string(),
            platform: std::env::consts::OS.to_string(),
            staging_path: std::env::temp_dir().join("contents.arc"),
            install_path: PathBuf::from("contents.arc"),
            io_timeout: Duration::from_secs(10),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateStatus {
    #[default]
    Idle,
    Checking,
    Downloading,
    Moving,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub version: Version,
    pub size: u32,
    pub signature: [u8; SIGNATURE_LEN],
    pub downloaded_size: u32,
    /// Bytes per second over the download so far
    pub throughput: u32,
    pub updated: bool,
}

impl UpdateInfo {
    fn from_response(response: UpdateResponse) -> Result<Self, UpdateError> {
        let signature: [u8; SIGNATURE_LEN] = response
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| UpdateError::BadSignatureLength(response.signature.len()))?;
        Ok(Self {
            version: response.version,
            size: response.size,
            signature,
            downloaded_size: 0,
            throughput: 0,
            updated: false,
        })
    }

    /// Same release as advertised at check time
    fn describes_same_release(&self, other: &UpdateInfo) -> bool {
        self.version == other.version && self.size == other.size && self.signature == other.signature
    }
}

/// Called on every status change and after every chunk
pub type ProgressObserver = Box<dyn FnMut(UpdateStatus, Option<&UpdateInfo>) + Send>;

pub struct UpdateChecker {
    config: UpdateConfig,
    status: UpdateStatus,
    info: Option<UpdateInfo>,
    observer: Option<ProgressObserver>,
}

impl UpdateChecker {
    pub fn new(config: UpdateConfig) -> Self {
        Self {
            config,
            status: UpdateStatus::Idle,
            info: None,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn status(&self) -> UpdateStatus {
        self.status
    }

    /// Cached info about the newer version, if one was found
    pub fn info(&self) -> Option<&UpdateInfo> {
        self.info.as_ref()
    }

    /// Asks the server what it offers. Returns whether a newer version is
    /// now cached.
    pub fn check(&mut self) -> Result<bool, UpdateError> {
        if self.info.is_some() {
            return Ok(true);
        }

        let result = self.fetch_info(false).map(|(info, _)| {
            if info.version > self.config.version {
                info!("Update {} available ({} bytes)", info.version, info.size);
                self.info = Some(info);
                true
            } else {
                debug!("Up to date at {}", self.config.version);
                false
            }
        });
        if let Err(e) = &result {
            warn!("Update check failed: {}", e);
        }
        self.set_status(UpdateStatus::Idle);
        result
    }

    /// Downloads, verifies and installs the update found by [`check`](Self::check)
    pub fn update(&mut self) -> Result<(), UpdateError> {
        let result = self.download_and_install();
        if let Err(e) = &result {
            warn!("Update failed: {}", e);
            self.info = None;
            if let Err(e) = fs::remove_file(&self.config.staging_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Could not remove staging file: {}", e);
                }
            }
        }
        self.set_status(UpdateStatus::Idle);
        result
    }

    fn download_and_install(&mut self) -> Result<(), UpdateError> {
        let Some(cached) = self.info.clone() else {
            return Err(UpdateError::NotChecked);
        };

        let (current, mut channel) = self.fetch_info(true)?;
        if !cached.describes_same_release(&current) {
            return Err(UpdateError::MetadataChanged);
        }

        self.set_status(UpdateStatus::Downloading);
        let key = verifying_key(&self.config.signing_key)?;
        let mut verifier = StreamVerifier::new();
        let mut staging = File::create(&self.config.staging_path).map_err(UpdateError::Storage)?;

        let started = Instant::now();
        let mut downloaded: u32 = 0;
        while downloaded < cached.size {
            let UpdateReply::Chunk(chunk) = channel.expect_message()? else {
                return Err(UpdateError::Protocol("metadata during payload"));
            };
            let len = u32::try_from(chunk.len()).map_err(|_| UpdateError::Protocol("chunk size"))?;
            if chunk.is_empty() || chunk.len() > UPDATE_CHUNK_SIZE || len > cached.size - downloaded {
                return Err(UpdateError::Protocol("chunk size"));
            }

            verifier.update(&chunk);
            staging.write_all(&chunk).map_err(UpdateError::Storage)?;
            downloaded += len;

            let elapsed = started.elapsed().as_secs_f64().max(1e-3);
            if let Some(info) = &mut self.info {
                info.downloaded_size = downloaded;
                info.throughput = (downloaded as f64 / elapsed) as u32;
            }
            self.notify();
        }
        staging.sync_all().map_err(UpdateError::Storage)?;
        drop(staging);

        verifier
            .verify(&key, &cached.signature)
            .map_err(|_| UpdateError::BadSignature)?;

        self.set_status(UpdateStatus::Moving);
        fs::rename(&self.config.staging_path, &self.config.install_path)
            .map_err(UpdateError::Storage)?;

        if let Some(info) = &mut self.info {
            info.updated = true;
            info!(
                "Installed update {} ({} bytes at {} B/s)",
                info.version, info.size, info.throughput
            );
        }
        Ok(())
    }

    /// Connects, sends the request and reads the metadata reply
    fn fetch_info(&mut self, wants_update: bool) -> Result<(UpdateInfo, UpdateChannel), UpdateError> {
        if self.config.build_type != BuildType::Release {
            return Err(UpdateError::UnsupportedBuild);
        }
        self.set_status(UpdateStatus::Checking);

        let mut channel = self.open_channel()?;
        channel.write_message(&UpdateRequest {
            wants_update,
            version: self.config.version,
            build_type: self.config.build_type,
            game_name: self.config.game_name.clone(),
            platform: self.config.platform.clone(),
        })?;
        if !channel.flush()? {
            return Err(NetError::from(io::Error::from(io::ErrorKind::TimedOut)).into());
        }

        match channel.expect_message()? {
            UpdateReply::Info(response) => Ok((UpdateInfo::from_response(response)?, channel)),
            UpdateReply::Chunk(_) => Err(UpdateError::Protocol("payload before metadata")),
        }
    }

    fn open_channel(&self) -> Result<UpdateChannel, UpdateError> {
        let timeout = self.config.io_timeout;
        let stream = TcpStream::connect_timeout(&self.config.addr, timeout).map_err(NetError::from)?;
        stream.set_read_timeout(Some(timeout)).map_err(NetError::from)?;
        stream.set_write_timeout(Some(timeout)).map_err(NetError::from)?;
        stream.set_nodelay(true).map_err(NetError::from)?;

        let mut session = SecureSession::new_initiator(
            stream,
            self.config.server_key,
            &Keypair::generate(),
            SessionContext::Update,
        );
        if !session.poll_handshake()? {
            return Err(NetError::from(io::Error::from(io::ErrorKind::TimedOut)).into());
        }
        Ok(FramedChannel::new(session))
    }

    fn set_status(&mut self, status: UpdateStatus) {
        if self.status != status {
            debug!("Update status {:?} -> {:?}", self.status, status);
            self.status = status;
            self.notify();
        }
    }

    fn notify(&mut self) {
        if let Some(observer) = &mut self.observer {
            observer(self.status, self.info.as_ref());
        }
    }
}

impl std::fmt::Debug for UpdateChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateChecker")
            .field("addr", &self.config.addr)
            .field("status", &self.status)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use shared::sign::sign_payload;
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[9u8; 32])
    }

    /// One-connection-per-reply server scripted by the test
    fn serve(
        replies: Vec<Vec<UpdateReply>>,
    ) -> (SocketAddr, PublicKey, JoinHandle<Vec<UpdateRequest>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let identity = Keypair::generate();
        let public = identity.public_key();

        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for script in replies {
                let (stream, _) = listener.accept().unwrap();
                let session = SecureSession::accept(stream, &identity, SessionContext::Update).unwrap();
                let mut channel: FramedChannel<_, UpdateRequest, UpdateReply> =
                    FramedChannel::new(session);
                requests.push(channel.expect_message().unwrap());
                for reply in &script {
                    channel.write_message(reply).unwrap();
                }
                channel.flush().unwrap();
            }
            requests
        });
        (addr, public, handle)
    }

    fn info_reply(version: Version, payload: &[u8]) -> UpdateReply {
        UpdateReply::Info(UpdateResponse {
            version,
            size: payload.len() as u32,
            signature: sign_payload(&signing_key(), payload).unwrap().to_vec(),
        })
    }

    fn payload_replies(version: Version, payload: &[u8]) -> Vec<UpdateReply> {
        let mut replies = vec![info_reply(version, payload)];
        replies.extend(
            payload
                .chunks(UPDATE_CHUNK_SIZE)
                .map(|chunk| UpdateReply::Chunk(chunk.to_vec())),
        );
        replies
    }

    fn checker(addr: SocketAddr, key: PublicKey, dir: &tempfile::TempDir) -> UpdateChecker {
        UpdateChecker::new(UpdateConfig {
            addr,
            server_key: key,
            signing_key: signing_key().verifying_key().to_bytes(),
            version: Version::new(1, 0, 0),
            build_type: BuildType::Release,
            game_name: "racer".to_string(),
            platform: "test".to_string(),
            staging_path: dir.path().join("staging.arc"),
            install_path: dir.path().join("contents.arc"),
            io_timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn test_check_then_update_installs_payload() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..9_000u32).map(|i| (i % 251) as u8).collect();
        let version = Version::new(1, 1, 0);
        let (addr, key, server) = serve(vec![
            vec![info_reply(version, &payload)],
            payload_replies(version, &payload),
        ]);

        let mut checker = checker(addr, key, &dir);
        assert!(checker.check().unwrap());
        assert_eq!(checker.status(), UpdateStatus::Idle);
        assert_eq!(checker.info().unwrap().size, 9_000);

        checker.update().unwrap();
        let info = checker.info().unwrap();
        assert!(info.updated);
        assert_eq!(info.downloaded_size, 9_000);
        assert_eq!(fs::read(dir.path().join("contents.arc")).unwrap(), payload);
        assert!(!dir.path().join("staging.arc").exists());

        let requests = server.join().unwrap();
        assert!(!requests[0].wants_update);
        assert!(requests[1].wants_update);
        assert_eq!(requests[1].version, Version::new(1, 0, 0));
    }

    #[test]
    fn test_check_ignores_older_versions() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, key, _server) = serve(vec![vec![info_reply(Version::new(1, 0, 0), b"same")]]);

        let mut checker = checker(addr, key, &dir);
        assert!(!checker.check().unwrap());
        assert!(checker.info().is_none());
    }

    #[test]
    fn test_check_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, key, server) = serve(vec![vec![info_reply(Version::new(2, 0, 0), b"x")]]);

        let mut checker = checker(addr, key, &dir);
        assert!(checker.check().unwrap());
        assert_eq!(server.join().unwrap().len(), 1);
        // nothing is listening for a second connection anymore
        assert!(checker.check().unwrap());
    }

    #[test]
    fn test_update_without_check_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut checker = checker("127.0.0.1:9".parse().unwrap(), Keypair::generate().public_key(), &dir);
        let err = checker.update().unwrap_err();
        assert!(matches!(err, UpdateError::NotChecked));
        assert_eq!(checker.status(), UpdateStatus::Idle);
    }

    #[test]
    fn test_debug_builds_do_not_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut checker = checker("127.0.0.1:9".parse().unwrap(), Keypair::generate().public_key(), &dir);
        checker.config.build_type = BuildType::Debug;
        assert!(matches!(checker.check(), Err(UpdateError::UnsupportedBuild)));
    }

    #[test]
    fn test_metadata_drift_aborts_before_staging() {
        let dir = tempfile::tempdir().unwrap();
        let first = vec![1u8; 100];
        let second = vec![2u8; 120];
        let (addr, key, _server) = serve(vec![
            vec![info_reply(Version::new(1, 2, 0), &first)],
            payload_replies(Version::new(1, 2, 0), &second),
        ]);

        let mut checker = checker(addr, key, &dir);
        assert!(checker.check().unwrap());
        assert!(matches!(checker.update(), Err(UpdateError::MetadataChanged)));
        assert!(checker.info().is_none());
        assert!(!dir.path().join("staging.arc").exists());
        assert!(!dir.path().join("contents.arc").exists());
    }

    #[test]
    fn test_corrupted_payload_keeps_installed_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("contents.arc"), b"old content").unwrap();

        let payload = vec![7u8; 5_000];
        let version = Version::new(1, 3, 0);
        let mut tampered = payload_replies(version, &payload);
        if let UpdateReply::Chunk(chunk) = &mut tampered[2] {
            chunk[10] ^= 0x01;
        }
        let (addr, key, _server) = serve(vec![vec![info_reply(version, &payload)], tampered]);

        let mut checker = checker(addr, key, &dir);
        assert!(checker.check().unwrap());
        let err = checker.update().unwrap_err();
        assert!(matches!(err, UpdateError::BadSignature));
        assert_eq!(err.code(), 40013);

        assert_eq!(checker.status(), UpdateStatus::Idle);
        assert!(checker.info().is_none());
        assert_eq!(fs::read(dir.path().join("contents.arc")).unwrap(), b"old content");
        assert!(!dir.path().join("staging.arc").exists());
    }

    #[test]
    fn test_short_signature_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, key, _server) = serve(vec![vec![UpdateReply::Info(UpdateResponse {
            version: Version::new(3, 0, 0),
            size: 1,
            signature: vec![0; 12],
        })]]);

        let mut checker = checker(addr, key, &dir);
        assert!(matches!(
            checker.check(),
            Err(UpdateError::BadSignatureLength(12))
        ));
        assert!(checker.info().is_none());
    }

    #[test]
    fn test_observer_sees_stages() {
        use std::sync::{Arc, Mutex};

        let dir = tempfile::tempdir().unwrap();
        let payload = vec![3u8; 6_000];
        let version = Version::new(1, 4, 0);
        let (addr, key, _server) = serve(vec![
            vec![info_reply(version, &payload)],
            payload_replies(version, &payload),
        ]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut checker = checker(addr, key, &dir).with_observer(Box::new(move |status: UpdateStatus, _: Option<&UpdateInfo>| {
            let mut seen = sink.lock().unwrap();
            if seen.last() != Some(&status) {
                seen.push(status);
            }
        }));
        checker.check().unwrap();
        checker.update().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                UpdateStatus::Checking,
                UpdateStatus::Idle,
                UpdateStatus::Checking,
                UpdateStatus::Downloading,
                UpdateStatus::Moving,
                UpdateStatus::Idle,
            ]
        );
    }
}
