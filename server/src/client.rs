//! Per-connection state machine on the room server
//!
//! ```text
//! Connect --handshake done--> Setup --join accepted--> Main
//!    \                           \                      \
//!     +------------- timeout / read error / Leave ------+--> teardown
//! ```
//!
//! A session only ever talks to its own socket. Everything that touches the
//! roster or other clients happens in [`RoomServer`](crate::network::RoomServer),
//! which receives the requests a session collected during its step.

use std::net::{SocketAddr, TcpStream};

use log::{debug, warn};
use shared::{FramedChannel, Keypair, PlayerId, RoomEvent, RoomRequest, SecureSession, SessionContext};

use crate::config::RoomServerConfig;
use crate::error::ServerError;

pub type RoomChannel = FramedChannel<SecureSession<TcpStream>, RoomRequest, RoomEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket accepted, key exchange still running
    Connect,
    /// Encrypted, waiting for the join request
    Setup,
    /// Joined; events flow both ways
    Main,
}

/// One accepted connection
#[derive(Debug)]
pub struct ClientSession {
    pub addr: SocketAddr,
    channel: RoomChannel,
    state: SessionState,
    player_id: Option<PlayerId>,
    idle_ticks: u32,
    failed: Option<ServerError>,
}

impl ClientSession {
    pub fn new(stream: TcpStream, addr: SocketAddr, identity: &Keypair) -> Self {
        let session = SecureSession::new_responder(stream, identity, SessionContext::Room);
        Self {
            addr,
            channel: FramedChannel::new(session),
            state: SessionState::Connect,
            player_id: None,
            idle_ticks: 0,
            failed: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn player_id(&self) -> Option<PlayerId> {
        self.player_id
    }

    pub fn is_main(&self) -> bool {
        self.state == SessionState::Main
    }

    pub fn channel(&self) -> &RoomChannel {
        &self.channel
    }

    /// Records a join accepted by the server
    pub fn enter_main(&mut self, player_id: PlayerId) {
        self.state = SessionState::Main;
        self.player_id = Some(player_id);
    }

    /// Queues an event. Failures are remembered and end the session on its
    /// next step, so broadcasting never has to handle them inline.
    pub fn send(&mut self, event: &RoomEvent) {
        if self.failed.is_some() {
            return;
        }
        if let Err(e) = self.channel.write_message(event) {
            debug!("Write to {} failed: {}", self.addr, e);
            self.failed = Some(e.into());
        }
    }

    /// Advances the state machine by one tick and returns the requests that
    /// arrived, in order. An error means the session must be torn down.
    pub fn step(&mut self, config: &RoomServerConfig) -> Result<Vec<RoomRequest>, ServerError> {
        if let Some(e) = self.failed.take() {
            return Err(e);
        }

        self.idle_ticks = self.idle_ticks.saturating_add(1);
        let mut requests = Vec::new();

        if self.state == SessionState::Connect {
            if self.channel.transport_mut().poll_handshake()? {
                debug!("Client {} finished key exchange", self.addr);
                self.state = SessionState::Setup;
                self.idle_ticks = 0;
            }
        }

        if self.state != SessionState::Connect {
            while let Some(request) = self.channel.read_message()? {
                self.idle_ticks = 0;
                requests.push(request);
            }
        }

        let limit = match self.state {
            SessionState::Connect | SessionState::Setup => config.handshake_timeout_ticks,
            SessionState::Main => config.idle_timeout_ticks,
        };
        if self.idle_ticks > limit {
            warn!("Client {} timed out in {:?}", self.addr, self.state);
            return Err(ServerError::Timeout(self.state));
        }

        self.channel.flush()?;
        Ok(requests)
    }

    /// Exports race datagram keys bound to this session
    pub fn race_keys(&self) -> Result<shared::session::ExportedKeys, ServerError> {
        Ok(self
            .channel
            .transport()
            .export_keys(SessionContext::Race)?)
    }

    /// Best-effort push of whatever is still queued, used right before close
    pub fn close(mut self) {
        if let Err(e) = self.channel.flush() {
            debug!("Final flush to {} failed: {}", self.addr, e);
        }
        if let Err(e) = self
            .channel
            .transport()
            .get_ref()
            .shutdown(std::net::Shutdown::Both)
        {
            debug!("Socket shutdown for {} failed: {}", self.addr, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    fn accepted(identity: &Keypair) -> (ClientSession, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, addr) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        (ClientSession::new(stream, addr, identity), peer)
    }

    #[test]
    fn test_silent_peer_times_out_in_connect() {
        let config = RoomServerConfig {
            handshake_timeout_ticks: 2,
            ..RoomServerConfig::default()
        };
        let (mut session, _peer) = accepted(&Keypair::generate());

        assert!(session.step(&config).unwrap().is_empty());
        assert!(session.step(&config).unwrap().is_empty());
        assert!(matches!(
            session.step(&config),
            Err(ServerError::Timeout(SessionState::Connect))
        ));
    }

    #[test]
    fn test_close_after_peer_gone() {
        let (mut session, peer) = accepted(&Keypair::generate());
        drop(peer);
        std::thread::sleep(Duration::from_millis(20));

        assert!(session.step(&RoomServerConfig::default()).is_err());
        session.close();
    }
}
