//! Client side of the room connection
//!
//! ```text
//! Connect --handshake done, Join sent--> Setup --Welcome--> Main
//!    \                                     \                  \
//!     +---------- timeout / error / Rejected -----------------+--> Failed
//! ```
//!
//! [`RoomClient::calc`] is called once per game tick and never blocks: the
//! TCP connect itself is started non-blocking and completes in the background
//! while the handshake bytes wait in the session's output buffer.

use std::io;
use std::net::{SocketAddr, TcpStream};

use log::{debug, info, warn};
use shared::session::ExportedKeys;
use shared::{
    ClientId, FramedChannel, Identity, Keypair, Location, PlayerId, PublicKey, RoomEvent,
    RoomRequest, SecureSession, SessionContext, SlotArena, ROOM_CAPACITY, ROOM_SETTINGS_COUNT,
};
use socket2::{Domain, Protocol, Socket, Type};

use crate::accessor::{RoomHandler, RoomPlayer};
use crate::error::RoomError;

pub type RoomChannel = FramedChannel<SecureSession<TcpStream>, RoomEvent, RoomRequest>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// TCP connect and key exchange in flight
    Connect,
    /// Join sent, waiting for Welcome
    Setup,
    Main,
    /// A fatal error was returned; the client must be recreated
    Failed,
}

#[derive(Debug, Clone)]
pub struct RoomClientConfig {
    pub server_addr: SocketAddr,
    pub server_key: PublicKey,
    pub client_id: ClientId,
    pub identity: Identity,
    pub location: Location,
    pub settings: Vec<u32>,
    /// Ticks between heartbeats while nothing else is sent
    pub heartbeat_interval_ticks: u32,
    /// Ticks allowed for Connect and Setup together
    pub connect_timeout_ticks: u32,
}

impl RoomClientConfig {
    pub fn new(server_addr: SocketAddr, server_key: PublicKey, identity: Identity) -> Self {
        Self {
            server_addr,
            server_key,
            client_id: ClientId::Guest {
                id: rand::random(),
            },
            identity,
            location: Location::default(),
            settings: vec![0; ROOM_SETTINGS_COUNT],
            heartbeat_interval_ticks: 300,
            connect_timeout_ticks: 600,
        }
    }
}

pub struct RoomClient {
    config: RoomClientConfig,
    channel: RoomChannel,
    state: ClientState,
    player_id: Option<PlayerId>,
    is_host: bool,
    race_port: u16,
    roster: SlotArena<RoomPlayer, ROOM_CAPACITY>,
    settings: Vec<u32>,
    ticks_in_state: u32,
    ticks_since_send: u32,
}

impl RoomClient {
    /// Starts connecting; returns immediately
    pub fn connect(config: RoomClientConfig, identity: &Keypair) -> Result<Self, RoomError> {
        let stream = connect_nonblocking(config.server_addr).map_err(RoomError::Connect)?;
        let session = SecureSession::new_initiator(
            stream,
            config.server_key,
            identity,
            SessionContext::Room,
        );
        info!("Connecting to room server {}", config.server_addr);

        let settings = config.settings.clone();
        Ok(Self {
            config,
            channel: FramedChannel::new(session),
            state: ClientState::Connect,
            player_id: None,
            is_host: false,
            race_port: 0,
            roster: SlotArena::new(),
            settings,
            ticks_in_state: 0,
            ticks_since_send: 0,
        })
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_main(&self) -> bool {
        self.state == ClientState::Main
    }

    pub fn player_id(&self) -> Option<PlayerId> {
        self.player_id
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Players in the room, this client included
    pub fn player_count(&self) -> usize {
        self.roster.len()
    }

    pub fn player(&self, player_id: PlayerId) -> Option<&RoomPlayer> {
        self.roster.get(player_id as usize)
    }

    pub fn players(&self) -> impl Iterator<Item = (PlayerId, &RoomPlayer)> + '_ {
        self.roster.iter().map(|(id, player)| (id as PlayerId, player))
    }

    /// Current authoritative room settings
    pub fn settings(&self) -> &[u32] {
        &self.settings
    }

    /// Where the race relay listens, known once joined
    pub fn race_addr(&self) -> Option<SocketAddr> {
        if self.state != ClientState::Main || self.race_port == 0 {
            return None;
        }
        Some(SocketAddr::new(self.config.server_addr.ip(), self.race_port))
    }

    /// Datagram keys for the race channel, bound to this room session
    pub fn race_keys(&self) -> Result<ExportedKeys, RoomError> {
        Ok(self
            .channel
            .transport()
            .export_keys(SessionContext::Race)?)
    }

    /// One tick of room traffic. An error is final: the state becomes
    /// `Failed` and later calls return [`RoomError::Closed`].
    pub fn calc<H: RoomHandler>(&mut self, handler: &mut H) -> Result<(), RoomError> {
        if self.state == ClientState::Failed {
            return Err(RoomError::Closed);
        }
        match self.step(handler) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Room connection failed in {:?}: {}", self.state, e);
                self.state = ClientState::Failed;
                Err(e)
            }
        }
    }

    fn step<H: RoomHandler>(&mut self, handler: &mut H) -> Result<(), RoomError> {
        self.ticks_in_state = self.ticks_in_state.saturating_add(1);
        self.ticks_since_send = self.ticks_since_send.saturating_add(1);

        if self.state == ClientState::Connect {
            if self.channel.transport_mut().poll_handshake()? {
                debug!("Key exchange with {} done", self.config.server_addr);
                self.send(&RoomRequest::Join {
                    client: self.config.client_id,
                    identity: self.config.identity.clone(),
                    location: self.config.location,
                    settings: self.config.settings.clone(),
                })?;
                self.state = ClientState::Setup;
            }
        }

        if self.state != ClientState::Connect {
            while let Some(event) = self.channel.read_message()? {
                self.handle_event(event, handler)?;
            }
        }

        if self.state != ClientState::Main && self.ticks_in_state > self.config.connect_timeout_ticks {
            return Err(RoomError::Timeout(self.state));
        }

        if self.state == ClientState::Main
            && self.ticks_since_send >= self.config.heartbeat_interval_ticks
        {
            self.send(&RoomRequest::Heartbeat)?;
        }

        self.channel.flush()?;
        Ok(())
    }

    fn handle_event<H: RoomHandler>(
        &mut self,
        event: RoomEvent,
        handler: &mut H,
    ) -> Result<(), RoomError> {
        match (self.state, event) {
            (
                ClientState::Setup,
                RoomEvent::Welcome {
                    player_id,
                    is_host,
                    race_port,
                },
            ) => {
                info!(
                    "Joined room as player {}{}",
                    player_id,
                    if is_host { " (host)" } else { "" }
                );
                self.state = ClientState::Main;
                self.ticks_in_state = 0;
                self.player_id = Some(player_id);
                self.is_host = is_host;
                self.race_port = race_port;

                let me = RoomPlayer {
                    client: self.config.client_id,
                    identity: self.config.identity.clone(),
                    location: self.config.location,
                    settings: self.config.settings.clone(),
                };
                self.insert_player(player_id, me, handler)
            }
            (ClientState::Setup, RoomEvent::Rejected { reason }) => {
                Err(RoomError::Rejected(reason))
            }
            (
                ClientState::Main,
                RoomEvent::Join {
                    player_id,
                    client,
                    identity,
                    location,
                    settings,
                },
            ) => {
                info!("Player {} '{}' joined", player_id, identity.name);
                let player = RoomPlayer {
                    client,
                    identity,
                    location,
                    settings,
                };
                self.insert_player(player_id, player, handler)
            }
            (ClientState::Main, RoomEvent::Leave { player_id }) => {
                if self.roster.remove(player_id as usize).is_some() {
                    info!("Player {} left", player_id);
                    handler.on_player_leave(player_id);
                } else {
                    debug!("Leave for unknown player {}", player_id);
                }
                Ok(())
            }
            (ClientState::Main, RoomEvent::Comment { player_id, message_id }) => {
                handler.on_receive_comment(player_id, message_id);
                Ok(())
            }
            (ClientState::Main, RoomEvent::Settings { settings }) => {
                if settings != self.settings {
                    debug!("Room settings now {:?}", settings);
                }
                self.settings = settings;
                handler.on_settings_change(&self.settings);
                Ok(())
            }
            (_, RoomEvent::Welcome { .. }) => Err(RoomError::Protocol("welcome after joining")),
            (_, RoomEvent::Rejected { .. }) => Err(RoomError::Protocol("rejected after joining")),
            (_, _) => Err(RoomError::Protocol("room event before welcome")),
        }
    }

    fn insert_player<H: RoomHandler>(
        &mut self,
        player_id: PlayerId,
        player: RoomPlayer,
        handler: &mut H,
    ) -> Result<(), RoomError> {
        match self.roster.insert_at(player_id as usize, player) {
            Ok(previous) => {
                if previous.is_some() {
                    warn!("Player {} replaced without a leave", player_id);
                }
            }
            Err(_) => return Err(RoomError::Protocol("player id out of range")),
        }
        if let Some(player) = self.roster.get(player_id as usize) {
            handler.on_player_join(player_id, player);
        }
        Ok(())
    }

    /// Queues a canned chat message for the room
    pub fn send_comment(&mut self, message_id: u32) -> Result<(), RoomError> {
        self.require_main()?;
        self.send(&RoomRequest::Comment { message_id })
    }

    /// Host only. The change takes effect when the server echoes it back.
    pub fn change_settings(&mut self, settings: Vec<u32>) -> Result<(), RoomError> {
        self.require_main()?;
        if !self.is_host {
            return Err(RoomError::NotHost);
        }
        self.send(&RoomRequest::Settings { settings })
    }

    /// Says goodbye and closes the connection
    pub fn leave(mut self) {
        if self.state == ClientState::Main || self.state == ClientState::Setup {
            if let Err(e) = self.send(&RoomRequest::Leave) {
                debug!("Could not send leave: {}", e);
            }
            if let Err(e) = self.channel.flush() {
                debug!("Final flush failed: {}", e);
            }
        }
        if let Err(e) = self
            .channel
            .transport()
            .get_ref()
            .shutdown(std::net::Shutdown::Both)
        {
            debug!("Socket shutdown failed: {}", e);
        }
        info!("Left room");
    }

    fn require_main(&self) -> Result<(), RoomError> {
        if self.state != ClientState::Main {
            return Err(RoomError::WrongState {
                needed: ClientState::Main,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn send(&mut self, request: &RoomRequest) -> Result<(), RoomError> {
        self.channel.write_message(request)?;
        self.ticks_since_send = 0;
        Ok(())
    }
}

impl std::fmt::Debug for RoomClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomClient")
            .field("server", &self.config.server_addr)
            .field("state", &self.state)
            .field("player_id", &self.player_id)
            .field("players", &self.roster.len())
            .finish()
    }
}

/// Opens a TCP socket and starts connecting without waiting for the result
fn connect_nonblocking(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Err(e),
    }
    let stream: TcpStream = socket.into();
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(unix)]
fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS)
}

// Windows reports a pending connect as WSAEWOULDBLOCK
#[cfg(not(unix))]
fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        joins: Vec<PlayerId>,
        leaves: Vec<PlayerId>,
        comments: Vec<(PlayerId, u32)>,
        settings: Vec<Vec<u32>>,
    }

    impl RoomHandler for Recorder {
        fn on_player_join(&mut self, player_id: PlayerId, _player: &RoomPlayer) {
            self.joins.push(player_id);
        }
        fn on_player_leave(&mut self, player_id: PlayerId) {
            self.leaves.push(player_id);
        }
        fn on_receive_comment(&mut self, player_id: PlayerId, message_id: u32) {
            self.comments.push((player_id, message_id));
        }
        fn on_settings_change(&mut self, settings: &[u32]) {
            self.settings.push(settings.to_vec());
        }
    }

    type ServerChannel = FramedChannel<SecureSession<TcpStream>, RoomRequest, RoomEvent>;

    /// Hand-driven server end: accepts one client and runs the handshake
    fn fake_server() -> (TcpListener, Keypair) {
        (TcpListener::bind("127.0.0.1:0").unwrap(), Keypair::generate())
    }

    fn accept(listener: &TcpListener, identity: &Keypair) -> ServerChannel {
        let (stream, _) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        FramedChannel::new(SecureSession::new_responder(
            stream,
            identity,
            SessionContext::Room,
        ))
    }

    /// Ticks both ends until `done` or the tick budget runs out
    fn pump<F: FnMut(&mut RoomClient, &mut ServerChannel) -> bool>(
        client: &mut RoomClient,
        server: &mut ServerChannel,
        handler: &mut Recorder,
        mut done: F,
    ) {
        for _ in 0..500 {
            client.calc(handler).unwrap();
            let _ = server.transport_mut().poll_handshake().unwrap();
            server.flush().unwrap();
            if done(client, server) {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        panic!("condition not reached, client in {:?}", client.state());
    }

    fn config(addr: SocketAddr, key: PublicKey) -> RoomClientConfig {
        RoomClientConfig::new(addr, key, Identity::new("Tester", 3))
    }

    fn joined_client() -> (RoomClient, ServerChannel, Recorder) {
        let (listener, identity) = fake_server();
        let mut client = RoomClient::connect(
            config(listener.local_addr().unwrap(), identity.public_key()),
            &Keypair::generate(),
        )
        .unwrap();
        let mut server = accept(&listener, &identity);
        let mut recorder = Recorder::default();

        let mut join = None;
        pump(&mut client, &mut server, &mut recorder, |_, server| {
            if server.transport().is_established() {
                join = server.read_message().unwrap();
            }
            join.is_some()
        });
        assert!(matches!(join, Some(RoomRequest::Join { .. })));
        assert_eq!(client.state(), ClientState::Setup);

        server
            .write_message(&RoomEvent::Welcome {
                player_id: 2,
                is_host: true,
                race_port: 4000,
            })
            .unwrap();
        pump(&mut client, &mut server, &mut recorder, |client, _| client.is_main());
        (client, server, recorder)
    }

    #[test]
    fn test_join_and_roster_events() {
        let (mut client, mut server, mut recorder) = joined_client();
        assert_eq!(client.player_id(), Some(2));
        assert!(client.is_host());
        assert_eq!(client.player_count(), 1);
        assert_eq!(client.race_addr().unwrap().port(), 4000);
        assert_eq!(recorder.joins, vec![2]);

        server
            .write_message(&RoomEvent::Join {
                player_id: 0,
                client: ClientId::Guest { id: 9 },
                identity: Identity::new("Other", 1),
                location: Location::default(),
                settings: vec![0; ROOM_SETTINGS_COUNT],
            })
            .unwrap();
        server
            .write_message(&RoomEvent::Comment {
                player_id: 0,
                message_id: 17,
            })
            .unwrap();
        pump(&mut client, &mut server, &mut recorder, |client, _| {
            client.player(0).is_some()
        });
        assert_eq!(client.player_count(), 2);
        assert_eq!(client.player(0).unwrap().identity.name, "Other");

        server.write_message(&RoomEvent::Leave { player_id: 0 }).unwrap();
        pump(&mut client, &mut server, &mut recorder, |client, _| {
            client.player(0).is_none()
        });
        assert_eq!(client.player_count(), 1);

        assert_eq!(recorder.joins, vec![2, 0]);
        assert_eq!(recorder.comments, vec![(0, 17)]);
        assert_eq!(recorder.leaves, vec![0]);
    }

    #[test]
    fn test_settings_and_comments_are_sent() {
        let (mut client, mut server, mut recorder) = joined_client();
        client.send_comment(5).unwrap();
        client.change_settings(vec![1; ROOM_SETTINGS_COUNT]).unwrap();

        let mut requests = Vec::new();
        pump(&mut client, &mut server, &mut recorder, |_, server| {
            while let Some(request) = server.read_message().unwrap() {
                requests.push(request);
            }
            requests.len() >= 2
        });
        assert_eq!(requests[0], RoomRequest::Comment { message_id: 5 });
        assert_eq!(
            requests[1],
            RoomRequest::Settings {
                settings: vec![1; ROOM_SETTINGS_COUNT]
            }
        );

        server
            .write_message(&RoomEvent::Settings {
                settings: vec![1; ROOM_SETTINGS_COUNT],
            })
            .unwrap();
        pump(&mut client, &mut server, &mut recorder, |client, _| {
            client.settings() == [1; ROOM_SETTINGS_COUNT]
        });
        assert_eq!(recorder.settings.len(), 1);
    }

    #[test]
    fn test_rejection_is_final() {
        let (listener, identity) = fake_server();
        let mut client = RoomClient::connect(
            config(listener.local_addr().unwrap(), identity.public_key()),
            &Keypair::generate(),
        )
        .unwrap();
        let mut server = accept(&listener, &identity);
        let mut recorder = Recorder::default();

        pump(&mut client, &mut server, &mut recorder, |client, _| {
            client.state() == ClientState::Setup
        });
        server
            .write_message(&RoomEvent::Rejected {
                reason: shared::RejectReason::RoomFull,
            })
            .unwrap();
        server.flush().unwrap();

        let mut outcome = Ok(());
        for _ in 0..500 {
            outcome = client.calc(&mut recorder);
            if outcome.is_err() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(outcome.unwrap_err().code(), 30010);
        assert_eq!(client.state(), ClientState::Failed);
        assert!(matches!(client.calc(&mut recorder), Err(RoomError::Closed)));
    }

    #[test]
    fn test_requests_need_main_and_host() {
        let (listener, identity) = fake_server();
        let mut client = RoomClient::connect(
            config(listener.local_addr().unwrap(), identity.public_key()),
            &Keypair::generate(),
        )
        .unwrap();
        assert!(matches!(
            client.send_comment(1),
            Err(RoomError::WrongState { .. })
        ));
        assert!(client.race_addr().is_none());
    }

    #[test]
    fn test_connect_in_progress_classification() {
        assert!(connect_in_progress(&io::ErrorKind::WouldBlock.into()));
        #[cfg(unix)]
        assert!(connect_in_progress(&io::Error::from_raw_os_error(
            libc::EINPROGRESS
        )));
        assert!(!connect_in_progress(&io::ErrorKind::ConnectionRefused.into()));
    }

    #[test]
    fn test_leave_after_server_closed() {
        let (client, server, _) = joined_client();
        drop(server);
        std::thread::sleep(std::time::Duration::from_millis(20));
        client.leave();
    }

    #[test]
    fn test_connect_timeout() {
        let (listener, _) = fake_server();
        let mut config = config(listener.local_addr().unwrap(), Keypair::generate().public_key());
        config.connect_timeout_ticks = 3;
        let mut client = RoomClient::connect(config, &Keypair::generate()).unwrap();

        let mut recorder = Recorder::default();
        let mut outcome = Ok(());
        for _ in 0..5 {
            outcome = client.calc(&mut recorder);
            if outcome.is_err() {
                break;
            }
        }
        assert!(matches!(outcome, Err(RoomError::Timeout(ClientState::Connect))));
    }
}
