//! Room server: the authoritative hub every client of a room connects to
//!
//! The server is driven entirely by [`RoomServer::calc`], called once per
//! tick by the hosting loop. Nothing in here blocks: the listener and every
//! client socket are non-blocking, and a socket with nothing to say simply
//! ends its work for the tick.
//!
//! Each tick:
//! 1. accepts pending connections
//! 2. steps every client session once and applies the requests it collected
//! 3. tears down failed sessions, queueing their Leave
//! 4. broadcasts queued Leaves and frees their slots
//! 5. broadcasts at most one comment and one settings change
//! 6. calls `on_main` if anyone is in Main
//! 7. runs the race relay

use std::io;
use std::net::{SocketAddr, TcpListener};

use log::{debug, error, info, warn};
use shared::protocol::settings_are_valid;
use shared::{
    Keypair, PlayerId, RejectReason, RingBuffer, RoomEvent, RoomRequest, COMMENT_QUEUE_CAPACITY,
    DISCONNECT_QUEUE_CAPACITY, ROOM_SETTINGS_COUNT,
};

use crate::client::{ClientSession, SessionState};
use crate::config::RoomServerConfig;
use crate::error::ServerError;
use crate::handler::RoomEventHandler;
use crate::race::RaceRelay;
use crate::roster::{Player, Roster};

/// A comment waiting for its broadcast slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Comment {
    pub player_id: PlayerId,
    pub message_id: u32,
}

pub struct RoomServer {
    config: RoomServerConfig,
    identity: Keypair,
    listener: TcpListener,
    race: RaceRelay,
    sessions: Vec<ClientSession>,
    roster: Roster,
    host: Option<PlayerId>,
    host_elected: bool,
    settings: Vec<u32>,
    pending_settings: Option<Vec<u32>>,
    comments: RingBuffer<Comment, COMMENT_QUEUE_CAPACITY>,
    comment_timer: u32,
    disconnects: RingBuffer<PlayerId, DISCONNECT_QUEUE_CAPACITY>,
}

impl RoomServer {
    /// Binds the room listener and race socket
    pub fn bind(config: RoomServerConfig, identity: Keypair) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.room_addr).map_err(|source| ServerError::Bind {
            addr: config.room_addr,
            source,
        })?;
        listener.set_nonblocking(true)?;
        let race = RaceRelay::bind(config.race_addr)?;

        info!(
            "Room server listening on {} with key {}",
            listener.local_addr()?,
            identity.public_key().to_hex()
        );

        Ok(Self {
            config,
            identity,
            listener,
            race,
            sessions: Vec::new(),
            roster: Roster::new(),
            host: None,
            host_elected: false,
            settings: vec![0; ROOM_SETTINGS_COUNT],
            pending_settings: None,
            comments: RingBuffer::new(),
            comment_timer: 0,
            disconnects: RingBuffer::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn race_addr(&self) -> io::Result<SocketAddr> {
        self.race.local_addr()
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn player_count(&self) -> usize {
        self.roster.player_count()
    }

    pub fn host(&self) -> Option<PlayerId> {
        self.host
    }

    pub fn settings(&self) -> &[u32] {
        &self.settings
    }

    pub fn race(&self) -> &RaceRelay {
        &self.race
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn queued_comments(&self) -> usize {
        self.comments.len()
    }

    /// Runs one server tick
    pub fn calc<H: RoomEventHandler>(&mut self, handler: &mut H) -> Result<(), ServerError> {
        self.accept_connections()?;

        let mut failed = Vec::new();
        for index in 0..self.sessions.len() {
            if let Err(e) = self.step_session(index, handler) {
                failed.push((index, e));
            }
        }
        for (index, reason) in failed.into_iter().rev() {
            let session = self.sessions.swap_remove(index);
            self.teardown(session, reason, handler);
        }

        self.flush_disconnects();
        self.flush_comment(handler);
        self.flush_settings(handler);

        if self.sessions.iter().any(ClientSession::is_main) {
            handler.on_main();
        }

        let players = self.roster.player_ids();
        if let Err(e) = self.race.calc(&players) {
            error!("Race relay error: {}", e);
        }
        Ok(())
    }

    fn accept_connections(&mut self) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => return Err(e.into()),
            };

            if self.sessions.len() >= self.config.max_connections {
                warn!("Refusing {}: {} connections open", addr, self.sessions.len());
                continue;
            }
            if let Err(e) = stream.set_nonblocking(true).and_then(|_| stream.set_nodelay(true)) {
                warn!("Could not configure socket for {}: {}", addr, e);
                continue;
            }

            info!("Accepted connection from {}", addr);
            self.sessions
                .push(ClientSession::new(stream, addr, &self.identity));
        }
    }

    fn step_session<H: RoomEventHandler>(
        &mut self,
        index: usize,
        handler: &mut H,
    ) -> Result<(), ServerError> {
        let requests = self.sessions[index].step(&self.config)?;
        for request in requests {
            self.handle_request(index, request, handler)?;
        }
        Ok(())
    }

    fn handle_request<H: RoomEventHandler>(
        &mut self,
        index: usize,
        request: RoomRequest,
        handler: &mut H,
    ) -> Result<(), ServerError> {
        let session = &self.sessions[index];
        match (session.state(), request) {
            (
                SessionState::Setup,
                RoomRequest::Join {
                    client,
                    identity,
                    location,
                    settings,
                },
            ) => {
                let player = Player::new(client, identity, location, settings);
                self.on_player_join(index, player, handler)
            }
            (SessionState::Main, RoomRequest::Comment { message_id }) => {
                let player_id = self.player_of(index)?;
                let comment = Comment {
                    player_id,
                    message_id,
                };
                if let Some(dropped) = self.comments.push(comment) {
                    debug!(
                        "Comment queue full, dropped {} from player {}",
                        dropped.message_id, dropped.player_id
                    );
                }
                Ok(())
            }
            (SessionState::Main, RoomRequest::Settings { settings }) => {
                let player_id = self.player_of(index)?;
                if self.host != Some(player_id) {
                    warn!("Ignoring settings from non-host player {}", player_id);
                } else if !settings_are_valid(&settings) {
                    warn!("Ignoring malformed settings from host {}", player_id);
                } else {
                    self.pending_settings = Some(settings);
                }
                Ok(())
            }
            (SessionState::Setup | SessionState::Main, RoomRequest::Heartbeat) => Ok(()),
            (_, RoomRequest::Leave) => Err(ServerError::Left),
            (SessionState::Main, RoomRequest::Join { .. }) => {
                Err(ServerError::Protocol("join after joining"))
            }
            (_, _) => Err(ServerError::Protocol("request before join")),
        }
    }

    fn player_of(&self, index: usize) -> Result<PlayerId, ServerError> {
        self.sessions[index]
            .player_id()
            .ok_or(ServerError::Protocol("no player for session"))
    }

    fn on_player_join<H: RoomEventHandler>(
        &mut self,
        index: usize,
        player: Player,
        handler: &mut H,
    ) -> Result<(), ServerError> {
        let rejection = if !player.identity.is_valid() {
            Some(RejectReason::InvalidIdentity)
        } else if !settings_are_valid(&player.settings) {
            Some(RejectReason::InvalidSettings)
        } else {
            None
        };
        if let Some(reason) = rejection {
            return Err(self.reject(index, reason));
        }

        let race_keys = self.sessions[index].race_keys()?;
        let player_id = match self.roster.join(player.clone()) {
            Ok(player_id) => player_id,
            Err(reason) => return Err(self.reject(index, reason)),
        };

        let is_host = !self.host_elected;
        if is_host {
            self.host = Some(player_id);
            self.host_elected = true;
            self.settings = player.settings.clone();
            info!("Player {} is the room host", player_id);
        }
        self.race.register(player_id, &race_keys);

        let race_port = self.race.local_addr().map(|addr| addr.port()).unwrap_or(0);
        let existing: Vec<RoomEvent> = self
            .roster
            .iter()
            .filter(|(id, _)| *id != player_id)
            .map(|(id, other)| join_event(id, other))
            .collect();

        let session = &mut self.sessions[index];
        session.enter_main(player_id);
        session.send(&RoomEvent::Welcome {
            player_id,
            is_host,
            race_port,
        });
        for event in &existing {
            session.send(event);
        }
        session.send(&RoomEvent::Settings {
            settings: self.settings.clone(),
        });

        self.broadcast(&join_event(player_id, &player), Some(index));
        handler.on_player_join(player_id, &player);
        Ok(())
    }

    /// Queues a Rejected event; the session closes right after
    fn reject(&mut self, index: usize, reason: RejectReason) -> ServerError {
        let session = &mut self.sessions[index];
        info!("Rejecting join from {}: {:?}", session.addr, reason);
        session.send(&RoomEvent::Rejected { reason });
        ServerError::Rejected(reason)
    }

    /// Frees everything a session held. The slot itself stays reserved until
    /// the Leave broadcast in [`flush_disconnects`](Self::flush_disconnects).
    fn teardown<H: RoomEventHandler>(
        &mut self,
        session: ClientSession,
        reason: ServerError,
        handler: &mut H,
    ) {
        if reason.is_graceful() {
            info!("Client {} disconnected: {}", session.addr, reason);
        } else {
            warn!("Dropping client {}: {}", session.addr, reason);
        }

        if let Some(player_id) = session.player_id() {
            if self.roster.mark_leaving(player_id) {
                if self.disconnects.push(player_id).is_some() {
                    error!("Disconnect queue overflowed");
                }
            }
            self.race.unregister(player_id);
            if self.host == Some(player_id) {
                info!("Host left; settings are locked for this room");
                self.host = None;
                self.pending_settings = None;
            }
            handler.on_player_leave(player_id);
        }

        session.close();
    }

    fn flush_disconnects(&mut self) {
        while let Some(player_id) = self.disconnects.pop() {
            self.broadcast(&RoomEvent::Leave { player_id }, None);
            self.roster.release(player_id);
        }
    }

    fn flush_comment<H: RoomEventHandler>(&mut self, handler: &mut H) {
        self.comment_timer = self.comment_timer.saturating_add(1);
        if self.comment_timer < self.config.comment_cooldown_ticks {
            return;
        }

        // comments from players who left since are dropped
        while let Some(comment) = self.comments.pop() {
            if self.roster.get(comment.player_id).is_none() {
                continue;
            }
            self.broadcast(
                &RoomEvent::Comment {
                    player_id: comment.player_id,
                    message_id: comment.message_id,
                },
                None,
            );
            handler.on_receive_comment(comment.player_id, comment.message_id);
            self.comment_timer = 0;
            break;
        }
    }

    fn flush_settings<H: RoomEventHandler>(&mut self, handler: &mut H) {
        let Some(settings) = self.pending_settings.take() else {
            return;
        };
        if settings == self.settings {
            return;
        }

        info!("Room settings changed: {:?}", settings);
        self.settings = settings;
        self.broadcast(
            &RoomEvent::Settings {
                settings: self.settings.clone(),
            },
            None,
        );
        handler.on_settings_change(&self.settings);
    }

    /// Sends an event to every Main session except `exclude`
    fn broadcast(&mut self, event: &RoomEvent, exclude: Option<usize>) {
        for (index, session) in self.sessions.iter_mut().enumerate() {
            if Some(index) == exclude || !session.is_main() {
                continue;
            }
            session.send(event);
        }
    }
}

fn join_event(player_id: PlayerId, player: &Player) -> RoomEvent {
    RoomEvent::Join {
        player_id,
        client: player.client,
        identity: player.identity.clone(),
        location: player.location,
        settings: player.settings.clone(),
    }
}

impl std::fmt::Debug for RoomServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomServer")
            .field("sessions", &self.sessions.len())
            .field("players", &self.roster.player_count())
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}
