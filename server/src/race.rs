//! Server side of the race channel
//!
//! Racers send one encrypted datagram per tick: a ping while they wait for
//! the first frame, then their local kart state. The relay attributes each
//! datagram to a player by trying that player's exported keys, keeps the
//! newest plausible state per slot and, every tick, sends one authoritative
//! frame with an entry per present player to every racer it has heard from.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use log::{debug, info, warn};
use shared::datagram::MAX_DATAGRAM_SIZE;
use shared::frame::validate_player;
use shared::session::ExportedKeys;
use shared::{
    DatagramChannel, PlayerFrame, PlayerId, RaceInput, RacePacket, RaceServerFrame, Role,
    ROOM_CAPACITY,
};

use crate::error::ServerError;

struct RacePeer {
    channel: DatagramChannel,
    addr: Option<SocketAddr>,
    latest: Option<PlayerFrame>,
    player_time: u32,
    acked_time: u32,
}

impl RacePeer {
    fn new(keys: &ExportedKeys) -> Self {
        Self {
            channel: DatagramChannel::new(keys, Role::Responder),
            addr: None,
            latest: None,
            player_time: 0,
            acked_time: 0,
        }
    }

    fn apply_input(&mut self, player_id: PlayerId, input: RaceInput) {
        self.acked_time = self.acked_time.max(input.server_time);

        // one slot per client; extra local players are not relayed
        let Some(first) = input.players.first() else {
            return;
        };
        if let Err(rejection) = validate_player(0, first) {
            debug!("Dropped input from player {}: {}", player_id, rejection);
            return;
        }

        self.latest = Some(*first);
        self.player_time = self.player_time.max(input.time);
    }
}

pub struct RaceRelay {
    socket: UdpSocket,
    peers: [Option<RacePeer>; ROOM_CAPACITY],
    time: u32,
}

impl RaceRelay {
    pub fn bind(addr: SocketAddr) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        socket.set_nonblocking(true)?;
        info!("Race relay listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            peers: std::array::from_fn(|_| None),
            time: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Current server frame time
    pub fn time(&self) -> u32 {
        self.time
    }

    pub fn register(&mut self, player_id: PlayerId, keys: &ExportedKeys) {
        if let Some(slot) = self.peers.get_mut(player_id as usize) {
            *slot = Some(RacePeer::new(keys));
        }
    }

    pub fn unregister(&mut self, player_id: PlayerId) {
        if let Some(slot) = self.peers.get_mut(player_id as usize) {
            *slot = None;
        }
    }

    /// Race address learned from the player's first authenticated datagram
    pub fn peer_addr(&self, player_id: PlayerId) -> Option<SocketAddr> {
        self.peer(player_id)?.addr
    }

    /// Last server time the player said it accepted
    pub fn acknowledged_time(&self, player_id: PlayerId) -> Option<u32> {
        Some(self.peer(player_id)?.acked_time)
    }

    fn peer(&self, player_id: PlayerId) -> Option<&RacePeer> {
        self.peers.get(player_id as usize)?.as_ref()
    }

    /// Drains inbound datagrams, then relays one frame covering `players`
    pub fn calc(&mut self, players: &[PlayerId]) -> Result<(), ServerError> {
        self.receive()?;
        self.broadcast(players);
        Ok(())
    }

    fn receive(&mut self) -> Result<(), ServerError> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                // ICMP errors from a racer that went away surface here on some platforms
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e.into()),
            };
            self.dispatch(&buf[..len], from);
        }
    }

    fn dispatch(&mut self, datagram: &[u8], from: SocketAddr) {
        for (player_id, slot) in self.peers.iter_mut().enumerate() {
            let Some(peer) = slot else {
                continue;
            };
            let Ok(packet) = peer.channel.open::<RacePacket>(datagram) else {
                continue;
            };

            if peer.addr != Some(from) {
                info!("Player {} racing from {}", player_id, from);
                peer.addr = Some(from);
            }
            if let RacePacket::Race(input) = packet {
                peer.apply_input(player_id as PlayerId, input);
            }
            return;
        }
        debug!("Unattributed race datagram from {}", from);
    }

    fn broadcast(&mut self, players: &[PlayerId]) {
        if self.peers.iter().flatten().all(|peer| peer.addr.is_none()) {
            return;
        }

        self.time = self.time.wrapping_add(1);
        let mut frame = RaceServerFrame {
            time: self.time,
            player_times: Vec::with_capacity(players.len()),
            players: Vec::with_capacity(players.len()),
        };
        for &player_id in players {
            let peer = self.peer(player_id);
            frame.player_times.push(peer.map_or(0, |p| p.player_time));
            frame
                .players
                .push(peer.and_then(|p| p.latest).unwrap_or_default());
        }

        for (player_id, slot) in self.peers.iter_mut().enumerate() {
            let Some(peer) = slot else {
                continue;
            };
            let Some(addr) = peer.addr else {
                continue;
            };

            let datagram = match peer.channel.seal(&frame) {
                Ok(datagram) => datagram,
                Err(e) => {
                    warn!("Could not seal frame for player {}: {}", player_id, e);
                    continue;
                }
            };
            match self.socket.send_to(&datagram, addr) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => debug!("Race send to {} failed: {}", addr, e),
            }
        }
    }
}

impl std::fmt::Debug for RaceRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaceRelay")
            .field("time", &self.time)
            .field("peers", &self.peers.iter().flatten().count())
            .finish_non_exhaustive()
    }
}
