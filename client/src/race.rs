//! Client side of the race channel
//!
//! Every tick the game calls [`RaceClient::calc_write`] and then
//! [`RaceClient::calc_read`]. Until the first server frame arrives the
//! client only pings, which also tells the relay where to send frames.
//! After that it sends its local karts' state each tick.
//!
//! Inbound frames are drained without blocking. Each one must pass
//! [`validate_frame`] against the newest frame accepted so far; anything
//! older, duplicated or implausible is dropped on the spot. Only the newest
//! survivor is kept and later written into the game by
//! [`RaceClient::apply_frame`].

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use log::{debug, info};
use shared::datagram::MAX_DATAGRAM_SIZE;
use shared::session::ExportedKeys;
use shared::{
    validate_frame, DatagramChannel, NetError, PlayerId, RaceInput, RacePacket, RaceServerFrame,
    Role,
};

use crate::accessor::{RaceAccessor, RaceHandler};
use crate::error::RoomError;
use crate::network::{ClientState, RoomClient};

/// Ticks between pings while waiting for the first frame
pub const PING_INTERVAL_TICKS: u32 = 6;

pub struct RaceClient {
    socket: UdpSocket,
    channel: DatagramChannel,
    frame: Option<RaceServerFrame>,
    can_start_countdown: bool,
    ticks_since_ping: u32,
    rejected: u64,
}

impl RaceClient {
    pub fn new(server: SocketAddr, keys: &ExportedKeys) -> Result<Self, NetError> {
        let local: SocketAddr = match server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(server)?;
        socket.set_nonblocking(true)?;
        info!("Race channel {} -> {}", socket.local_addr()?, server);

        Ok(Self {
            socket,
            channel: DatagramChannel::new(keys, Role::Initiator),
            frame: None,
            can_start_countdown: false,
            // ping on the very first tick
            ticks_since_ping: PING_INTERVAL_TICKS,
            rejected: 0,
        })
    }

    /// Opens the race channel of a joined room connection
    pub fn from_room(room: &RoomClient) -> Result<Self, RoomError> {
        let Some(addr) = room.race_addr() else {
            return Err(RoomError::WrongState {
                needed: ClientState::Main,
                actual: room.state(),
            });
        };
        Ok(Self::new(addr, &room.race_keys()?)?)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Newest accepted server frame
    pub fn frame(&self) -> Option<&RaceServerFrame> {
        self.frame.as_ref()
    }

    /// Set once any server frame has been accepted
    pub fn can_start_countdown(&self) -> bool {
        self.can_start_countdown
    }

    /// Frames dropped by validation so far
    pub fn rejected_frames(&self) -> u64 {
        self.rejected
    }

    /// Sends this tick's datagram: a ping while idle, local kart state once racing
    pub fn calc_write<A: RaceAccessor>(&mut self, accessor: &A) -> Result<(), NetError> {
        let packet = match &self.frame {
            None => {
                self.ticks_since_ping = self.ticks_since_ping.saturating_add(1);
                if self.ticks_since_ping < PING_INTERVAL_TICKS {
                    return Ok(());
                }
                self.ticks_since_ping = 0;
                RacePacket::Ping
            }
            Some(frame) => {
                let players = accessor
                    .screen_player_ids()
                    .into_iter()
                    .take(accessor.local_player_count() as usize)
                    .map(|player_id| accessor.player_physical_state(player_id))
                    .collect();
                RacePacket::Race(RaceInput {
                    time: accessor.current_time(),
                    server_time: frame.time,
                    players,
                })
            }
        };

        let datagram = self.channel.seal(&packet)?;
        match self.socket.send(&datagram) {
            Ok(_) => Ok(()),
            // unreliable channel: a full buffer or an ICMP error just loses this tick
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionRefused
                ) =>
            {
                debug!("Race send skipped: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drains every pending datagram and keeps the newest valid frame.
    /// Returns true when a new frame was accepted this call.
    pub fn calc_read<H: RaceHandler>(
        &mut self,
        expected_players: usize,
        handler: &mut H,
    ) -> Result<bool, NetError> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let mut accepted = false;

        loop {
            let len = match self.socket.recv(&mut buf) {
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                Err(e) => return Err(e.into()),
            };

            let frame: RaceServerFrame = match self.channel.open(&buf[..len]) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Dropped race datagram: {}", e);
                    continue;
                }
            };
            if let Err(rejection) = validate_frame(&frame, self.frame.as_ref(), expected_players) {
                debug!("Rejected frame {}: {}", frame.time, rejection);
                self.rejected += 1;
                continue;
            }

            self.frame = Some(frame);
            accepted = true;
        }

        if let Some(frame) = &self.frame {
            if accepted {
                handler.on_race_frame_accepted(frame);
            }
            self.can_start_countdown = true;
        }
        Ok(accepted)
    }

    /// Writes the newest accepted frame into the game, kart by kart
    pub fn apply_frame<A: RaceAccessor>(&self, accessor: &mut A) {
        let Some(frame) = &self.frame else {
            return;
        };
        // TODO: add clock-drift compensation between frame.time and the local
        // race clock as a tunable once the lag target is settled
        for (index, player) in frame.players.iter().enumerate() {
            let Ok(player_id) = PlayerId::try_from(index) else {
                break;
            };
            accessor.apply_physical_state(player_id, player);
        }
    }
}

impl std::fmt::Debug for RaceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaceClient")
            .field("frame_time", &self.frame.as_ref().map(|frame| frame.time))
            .field("can_start_countdown", &self.can_start_countdown)
            .field("rejected", &self.rejected)
            .finish_non_exhaustive()
    }
}
