//! Room server configuration

use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_ROOM_PORT: u16 = 21330;
pub const DEFAULT_RACE_PORT: u16 = 21331;
pub const DEFAULT_UPDATE_PORT: u16 = 21328;
pub const DEFAULT_TICK_RATE: u32 = 60;

/// Tunables for [`RoomServer`](crate::network::RoomServer). All timeouts are
/// counted in `calc` ticks, never wall-clock time.
#[derive(Debug, Clone)]
pub struct RoomServerConfig {
    pub room_addr: SocketAddr,
    pub race_addr: SocketAddr,
    /// Open sockets allowed at once, joined or not
    pub max_connections: usize,
    /// Ticks a client may spend in Connect or Setup
    pub handshake_timeout_ticks: u32,
    /// Ticks a joined client may stay silent
    pub idle_timeout_ticks: u32,
    /// Ticks between two comment broadcasts
    pub comment_cooldown_ticks: u32,
}

impl RoomServerConfig {
    /// Converts a wall-clock span into ticks at the given rate, rounding up
    pub fn ticks_for(duration: Duration, tick_rate: u32) -> u32 {
        let ticks = (duration.as_secs_f64() * tick_rate as f64).ceil();
        ticks.clamp(1.0, u32::MAX as f64) as u32
    }

    /// Default timeouts rescaled for a different tick rate
    pub fn with_tick_rate(mut self, tick_rate: u32) -> Self {
        self.handshake_timeout_ticks = Self::ticks_for(Duration::from_secs(10), tick_rate);
        self.idle_timeout_ticks = Self::ticks_for(Duration::from_secs(30), tick_rate);
        self
    }
}

impl Default for RoomServerConfig {
    fn default() -> Self {
        Self {
            room_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_ROOM_PORT)),
            race_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_RACE_PORT)),
            max_connections: 2 * shared::ROOM_CAPACITY,
            handshake_timeout_ticks: 10 * DEFAULT_TICK_RATE,
            idle_timeout_ticks: 30 * DEFAULT_TICK_RATE,
            comment_cooldown_ticks: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_for_rounds_up() {
        assert_eq!(RoomServerConfig::ticks_for(Duration::from_secs(1), 60), 60);
        assert_eq!(RoomServerConfig::ticks_for(Duration::from_millis(10), 60), 1);
        assert_eq!(RoomServerConfig::ticks_for(Duration::ZERO, 60), 1);
    }

    #[test]
    fn test_tick_rate_rescaling() {
        let config = RoomServerConfig::default().with_tick_rate(30);
        assert_eq!(config.handshake_timeout_ticks, 300);
        assert_eq!(config.idle_timeout_ticks, 900);
        assert_eq!(config.comment_cooldown_ticks, 1);
    }
}
