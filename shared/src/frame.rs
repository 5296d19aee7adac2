//! Plausibility checks for race frames received from the network
//!
//! A frame that fails any check is dropped. Rejections are ordinary values,
//! not errors: a hostile or buggy peer must not be able to stall the game loop.

use crate::protocol::{PlayerFrame, Quat, RaceServerFrame, Vec3};

pub const MAX_POSITION: f32 = 1_000_000.0;
pub const MAX_QUAT_COMPONENT: f32 = 1.001;
pub const MIN_SPEED: f32 = -20.0;
pub const MAX_SPEED: f32 = 120.0;

/// Why a frame was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRejection {
    /// Not newer than the last accepted frame
    Stale { time: u32, last: u32 },
    PlayerCount { got: usize, expected: usize },
    PlayerTimeCount { got: usize, expected: usize },
    /// A player's cumulative time went backwards
    PlayerTimeRegressed { player: usize },
    Position { player: usize },
    Rotation { player: usize },
    Speed { player: usize },
}

impl std::fmt::Display for FrameRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameRejection::Stale { time, last } => {
                write!(f, "frame time {} not after {}", time, last)
            }
            FrameRejection::PlayerCount { got, expected } => {
                write!(f, "{} players, expected {}", got, expected)
            }
            FrameRejection::PlayerTimeCount { got, expected } => {
                write!(f, "{} player times, expected {}", got, expected)
            }
            FrameRejection::PlayerTimeRegressed { player } => {
                write!(f, "player {} time went backwards", player)
            }
            FrameRejection::Position { player } => write!(f, "player {} position", player),
            FrameRejection::Rotation { player } => write!(f, "player {} rotation", player),
            FrameRejection::Speed { player } => write!(f, "player {} speed", player),
        }
    }
}

fn in_range(value: f32, min: f32, max: f32) -> bool {
    // NaN fails both comparisons
    value >= min && value <= max
}

pub fn is_vec3_valid(v: &Vec3) -> bool {
    [v.x, v.y, v.z]
        .into_iter()
        .all(|c| in_range(c, -MAX_POSITION, MAX_POSITION))
}

pub fn is_quat_valid(q: &Quat) -> bool {
    [q.x, q.y, q.z, q.w]
        .into_iter()
        .all(|c| in_range(c, -MAX_QUAT_COMPONENT, MAX_QUAT_COMPONENT))
}

pub fn is_speed_valid(speed: f32) -> bool {
    in_range(speed, MIN_SPEED, MAX_SPEED)
}

/// Field checks shared by client-side frame validation and the server relay
pub fn validate_player(index: usize, player: &PlayerFrame) -> Result<(), FrameRejection> {
    if !is_vec3_valid(&player.pos) {
        return Err(FrameRejection::Position { player: index });
    }
    if !is_quat_valid(&player.main_rot) {
        return Err(FrameRejection::Rotation { player: index });
    }
    if !is_speed_valid(player.internal_speed) {
        return Err(FrameRejection::Speed { player: index });
    }
    Ok(())
}

/// Decides whether `frame` may replace `last` as the most recent accepted frame
pub fn validate_frame(
    frame: &RaceServerFrame,
    last: Option<&RaceServerFrame>,
    expected_players: usize,
) -> Result<(), FrameRejection> {
    if let Some(last) = last {
        if frame.time <= last.time {
            return Err(FrameRejection::Stale {
                time: frame.time,
                last: last.time,
            });
        }
    }

    if frame.player_times.len() != expected_players {
        return Err(FrameRejection::PlayerTimeCount {
            got: frame.player_times.len(),
            expected: expected_players,
        });
    }
    if let Some(last) = last {
        let regressed = frame
            .player_times
            .iter()
            .zip(&last.player_times)
            .position(|(now, before)| now < before);
        if let Some(player) = regressed {
            return Err(FrameRejection::PlayerTimeRegressed { player });
        }
    }

    if frame.players.len() != expected_players {
        return Err(FrameRejection::PlayerCount {
            got: frame.players.len(),
            expected: expected_players,
        });
    }

    frame
        .players
        .iter()
        .enumerate()
        .try_for_each(|(index, player)| validate_player(index, player))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(time: u32, players: usize) -> RaceServerFrame {
        RaceServerFrame {
            time,
            player_times: vec![time; players],
            players: vec![PlayerFrame::default(); players],
        }
    }

    #[test]
    fn test_first_frame_accepted() {
        assert_eq!(validate_frame(&frame(10, 2), None, 2), Ok(()));
    }

    #[test]
    fn test_time_must_strictly_increase() {
        let last = frame(10, 2);
        assert!(matches!(
            validate_frame(&frame(10, 2), Some(&last), 2),
            Err(FrameRejection::Stale { .. })
        ));
        assert!(matches!(
            validate_frame(&frame(9, 2), Some(&last), 2),
            Err(FrameRejection::Stale { .. })
        ));
        assert_eq!(validate_frame(&frame(11, 2), Some(&last), 2), Ok(()));
    }

    #[test]
    fn test_player_count_must_match_room() {
        assert!(matches!(
            validate_frame(&frame(1, 3), None, 2),
            Err(FrameRejection::PlayerTimeCount { got: 3, expected: 2 })
        ));

        let mut mismatched = frame(1, 2);
        mismatched.players.pop();
        assert!(matches!(
            validate_frame(&mismatched, None, 2),
            Err(FrameRejection::PlayerCount { got: 1, expected: 2 })
        ));
    }

    #[test]
    fn test_player_time_regression_rejected() {
        let last = frame(10, 2);
        let mut next = frame(11, 2);
        next.player_times[1] = 9;
        assert_eq!(
            validate_frame(&next, Some(&last), 2),
            Err(FrameRejection::PlayerTimeRegressed { player: 1 })
        );
    }

    #[test]
    fn test_position_bounds() {
        assert!(is_vec3_valid(&Vec3::new(1e6, -1e6, 0.0)));
        assert!(!is_vec3_valid(&Vec3::new(1.5e6, 0.0, 0.0)));
        assert!(!is_vec3_valid(&Vec3::new(0.0, f32::NAN, 0.0)));
        assert!(!is_vec3_valid(&Vec3::new(0.0, 0.0, f32::NEG_INFINITY)));
    }

    #[test]
    fn test_quaternion_bounds() {
        assert!(is_quat_valid(&Quat::IDENTITY));
        assert!(is_quat_valid(&Quat {
            x: 1.0005,
            y: 0.0,
            z: 0.0,
            w: -1.0005
        }));

        let mut q = Quat::IDENTITY;
        q.w = 2.0;
        assert!(!is_quat_valid(&q));
        q.w = f32::NAN;
        assert!(!is_quat_valid(&q));
    }

    #[test]
    fn test_speed_bounds() {
        assert!(is_speed_valid(-20.0));
        assert!(is_speed_valid(120.0));
        assert!(!is_speed_valid(120.5));
        assert!(!is_speed_valid(-21.0));
        assert!(!is_speed_valid(f32::NAN));
    }

    #[test]
    fn test_invalid_field_rejects_whole_frame() {
        let mut bad = frame(5, 3);
        bad.players[2].main_rot.w = 2.0;
        assert_eq!(
            validate_frame(&bad, None, 3),
            Err(FrameRejection::Rotation { player: 2 })
        );

        let mut bad = frame(5, 3);
        bad.players[0].internal_speed = f32::NAN;
        assert_eq!(
            validate_frame(&bad, None, 3),
            Err(FrameRejection::Speed { player: 0 })
        );

        let mut bad = frame(5, 3);
        bad.players[1].pos.x = f32::NAN;
        assert_eq!(
            validate_frame(&bad, None, 3),
            Err(FrameRejection::Position { player: 1 })
        );
    }
}
