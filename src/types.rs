//! Core world types shared across all modules.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Pixel size of one map tile.
pub const TILE_PX: i32 = 32;

// ---------------------------------------------------------------------------
// Tile positions
// ---------------------------------------------------------------------------

/// A tile coordinate on the shared map.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance in tile units.
    pub fn distance(&self, other: &Position) -> f32 {
        let dx = (self.x - other.x) as f32;
        let dy = (self.y - other.y) as f32;
        (dx * dx + dy * dy).sqrt()
    }

    /// The neighbouring tile one step in `direction`.
    pub fn step(&self, direction: Direction) -> Position {
        let (dx, dy) = direction.delta();
        Position::new(self.x + dx, self.y + dy)
    }

    /// Top-left pixel of this tile.
    pub fn to_pixels(&self) -> PixelPosition {
        PixelPosition {
            x: (self.x * TILE_PX) as f32,
            y: (self.y * TILE_PX) as f32,
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Sub-tile pixel position, used for camera and audio continuity while a
/// step animates between tiles.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PixelPosition {
    pub x: f32,
    pub y: f32,
}

impl PixelPosition {
    /// Tile containing this pixel.
    pub fn to_tile(&self) -> Position {
        Position::new(
            (self.x / TILE_PX as f32).floor() as i32,
            (self.y / TILE_PX as f32).floor() as i32,
        )
    }
}

// ---------------------------------------------------------------------------
// Facing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    #[default]
    Down,
    Left,
    Right,
}

impl Direction {
    /// Tile delta for one step. `y` grows downwards.
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

// ---------------------------------------------------------------------------
// Zones
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoneKind {
    Public,
    Private,
}

impl ZoneKind {
    /// Map zones named `Room…` are meeting rooms; everything else is open.
    pub fn from_zone_name(name: &str) -> Self {
        if name.starts_with("Room") {
            ZoneKind::Private
        } else {
            ZoneKind::Public
        }
    }
}

/// The zone the local player currently occupies, as seen by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneState {
    pub id: String,
    pub kind: ZoneKind,
    pub members: HashSet<String>,
}

impl ZoneState {
    pub fn new(id: impl Into<String>, kind: ZoneKind) -> Self {
        Self {
            id: id.into(),
            kind,
            members: HashSet::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// Connecting counts as "wanting to be connected" for hysteresis.
    pub fn is_engaged(self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }
}

/// A member of the roster as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub x: Option<i32>,
    #[serde(default)]
    pub y: Option<i32>,
}

impl RosterEntry {
    pub fn position(&self) -> Option<Position> {
        match (self.x, self.y) {
            (Some(x), Some(y)) => Some(Position::new(x, y)),
            _ => None,
        }
    }
}
