//! Movement & position engine.
//!
//! The local player moves one tile at a time through a small state machine:
//!
//! ```text
//!   Idle --step(dir)--> Moving --finish_step--> Idle
//!     ^                   |
//!     +---- blocked ------+   (turn only, no position event)
//! ```
//!
//! Local position is authoritative and published on the bus the moment a
//! step starts (client prediction). Outbound `move` frames are throttled:
//! one is sent only when the tile differs from the last *sent* tile and the
//! throttle interval has elapsed.
//!
//! Remote positions arrive as frames and are reconciled against the last
//! known tile of each remote entity. The engine decides *how* the render
//! layer should bring the entity there (spawn, animate or teleport); it never
//! owns peer connection state or zone membership.
//!
//! Every method returns [`Effects`] instead of publishing directly so the
//! caller can drop its lock before dispatch.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::bus::{BusEvent, Effects, RemoteMotion};
use crate::protocol::{Frame, MoveFrame};
use crate::types::{Direction, PixelPosition, Position, RosterEntry, ZoneKind, TILE_PX};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    /// Minimum time between outbound `move` frames.
    pub throttle_interval_ms: u64,
    /// Remote jumps farther than this (tiles) teleport instead of animating.
    pub teleport_threshold: f32,
    /// Animation speed (tiles/s) for remote jumps longer than one tile.
    pub catch_up_speed: f32,
    /// Animation speed (tiles/s) for single-tile remote steps.
    pub walk_speed: f32,
    /// Spawn tile when the map has no `Spawn_main` marker and for peers
    /// whose roster entry has no position.
    pub default_spawn: Position,
    /// Map width in tiles when no map is supplied.
    pub default_width: i32,
    /// Map height in tiles when no map is supplied.
    pub default_height: i32,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            throttle_interval_ms: 50,
            teleport_threshold: 5.0,
            catch_up_speed: 8.0,
            walk_speed: 4.0,
            default_spawn: Position::new(15, 15),
            default_width: 40,
            default_height: 30,
        }
    }
}

impl MovementConfig {
    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Map
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MapError {
    #[error("map is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("collision layer has {actual} tiles, expected {expected}")]
    LayerSize { expected: usize, actual: usize },
}

/// Walkability of every tile. Out-of-bounds tiles are blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    width: i32,
    height: i32,
    blocked: HashSet<Position>,
}

impl TileGrid {
    /// A grid with no obstacles.
    pub fn open(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            blocked: HashSet::new(),
        }
    }

    /// Build from a row-major collision layer; any non-zero tile blocks.
    pub fn from_collision_layer(width: i32, height: i32, data: &[u32]) -> Result<Self, MapError> {
        let expected = (width.max(0) * height.max(0)) as usize;
        if data.len() != expected {
            return Err(MapError::LayerSize {
                expected,
                actual: data.len(),
            });
        }
        let blocked = data
            .iter()
            .enumerate()
            .filter(|(_, t)| **t > 0)
            .map(|(i, _)| Position::new(i as i32 % width, i as i32 / width))
            .collect();
        Ok(Self {
            width,
            height,
            blocked,
        })
    }

    pub fn block(&mut self, tile: Position) {
        self.blocked.insert(tile);
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn in_bounds(&self, tile: Position) -> bool {
        tile.x >= 0 && tile.y >= 0 && tile.x < self.width && tile.y < self.height
    }

    pub fn is_walkable(&self, tile: Position) -> bool {
        self.in_bounds(tile) && !self.blocked.contains(&tile)
    }
}

/// An object from the map's object layer (pixel space).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapObject {
    #[serde(default)]
    pub name: String,
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub width: f32,
    #[serde(default)]
    pub height: f32,
}

/// A named rectangular zone in pixel space.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneRect {
    pub id: String,
    pub kind: ZoneKind,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl ZoneRect {
    /// Whether the centre of `tile` falls inside this rectangle.
    pub fn contains(&self, tile: Position) -> bool {
        let half = TILE_PX as f32 / 2.0;
        let PixelPosition { x, y } = tile.to_pixels();
        let (cx, cy) = (x + half, y + half);
        cx >= self.x && cx < self.x + self.width && cy >= self.y && cy < self.y + self.height
    }
}

/// Boundary signal derived from two consecutive local tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneCrossing {
    Exited { zone_id: String, kind: ZoneKind },
    Entered { zone_id: String, kind: ZoneKind },
}

impl From<ZoneCrossing> for BusEvent {
    fn from(c: ZoneCrossing) -> Self {
        match c {
            ZoneCrossing::Exited { zone_id, kind } => BusEvent::ZoneExited { zone_id, kind },
            ZoneCrossing::Entered { zone_id, kind } => BusEvent::ZoneEntered { zone_id, kind },
        }
    }
}

/// Zones and spawn markers from the map's `Zones` object layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneMap {
    zones: Vec<ZoneRect>,
    spawns: HashMap<String, Position>,
}

impl ZoneMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Objects named `Spawn…` become spawn markers; every other named object
    /// is a zone, Private when named `Room…`.
    pub fn from_objects(objects: impl IntoIterator<Item = MapObject>) -> Self {
        let mut map = Self::new();
        for obj in objects {
            if obj.name.is_empty() {
                continue;
            }
            if obj.name.starts_with("Spawn") {
                let tile = PixelPosition { x: obj.x, y: obj.y }.to_tile();
                map.spawns.insert(obj.name, tile);
            } else {
                map.add(ZoneRect {
                    kind: ZoneKind::from_zone_name(&obj.name),
                    id: obj.name,
                    x: obj.x,
                    y: obj.y,
                    width: obj.width,
                    height: obj.height,
                });
            }
        }
        map
    }

    pub fn add(&mut self, zone: ZoneRect) {
        self.zones.push(zone);
    }

    pub fn zones(&self) -> &[ZoneRect] {
        &self.zones
    }

    /// First zone containing `tile`, in map order.
    pub fn zone_at(&self, tile: Position) -> Option<&ZoneRect> {
        self.zones.iter().find(|z| z.contains(tile))
    }

    /// Local spawn tile: one row above the `Spawn_main` marker.
    pub fn local_spawn(&self) -> Option<Position> {
        self.spawns
            .get("Spawn_main")
            .map(|p| Position::new(p.x, p.y - 1))
    }

    /// Exit/enter signals for a move from `from` to `to`, exit first.
    pub fn crossing(&self, from: Position, to: Position) -> Vec<ZoneCrossing> {
        let before = self.zone_at(from);
        let after = self.zone_at(to);
        if before.map(|z| &z.id) == after.map(|z| &z.id) {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(2);
        if let Some(z) = before {
            out.push(ZoneCrossing::Exited {
                zone_id: z.id.clone(),
                kind: z.kind,
            });
        }
        if let Some(z) = after {
            out.push(ZoneCrossing::Entered {
                zone_id: z.id.clone(),
                kind: z.kind,
            });
        }
        out
    }
}

/// Walkability plus zones: everything the engine needs from the map.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldMap {
    pub grid: TileGrid,
    pub zones: ZoneMap,
}

#[derive(Deserialize)]
struct TiledMap {
    width: i32,
    height: i32,
    #[serde(default)]
    layers: Vec<TiledLayer>,
}

#[derive(Deserialize)]
struct TiledLayer {
    #[serde(default)]
    name: String,
    #[serde(default)]
    data: Option<Vec<u32>>,
    #[serde(default)]
    objects: Option<Vec<MapObject>>,
}

impl WorldMap {
    pub fn open(width: i32, height: i32) -> Self {
        Self {
            grid: TileGrid::open(width, height),
            zones: ZoneMap::new(),
        }
    }

    /// Load from a Tiled JSON export: the `Collision` tile layer and the
    /// `Zones` object layer. Missing layers mean "no obstacles" / "no zones".
    pub fn from_tiled_json(text: &str) -> Result<Self, MapError> {
        let map: TiledMap = serde_json::from_str(text)?;
        let mut grid = TileGrid::open(map.width, map.height);
        let mut zones = ZoneMap::new();
        for layer in map.layers {
            match (layer.name.as_str(), layer.data, layer.objects) {
                ("Collision", Some(data), _) => {
                    grid = TileGrid::from_collision_layer(map.width, map.height, &data)?;
                }
                ("Zones", _, Some(objects)) => zones = ZoneMap::from_objects(objects),
                _ => {}
            }
        }
        log::debug!(
            "[movement] loaded {}x{} map with {} zones",
            map.width,
            map.height,
            zones.zones().len()
        );
        Ok(Self { grid, zones })
    }
}

// ---------------------------------------------------------------------------
// Throttle
// ---------------------------------------------------------------------------

/// Gate for outbound position frames.
#[derive(Debug, Clone)]
pub struct OutboundThrottle {
    interval: Duration,
    last_tile: Option<Position>,
    last_at: Option<Instant>,
}

impl OutboundThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_tile: None,
            last_at: None,
        }
    }

    /// `true` when `tile` differs from the last sent tile and the interval
    /// has elapsed since the last send.
    pub fn ready(&self, tile: Position, now: Instant) -> bool {
        if self.last_tile == Some(tile) {
            return false;
        }
        match self.last_at {
            Some(at) => now.saturating_duration_since(at) >= self.interval,
            None => true,
        }
    }

    pub fn record(&mut self, tile: Position, now: Instant) {
        self.last_tile = Some(tile);
        self.last_at = Some(now);
    }

    /// [`ready`](Self::ready) followed by [`record`](Self::record).
    pub fn try_take(&mut self, tile: Position, now: Instant) -> bool {
        if self.ready(tile, now) {
            self.record(tile, now);
            true
        } else {
            false
        }
    }

    pub fn last_sent(&self) -> Option<Position> {
        self.last_tile
    }

    /// Forget the last send (e.g. after a reconnect).
    pub fn reset(&mut self) {
        self.last_tile = None;
        self.last_at = None;
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovePhase {
    Idle,
    Moving { from: Position },
}

/// How a remote jump of `distance` tiles should be presented.
pub fn classify_remote_jump(distance: f32, config: &MovementConfig) -> RemoteMotion {
    if distance > config.teleport_threshold {
        RemoteMotion::Teleport
    } else if distance > 1.0 {
        RemoteMotion::Animate {
            speed: config.catch_up_speed,
        }
    } else {
        RemoteMotion::Animate {
            speed: config.walk_speed,
        }
    }
}

#[derive(Debug)]
pub struct MovementEngine {
    config: MovementConfig,
    local_id: String,
    username: Option<String>,
    map: WorldMap,
    position: Position,
    direction: Direction,
    phase: MovePhase,
    input_enabled: bool,
    throttle: OutboundThrottle,
    /// Last tile of each spawned remote entity.
    remotes: HashMap<String, Position>,
    /// Server roster, excluding self.
    roster: BTreeMap<String, RosterEntry>,
}

impl MovementEngine {
    pub fn new(
        config: MovementConfig,
        local_id: impl Into<String>,
        username: Option<String>,
        map: WorldMap,
    ) -> Self {
        let position = map.zones.local_spawn().unwrap_or(config.default_spawn);
        let throttle = OutboundThrottle::new(config.throttle_interval());
        Self {
            config,
            local_id: local_id.into(),
            username,
            map,
            position,
            direction: Direction::default(),
            phase: MovePhase::Idle,
            input_enabled: true,
            throttle,
            remotes: HashMap::new(),
            roster: BTreeMap::new(),
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn phase(&self) -> MovePhase {
        self.phase
    }

    pub fn input_enabled(&self) -> bool {
        self.input_enabled
    }

    pub fn map(&self) -> &WorldMap {
        &self.map
    }

    /// Zone the local player currently stands in, derived from the map.
    pub fn current_zone(&self) -> Option<&ZoneRect> {
        self.map.zones.zone_at(self.position)
    }

    pub fn remote_position(&self, peer_id: &str) -> Option<Position> {
        self.remotes.get(peer_id).copied()
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.roster.values().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Local movement
    // -----------------------------------------------------------------------

    pub fn set_input_enabled(&mut self, enabled: bool) {
        if self.input_enabled != enabled {
            log::debug!("[movement] input {}", if enabled { "enabled" } else { "disabled" });
        }
        self.input_enabled = enabled;
    }

    /// Start a one-tile step. Ignored while disabled or mid-step.
    pub fn step(&mut self, direction: Direction, now: Instant) -> Effects {
        let mut fx = Effects::new();
        if !self.input_enabled || matches!(self.phase, MovePhase::Moving { .. }) {
            return fx;
        }

        self.direction = direction;
        let target = self.position.step(direction);
        if !self.map.grid.is_walkable(target) {
            log::trace!("[movement] blocked at {} facing {}", target, direction.as_str());
            return fx;
        }

        let from = self.position;
        self.position = target;
        self.phase = MovePhase::Moving { from };

        fx.event(BusEvent::LocalPosition {
            position: target,
            direction,
        });
        for crossing in self.map.zones.crossing(from, target) {
            fx.event(crossing.into());
        }
        self.try_send(now, &mut fx);
        fx
    }

    /// The step animation finished.
    pub fn finish_step(&mut self, now: Instant) -> Effects {
        let mut fx = Effects::new();
        self.phase = MovePhase::Idle;
        self.try_send(now, &mut fx);
        fx
    }

    /// Periodic update: flush a position the throttle held back.
    pub fn tick(&mut self, now: Instant) -> Effects {
        let mut fx = Effects::new();
        self.try_send(now, &mut fx);
        fx
    }

    /// Publish the current position and zone, and send it unthrottled. Used
    /// on (re)connect.
    pub fn announce(&mut self, now: Instant) -> Effects {
        let mut fx = Effects::new();
        fx.event(BusEvent::LocalPosition {
            position: self.position,
            direction: self.direction,
        });
        if let Some(zone) = self.current_zone() {
            fx.event(BusEvent::ZoneEntered {
                zone_id: zone.id.clone(),
                kind: zone.kind,
            });
        }
        self.force_send(now, &mut fx);
        fx
    }

    fn move_frame(&self) -> Frame {
        Frame::Move(MoveFrame {
            user_id: None,
            x: self.position.x,
            y: self.position.y,
            direction: self.direction,
            username: self.username.clone(),
        })
    }

    fn try_send(&mut self, now: Instant, fx: &mut Effects) {
        if self.throttle.try_take(self.position, now) {
            fx.frame(self.move_frame());
        }
    }

    fn force_send(&mut self, now: Instant, fx: &mut Effects) {
        self.throttle.record(self.position, now);
        fx.frame(self.move_frame());
    }

    // -----------------------------------------------------------------------
    // Remote entities
    // -----------------------------------------------------------------------

    /// Reconcile a reported remote position.
    pub fn apply_remote(&mut self, peer_id: &str, position: Position) -> Effects {
        let mut fx = Effects::new();
        if peer_id == self.local_id {
            return fx;
        }

        let motion = match self.remotes.get(peer_id) {
            None => RemoteMotion::Spawn,
            Some(prev) if *prev == position => return fx,
            Some(prev) => classify_remote_jump(prev.distance(&position), &self.config),
        };
        self.remotes.insert(peer_id.to_string(), position);
        if let Some(entry) = self.roster.get_mut(peer_id) {
            entry.x = Some(position.x);
            entry.y = Some(position.y);
        }

        if motion == RemoteMotion::Teleport {
            log::debug!("[movement] {} teleported to {}", peer_id, position);
        }
        fx.event(BusEvent::RemoteMoved {
            peer_id: peer_id.to_string(),
            position,
            motion,
        });
        fx
    }

    /// Despawn a remote entity and drop it from the roster.
    pub fn remove_remote(&mut self, peer_id: &str) -> Effects {
        let mut fx = Effects::new();
        let known = self.remotes.remove(peer_id).is_some();
        let listed = self.roster.remove(peer_id).is_some();
        if known || listed {
            fx.event(BusEvent::RemoteRemoved {
                peer_id: peer_id.to_string(),
            });
        }
        fx
    }

    /// Emit the cached roster now and ask the server for a fresh one.
    pub fn request_users(&self) -> Effects {
        let mut fx = Effects::new();
        fx.event(BusEvent::Roster(self.roster()));
        fx.frame(Frame::RequestUsers);
        fx
    }

    /// Apply an inbound frame. Frames this engine does not own are ignored.
    pub fn handle_frame(&mut self, frame: &Frame, now: Instant) -> Effects {
        match frame {
            Frame::Move(m) => {
                let Some(peer_id) = m.user_id.as_deref() else {
                    log::debug!("[movement] move frame without user_id dropped");
                    return Effects::new();
                };
                if let Some(name) = &m.username {
                    if let Some(entry) = self.roster.get_mut(peer_id) {
                        entry.username = Some(name.clone());
                    }
                }
                self.apply_remote(peer_id, Position::new(m.x, m.y))
            }
            Frame::UserList { users } => self.replace_roster(users, now),
            Frame::UserJoined(entry) => {
                let mut fx = Effects::new();
                if entry.user_id == self.local_id {
                    return fx;
                }
                let position = entry.position().unwrap_or(self.config.default_spawn);
                self.roster.insert(entry.user_id.clone(), entry.clone());
                log::info!("[movement] {} joined", entry.user_id);
                fx.extend(self.apply_remote(&entry.user_id, position));
                fx.event(BusEvent::Roster(self.roster()));
                fx
            }
            Frame::UserLeft { user_id } => {
                let mut fx = self.remove_remote(user_id);
                if !fx.is_empty() {
                    log::info!("[movement] {} left", user_id);
                    fx.event(BusEvent::Roster(self.roster()));
                }
                fx
            }
            _ => Effects::new(),
        }
    }

    fn replace_roster(&mut self, users: &[RosterEntry], now: Instant) -> Effects {
        let mut fx = Effects::new();
        let listed: HashSet<&str> = users.iter().map(|u| u.user_id.as_str()).collect();

        let stale: Vec<String> = self
            .remotes
            .keys()
            .filter(|id| !listed.contains(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            fx.extend(self.remove_remote(&id));
        }

        self.roster.clear();
        let local_id = self.local_id.clone();
        for entry in users.iter().filter(|u| u.user_id != local_id) {
            self.roster.insert(entry.user_id.clone(), entry.clone());
            let position = entry.position().unwrap_or(self.config.default_spawn);
            fx.extend(self.apply_remote(&entry.user_id, position));
        }
        fx.event(BusEvent::Roster(self.roster()));

        // Newcomers only learn our tile from a move frame.
        self.force_send(now, &mut fx);
        fx
    }

    /// Forget every remote entity (session teardown or reconnect).
    pub fn clear_remotes(&mut self) {
        self.remotes.clear();
        self.roster.clear();
        self.throttle.reset();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_is_blocked() {
        let grid = TileGrid::open(3, 3);
        assert!(grid.is_walkable(Position::new(0, 0)));
        assert!(!grid.is_walkable(Position::new(-1, 0)));
        assert!(!grid.is_walkable(Position::new(3, 2)));
    }

    #[test]
    fn collision_layer_blocks_nonzero() {
        let grid = TileGrid::from_collision_layer(2, 2, &[0, 5, 0, 0]).unwrap();
        assert!(!grid.is_walkable(Position::new(1, 0)));
        assert!(grid.is_walkable(Position::new(0, 1)));
        assert!(TileGrid::from_collision_layer(2, 2, &[0]).is_err());
    }

    #[test]
    fn zone_objects_and_spawn() {
        let zones = ZoneMap::from_objects(vec![
            MapObject {
                name: "Room1".into(),
                x: 64.0,
                y: 64.0,
                width: 96.0,
                height: 64.0,
            },
            MapObject {
                name: "Lobby".into(),
                x: 0.0,
                y: 0.0,
                width: 64.0,
                height: 64.0,
            },
            MapObject {
                name: "Spawn_main".into(),
                x: 320.0,
                y: 160.0,
                width: 0.0,
                height: 0.0,
            },
        ]);
        assert_eq!(zones.zones().len(), 2);
        assert_eq!(zones.zone_at(Position::new(2, 2)).unwrap().kind, ZoneKind::Private);
        assert_eq!(zones.zone_at(Position::new(1, 1)).unwrap().kind, ZoneKind::Public);
        assert!(zones.zone_at(Position::new(9, 9)).is_none());
        assert_eq!(zones.local_spawn(), Some(Position::new(10, 4)));
    }

    #[test]
    fn crossing_exits_before_entering() {
        let zones = ZoneMap::from_objects(vec![
            MapObject {
                name: "Lobby".into(),
                x: 0.0,
                y: 0.0,
                width: 64.0,
                height: 32.0,
            },
            MapObject {
                name: "Room1".into(),
                x: 64.0,
                y: 0.0,
                width: 64.0,
                height: 32.0,
            },
        ]);
        let c = zones.crossing(Position::new(1, 0), Position::new(2, 0));
        assert_eq!(
            c,
            vec![
                ZoneCrossing::Exited {
                    zone_id: "Lobby".into(),
                    kind: ZoneKind::Public
                },
                ZoneCrossing::Entered {
                    zone_id: "Room1".into(),
                    kind: ZoneKind::Private
                },
            ]
        );
        assert!(zones
            .crossing(Position::new(2, 0), Position::new(3, 0))
            .is_empty());
    }

    #[test]
    fn tiled_map_loads_layers() {
        let text = r#"{
            "width": 2, "height": 2,
            "layers": [
                {"name": "Floor", "type": "tilelayer", "data": [1,1,1,1]},
                {"name": "Collision", "type": "tilelayer", "data": [0,0,7,0]},
                {"name": "Zones", "type": "objectgroup", "objects": [
                    {"name": "Room9", "x": 0, "y": 0, "width": 32, "height": 32}
                ]}
            ]
        }"#;
        let map = WorldMap::from_tiled_json(text).unwrap();
        assert!(!map.grid.is_walkable(Position::new(0, 1)));
        assert!(map.grid.is_walkable(Position::new(0, 0)));
        assert_eq!(map.zones.zones()[0].id, "Room9");
    }

    #[test]
    fn throttle_requires_change_and_interval() {
        let t0 = Instant::now();
        let mut th = OutboundThrottle::new(Duration::from_millis(50));
        assert!(th.try_take(Position::new(1, 1), t0));
        assert!(!th.try_take(Position::new(2, 1), t0 + Duration::from_millis(10)));
        assert!(!th.try_take(Position::new(1, 1), t0 + Duration::from_millis(100)));
        assert!(th.try_take(Position::new(2, 1), t0 + Duration::from_millis(60)));
    }

    #[test]
    fn jump_classification_boundary() {
        let c = MovementConfig::default();
        assert_eq!(classify_remote_jump(1.0, &c), RemoteMotion::Animate { speed: 4.0 });
        assert_eq!(classify_remote_jump(2.0, &c), RemoteMotion::Animate { speed: 8.0 });
        assert_eq!(classify_remote_jump(5.0, &c), RemoteMotion::Animate { speed: 8.0 });
        assert_eq!(classify_remote_jump(5.01, &c), RemoteMotion::Teleport);
    }

    #[test]
    fn blocked_step_only_turns() {
        let mut map = WorldMap::open(20, 20);
        map.grid.block(Position::new(15, 14));
        let mut engine = MovementEngine::new(MovementConfig::default(), "me", None, map);
        let fx = engine.step(Direction::Up, Instant::now());
        assert!(fx.is_empty());
        assert_eq!(engine.direction(), Direction::Up);
        assert_eq!(engine.position(), Position::new(15, 15));
        assert_eq!(engine.phase(), MovePhase::Idle);
    }

    #[test]
    fn step_ignored_while_moving_or_disabled() {
        let mut engine =
            MovementEngine::new(MovementConfig::default(), "me", None, WorldMap::open(40, 30));
        let now = Instant::now();
        assert!(!engine.step(Direction::Right, now).is_empty());
        assert!(engine.step(Direction::Right, now).is_empty());
        engine.finish_step(now);

        engine.set_input_enabled(false);
        assert!(engine.step(Direction::Right, now).is_empty());
        assert_eq!(engine.position(), Position::new(16, 15));
    }
}
