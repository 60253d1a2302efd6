//! Proximity evaluation – who should be connected to whom.
//!
//! Everything here is pure policy over positions. [`ProximityEvaluator`] keeps
//! the per-peer [`PeerState`] table and turns position changes into
//! [`PeerDecision`]s; it never talks to the network or the media stack.
//!
//! Two independent outputs are produced per peer:
//!
//! * a **hysteresis decision** (`connect_distance` / `disconnect_distance`)
//!   for the heavier peer-to-peer media connection, and
//! * a continuous **proximity fraction** used for audio gain.
//!
//! A peer inside the dead band between the two thresholds keeps whatever
//! state it already had.
//!
//! While suspended (the local player is in a private conference) positions
//! are still tracked but every peer stays Disconnected with zero gain and no
//! actions are issued. [`ProximityEvaluator::resume`] re-evaluates the table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

use crate::types::{ConnectionState, Position};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    /// Strictly closer than this → connect.
    pub connect_distance: f32,
    /// Strictly farther than this → disconnect.
    pub disconnect_distance: f32,
    /// Radius at which the proximity fraction reaches zero.
    pub max_radius: f32,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            connect_distance: 5.0,
            disconnect_distance: 7.0,
            max_radius: 3.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Pure policy
// ---------------------------------------------------------------------------

/// Hysteresis over `distance`, starting from `current`.
pub fn hysteresis(
    current: ConnectionState,
    distance: f32,
    config: &ProximityConfig,
) -> ConnectionState {
    if distance < config.connect_distance {
        ConnectionState::Connected
    } else if distance > config.disconnect_distance {
        ConnectionState::Disconnected
    } else if current.is_engaged() {
        ConnectionState::Connected
    } else {
        ConnectionState::Disconnected
    }
}

/// Exactly one of two peers initiates: the one whose identity sorts higher.
pub fn is_initiator(local_id: &str, remote_id: &str) -> bool {
    local_id > remote_id
}

/// `clamp(1 - d / max_radius, 0, 1)`.
pub fn proximity_fraction(distance: f32, max_radius: f32) -> f32 {
    if max_radius <= 0.0 || !distance.is_finite() {
        return 0.0;
    }
    (1.0 - distance / max_radius).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Peer state
// ---------------------------------------------------------------------------

/// Everything the client knows about one remote participant.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub id: String,
    pub position: Option<Position>,
    pub last_updated: Instant,
    pub connection_state: ConnectionState,
    pub audio_gain: f32,
}

impl PeerState {
    fn new(id: String, position: Option<Position>, now: Instant) -> Self {
        Self {
            id,
            position,
            last_updated: now,
            connection_state: ConnectionState::Disconnected,
            audio_gain: 0.0,
        }
    }
}

/// What should happen to the media connection for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAction {
    Connect { initiator: bool },
    Disconnect,
    Stay,
}

/// Result of evaluating one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerDecision {
    pub peer_id: String,
    /// Euclidean tile distance; infinite when the peer's position is unknown.
    pub distance: f32,
    pub target: ConnectionState,
    /// Peer's connection state after this evaluation.
    pub state: ConnectionState,
    pub fraction: f32,
    pub action: PeerAction,
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Owns the peer table and re-evaluates it whenever a position changes.
#[derive(Debug)]
pub struct ProximityEvaluator {
    config: ProximityConfig,
    local_id: String,
    local_position: Position,
    peers: HashMap<String, PeerState>,
    suspended: bool,
}

impl ProximityEvaluator {
    pub fn new(config: ProximityConfig, local_id: impl Into<String>) -> Self {
        Self {
            config,
            local_id: local_id.into(),
            local_position: Position::default(),
            peers: HashMap::new(),
            suspended: false,
        }
    }

    pub fn config(&self) -> &ProximityConfig {
        &self.config
    }

    pub fn local_position(&self) -> Position {
        self.local_position
    }

    // -----------------------------------------------------------------------
    // Peer lifecycle
    // -----------------------------------------------------------------------

    /// Record a peer seen on the roster without evaluating it.
    pub fn observe(&mut self, peer_id: &str, position: Option<Position>, now: Instant) {
        if peer_id == self.local_id {
            return;
        }
        let entry = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerState::new(peer_id.to_string(), None, now));
        if position.is_some() {
            entry.position = position;
            entry.last_updated = now;
        }
    }

    /// Forget a peer. Returns the final state if it was known.
    pub fn remove(&mut self, peer_id: &str) -> Option<PeerState> {
        self.peers.remove(peer_id)
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerState> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerState> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Media layer confirmation that a peer connection is live.
    pub fn mark_connected(&mut self, peer_id: &str) {
        if let Some(p) = self.peers.get_mut(peer_id) {
            if p.connection_state == ConnectionState::Connecting {
                p.connection_state = ConnectionState::Connected;
            }
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Drop every peer back to Disconnected and hold them there until
    /// [`resume`](Self::resume).
    pub fn disconnect_all(&mut self) {
        for p in self.peers.values_mut() {
            p.connection_state = ConnectionState::Disconnected;
            p.audio_gain = 0.0;
        }
        self.suspended = true;
    }

    /// Lift the suspension and re-evaluate every peer from its last known
    /// position.
    pub fn resume(&mut self) -> Vec<PeerDecision> {
        self.suspended = false;
        let local = self.local_position;
        self.update_local(local)
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// The local player moved: re-evaluate every peer.
    pub fn update_local(&mut self, position: Position) -> Vec<PeerDecision> {
        self.local_position = position;
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();
        ids.iter().filter_map(|id| self.evaluate(id)).collect()
    }

    /// A remote peer moved: create it if needed and re-evaluate it alone.
    pub fn update_remote(
        &mut self,
        peer_id: &str,
        position: Position,
        now: Instant,
    ) -> Option<PeerDecision> {
        self.observe(peer_id, Some(position), now);
        self.evaluate(peer_id)
    }

    fn evaluate(&mut self, peer_id: &str) -> Option<PeerDecision> {
        let config = &self.config;
        let local = self.local_position;
        let local_id = &self.local_id;
        let suspended = self.suspended;
        let peer = self.peers.get_mut(peer_id)?;

        let distance = peer
            .position
            .map(|p| local.distance(&p))
            .unwrap_or(f32::INFINITY);
        if suspended {
            peer.audio_gain = 0.0;
            return Some(PeerDecision {
                peer_id: peer_id.to_string(),
                distance,
                target: ConnectionState::Disconnected,
                state: peer.connection_state,
                fraction: 0.0,
                action: PeerAction::Stay,
            });
        }

        let fraction = proximity_fraction(distance, config.max_radius);
        let target = hysteresis(peer.connection_state, distance, config);

        let action = match (peer.connection_state.is_engaged(), target) {
            (false, ConnectionState::Connected) => {
                peer.connection_state = ConnectionState::Connecting;
                PeerAction::Connect {
                    initiator: is_initiator(local_id, peer_id),
                }
            }
            (true, ConnectionState::Disconnected) => {
                peer.connection_state = ConnectionState::Disconnected;
                PeerAction::Disconnect
            }
            _ => PeerAction::Stay,
        };
        peer.audio_gain = fraction;

        Some(PeerDecision {
            peer_id: peer_id.to_string(),
            distance,
            target,
            state: peer.connection_state,
            fraction,
            action,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
