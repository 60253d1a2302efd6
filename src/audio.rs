//! Spatial audio mixing.
//!
//! Two models live here:
//!
//! * **Peer voice** – a linear rolloff on tile distance, applied as a volume
//!   on the peer's attached sink. Streams are never (un)subscribed for
//!   distance reasons; a sink is attached when the media layer subscribes a
//!   track and detached when it unsubscribes. Position data may arrive before
//!   or after the sink, so a peer with no known distance plays at gain 0.
//! * **Fixed emitters** – stationary in-world sources (the lobby speaker)
//!   rendered binaurally from a top-down listener.
//!
//! All math is pure. The only side effect in this module is the final
//! [`AudioSink`] assignment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::Position;

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Playback endpoint owned by the media SDK (one per subscribed track).
pub trait AudioSink: Send {
    /// Set playback volume in `[0, 1]`.
    fn set_volume(&mut self, volume: f32);

    /// Stereo pan in `[-1, 1]`; peers are mono so the default ignores it.
    fn set_pan(&mut self, _pan: f32) {}
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Peers farther than this many tiles are silent.
    pub max_hear_radius: f32,
    /// Fixed emitters placed on the map.
    pub emitters: Vec<EmitterConfig>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            max_hear_radius: 3.0,
            emitters: vec![EmitterConfig::default()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    pub name: String,
    pub tile: Position,
    /// Distance (tiles) below which the emitter plays at full gain.
    pub ref_distance: f32,
    /// Distance (tiles) beyond which the emitter is silent.
    pub max_distance: f32,
    pub rolloff: f32,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            name: "speaker".into(),
            tile: Position::new(20, 15),
            ref_distance: 1.0,
            max_distance: 10.0,
            rolloff: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Peer gain
// ---------------------------------------------------------------------------

/// Linear rolloff: 1 at distance 0, 0 at `max_hear_radius` and beyond.
pub fn linear_gain(distance: f32, max_hear_radius: f32) -> f32 {
    if max_hear_radius <= 0.0 || !(distance <= max_hear_radius) {
        return 0.0;
    }
    (1.0 - distance / max_hear_radius).max(0.0)
}

// ---------------------------------------------------------------------------
// Binaural model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Map a tile onto the audio plane: map x → x, map y → z, height 0.
    pub fn from_tile(p: Position) -> Self {
        Self::new(p.x as f32, 0.0, p.y as f32)
    }

    pub fn sub(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }

    pub fn dot(self, o: Vec3) -> f32 {
        self.x * o.x + self.y * o.y + self.z * o.z
    }

    pub fn cross(self, o: Vec3) -> Vec3 {
        Vec3::new(
            self.y * o.z - self.z * o.y,
            self.z * o.x - self.x * o.z,
            self.x * o.y - self.y * o.x,
        )
    }

    pub fn length(self) -> f32 {
        self.dot(self).sqrt()
    }
}

/// Top-down listener. Orientation never changes; only position follows the
/// local player.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Listener {
    pub position: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            position: Vec3::default(),
            // Screen-up is -z, out of the screen is +y.
            forward: Vec3::new(0.0, 0.0, -1.0),
            up: Vec3::new(0.0, 1.0, 0.0),
        }
    }
}

impl Listener {
    pub fn right(&self) -> Vec3 {
        self.forward.cross(self.up)
    }
}

/// Rendering parameters for one emitter relative to the listener.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmitterParams {
    pub distance: f32,
    pub gain: f32,
    pub pan: f32,
}

/// Linear distance model with a hard cut beyond `max_distance`.
pub fn linear_distance_gain(distance: f32, emitter: &EmitterConfig) -> f32 {
    if !(distance <= emitter.max_distance) {
        return 0.0;
    }
    let span = emitter.max_distance - emitter.ref_distance;
    if span <= 0.0 {
        return 1.0;
    }
    let d = distance.clamp(emitter.ref_distance, emitter.max_distance);
    (1.0 - emitter.rolloff * (d - emitter.ref_distance) / span).clamp(0.0, 1.0)
}

/// Gain and pan for an omnidirectional emitter heard from `listener`.
pub fn emitter_params(listener: &Listener, emitter: &EmitterConfig) -> EmitterParams {
    let rel = Vec3::from_tile(emitter.tile).sub(listener.position);
    let distance = rel.length();
    let pan = if distance > f32::EPSILON {
        (rel.dot(listener.right()) / distance).clamp(-1.0, 1.0)
    } else {
        0.0
    };
    EmitterParams {
        distance,
        gain: linear_distance_gain(distance, emitter),
        pan,
    }
}

// ---------------------------------------------------------------------------
// Mixer
// ---------------------------------------------------------------------------

struct Emitter {
    config: EmitterConfig,
    sink: Option<Box<dyn AudioSink>>,
}

/// Holds the attached sinks and applies gains to them.
pub struct SpatialAudioMixer {
    config: AudioConfig,
    listener: Listener,
    peer_sinks: HashMap<String, Box<dyn AudioSink>>,
    /// Latest distance per peer; absent means unknown.
    distances: HashMap<String, f32>,
    emitters: Vec<Emitter>,
    suspended: bool,
}

impl SpatialAudioMixer {
    pub fn new(config: AudioConfig) -> Self {
        let emitters = config
            .emitters
            .iter()
            .cloned()
            .map(|config| Emitter { config, sink: None })
            .collect();
        Self {
            config,
            listener: Listener::default(),
            peer_sinks: HashMap::new(),
            distances: HashMap::new(),
            emitters,
            suspended: false,
        }
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Current gain for `peer_id` (0 when unknown or suspended).
    pub fn gain_for(&self, peer_id: &str) -> f32 {
        if self.suspended {
            return 0.0;
        }
        self.distances
            .get(peer_id)
            .map(|d| linear_gain(*d, self.config.max_hear_radius))
            .unwrap_or(0.0)
    }

    // -----------------------------------------------------------------------
    // Peer sinks
    // -----------------------------------------------------------------------

    /// A remote audio track was subscribed.
    pub fn attach(&mut self, peer_id: &str, mut sink: Box<dyn AudioSink>) {
        sink.set_volume(self.gain_for(peer_id));
        if self.peer_sinks.insert(peer_id.to_string(), sink).is_some() {
            log::debug!("[audio] replaced sink for {}", peer_id);
        }
    }

    /// A remote audio track was unsubscribed.
    pub fn detach(&mut self, peer_id: &str) -> Option<Box<dyn AudioSink>> {
        self.peer_sinks.remove(peer_id)
    }

    pub fn attached_count(&self) -> usize {
        self.peer_sinks.len()
    }

    pub fn is_attached(&self, peer_id: &str) -> bool {
        self.peer_sinks.contains_key(peer_id)
    }

    /// New distance for a peer (`None` = position unknown). Returns the gain
    /// that was applied.
    pub fn set_distance(&mut self, peer_id: &str, distance: Option<f32>) -> f32 {
        match distance {
            Some(d) => {
                self.distances.insert(peer_id.to_string(), d);
            }
            None => {
                self.distances.remove(peer_id);
            }
        }
        let gain = self.gain_for(peer_id);
        if let Some(sink) = self.peer_sinks.get_mut(peer_id) {
            sink.set_volume(gain);
        }
        gain
    }

    /// Forget a peer entirely: silence and release its sink.
    pub fn forget(&mut self, peer_id: &str) {
        self.distances.remove(peer_id);
        if let Some(mut sink) = self.peer_sinks.remove(peer_id) {
            sink.set_volume(0.0);
        }
    }

    /// Silence and release every peer sink; stays silent until [`resume`].
    ///
    /// [`resume`]: SpatialAudioMixer::resume
    pub fn disconnect_all(&mut self) {
        for (_, mut sink) in self.peer_sinks.drain() {
            sink.set_volume(0.0);
        }
        for e in &mut self.emitters {
            if let Some(sink) = e.sink.as_mut() {
                sink.set_volume(0.0);
            }
        }
        self.suspended = true;
        log::info!("[audio] proximity audio suspended");
    }

    pub fn resume(&mut self) {
        if !self.suspended {
            return;
        }
        self.suspended = false;
        self.refresh_emitters();
        log::info!("[audio] proximity audio resumed");
    }

    // -----------------------------------------------------------------------
    // Emitters
    // -----------------------------------------------------------------------

    /// Attach the playback sink for a configured emitter. Returns `false` if
    /// no emitter has that name.
    pub fn attach_emitter(&mut self, name: &str, sink: Box<dyn AudioSink>) -> bool {
        let Some(idx) = self.emitters.iter().position(|e| e.config.name == name) else {
            return false;
        };
        self.emitters[idx].sink = Some(sink);
        self.refresh_emitters();
        true
    }

    /// Move the listener to the local player's tile.
    pub fn update_listener(&mut self, position: Position) {
        self.listener.position = Vec3::from_tile(position);
        self.refresh_emitters();
    }

    pub fn emitter_params(&self, name: &str) -> Option<EmitterParams> {
        self.emitters
            .iter()
            .find(|e| e.config.name == name)
            .map(|e| emitter_params(&self.listener, &e.config))
    }

    fn refresh_emitters(&mut self) {
        let listener = self.listener;
        let suspended = self.suspended;
        for e in &mut self.emitters {
            let Some(sink) = e.sink.as_mut() else {
                continue;
            };
            let params = emitter_params(&listener, &e.config);
            sink.set_volume(if suspended { 0.0 } else { params.gain });
            sink.set_pan(params.pan);
        }
    }
}

impl std::fmt::Debug for SpatialAudioMixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialAudioMixer")
            .field("attached", &self.peer_sinks.len())
            .field("known_distances", &self.distances.len())
            .field("suspended", &self.suspended)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
