//! Tilespace client core
//!
//! Real-time proximity communication for a shared tile-grid world: movement,
//! spatial voice, zones and chat over one WebSocket per space.
//!
//! ## Architecture
//!
//! ```text
//! SessionHost  (session.rs)
//!   └── CommunicationSession  (session.rs)   ← wiring + lifecycle
//!         ├── TransportConnection  (transport.rs) ← WebSocket, backoff
//!         ├── MovementEngine       (movement.rs)  ← local steps, remote jumps
//!         ├── ProximityEvaluator   (proximity.rs) ← hysteresis, initiator
//!         ├── SpatialAudioMixer    (audio.rs)     ← per-peer gain, emitters
//!         └── ZoneRouter           (zone.rs)      ← comm mode, chat scope
//!
//! all of the above talk through EventBus (bus.rs)
//! ```
//!
//! The policy modules are synchronous and free of I/O. Only the WebSocket
//! connection needs the `runtime` feature (enabled by default).

pub mod audio;
pub mod bus;
pub mod config;
pub mod movement;
pub mod protocol;
pub mod proximity;
pub mod session;
pub mod transport;
pub mod types;
pub mod zone;

// Convenience re-exports
pub use audio::{AudioConfig, AudioSink, SpatialAudioMixer};
pub use bus::{BusEvent, CommMode, Effects, EventBus, Subscription, SubscriptionSet, Topic};
pub use config::{ClientSettings, ConfigError};
pub use movement::{MovementConfig, MovementEngine, TileGrid, WorldMap, ZoneMap};
pub use protocol::{ChatMessage, ChatScope, Frame, FrameSink, ProtocolError};
pub use proximity::{PeerDecision, PeerState, ProximityConfig, ProximityEvaluator};
pub use session::{CommunicationSession, SessionError, SessionHost, SessionOptions};
pub use transport::{Link, ReconnectPolicy, TransportConfig, TransportError};
#[cfg(feature = "runtime")]
pub use transport::TransportConnection;
pub use types::{ConnectionState, Direction, Position, ZoneKind, ZoneState};
pub use zone::{ChatTarget, MediaBackend, MediaError, NullMedia, RouterConfig, ZoneRouter};
