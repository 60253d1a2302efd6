//! Event bus – the in-process publish/subscribe hub every component talks
//! through.
//!
//! ## Delivery contract
//!
//! * `emit` runs handlers synchronously on the caller's thread, in the order
//!   they subscribed to that topic.
//! * Handlers may emit further events; the handler list is snapshotted before
//!   dispatch so no lock is held while a handler runs.
//! * `off` is immediate: a subscription removed while an `emit` is in flight
//!   does not fire for the remainder of that dispatch.
//! * There is no per-space isolation. A component that subscribes must keep
//!   its [`Subscription`] handles and remove them when it is torn down.
//!
//! ## Topics
//!
//! | Topic              | Published by       | Typical consumers            |
//! |--------------------|--------------------|------------------------------|
//! | `Connected`        | transport          | session, UI                  |
//! | `Disconnected`     | transport          | session, UI                  |
//! | `TransportError`   | transport          | UI                           |
//! | `Reconnect`        | transport          | UI                           |
//! | `Message`          | transport          | movement, router             |
//! | `LocalPosition`    | movement           | proximity, mixer, UI         |
//! | `RemoteMoved`      | movement           | proximity, mixer             |
//! | `Roster`           | movement           | proximity, UI                |
//! | `Zone`             | movement           | router                       |
//! | `Proximity`        | proximity          | UI                           |
//! | `CommMode`         | router             | mixer, UI                    |
//! | `Chat`             | router             | UI                           |
//! | `MediaFault`       | router, session    | UI                           |
//! | `InputFocus`       | UI, router         | movement                     |

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{ChatMessage, Frame, FrameSink};
use crate::types::{ConnectionState, Direction, Position, RosterEntry, ZoneKind};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// How a remote entity should be brought to its newly reported tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RemoteMotion {
    /// First sighting – place the entity.
    Spawn,
    /// Small displacement – animate at `speed` tiles per second.
    Animate { speed: f32 },
    /// Large displacement – snap instantly.
    Teleport,
}

/// Where an inbound chat message should be displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatSurface {
    ChannelFeed,
    ZonePanel,
    DirectMessages,
    WorldOverlay,
}

/// Direct-message lifecycle notifications relayed from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectMessageEvent {
    Received(serde_json::Value),
    Updated(serde_json::Value),
    Deleted { message_id: String },
}

/// Communication mode currently governing audio/video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommMode {
    /// Proximity audio and world chat.
    Open,
    /// Conference room for a private zone; proximity audio suspended.
    InPrivateZone { zone_id: String },
}

/// Every event carried by the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    // ------------------------------------------------------------------
    // Transport lifecycle
    // ------------------------------------------------------------------
    Connected {
        space_id: String,
    },
    Disconnected {
        space_id: String,
        reason: String,
    },
    TransportError {
        message: String,
    },
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    ReconnectExhausted {
        attempts: u32,
    },
    /// A decoded inbound frame.
    Message(Frame),

    // ------------------------------------------------------------------
    // Movement
    // ------------------------------------------------------------------
    LocalPosition {
        position: Position,
        direction: Direction,
    },
    RemoteMoved {
        peer_id: String,
        position: Position,
        motion: RemoteMotion,
    },
    RemoteRemoved {
        peer_id: String,
    },
    Roster(Vec<RosterEntry>),
    ZoneEntered {
        zone_id: String,
        kind: ZoneKind,
    },
    ZoneExited {
        zone_id: String,
        kind: ZoneKind,
    },

    // ------------------------------------------------------------------
    // Proximity / routing
    // ------------------------------------------------------------------
    ProximityChanged {
        peer_id: String,
        distance: f32,
        in_range: bool,
        state: ConnectionState,
    },
    CommModeChanged(CommMode),
    Chat {
        surface: ChatSurface,
        message: ChatMessage,
    },
    DirectMessage(DirectMessageEvent),
    MediaFault {
        context: String,
        message: String,
    },
    InputFocus {
        enabled: bool,
    },
}

/// Subscription key – one per event family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Connected,
    Disconnected,
    TransportError,
    Reconnect,
    Message,
    LocalPosition,
    RemoteMoved,
    Roster,
    Zone,
    Proximity,
    CommMode,
    Chat,
    MediaFault,
    InputFocus,
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::Connected { .. } => Topic::Connected,
            BusEvent::Disconnected { .. } => Topic::Disconnected,
            BusEvent::TransportError { .. } => Topic::TransportError,
            BusEvent::ReconnectScheduled { .. } | BusEvent::ReconnectExhausted { .. } => {
                Topic::Reconnect
            }
            BusEvent::Message(_) => Topic::Message,
            BusEvent::LocalPosition { .. } => Topic::LocalPosition,
            BusEvent::RemoteMoved { .. } | BusEvent::RemoteRemoved { .. } => Topic::RemoteMoved,
            BusEvent::Roster(_) => Topic::Roster,
            BusEvent::ZoneEntered { .. } | BusEvent::ZoneExited { .. } => Topic::Zone,
            BusEvent::ProximityChanged { .. } => Topic::Proximity,
            BusEvent::CommModeChanged(_) => Topic::CommMode,
            BusEvent::Chat { .. } | BusEvent::DirectMessage(_) => Topic::Chat,
            BusEvent::MediaFault { .. } => Topic::MediaFault,
            BusEvent::InputFocus { .. } => Topic::InputFocus,
        }
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

struct Entry {
    id: u64,
    topic: Topic,
    handler: Handler,
    live: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry>>,
}

/// Cheaply clonable handle to a shared bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

/// Token returned by [`EventBus::on`]; pass it to [`EventBus::off`] to stop
/// delivery. Dropping it does **not** unsubscribe.
#[derive(Debug)]
#[must_use = "keep the subscription so it can be removed on teardown"]
pub struct Subscription {
    id: u64,
    topic: Topic,
    live: Arc<AtomicBool>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn is_active(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every event on `topic`.
    pub fn on<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let live = Arc::new(AtomicBool::new(true));
        self.inner.entries.lock().push(Entry {
            id,
            topic,
            handler: Arc::new(handler),
            live: live.clone(),
        });
        Subscription { id, topic, live }
    }

    /// Remove a subscription. Returns `false` if it was already removed.
    pub fn off(&self, subscription: &Subscription) -> bool {
        if !subscription.live.swap(false, Ordering::AcqRel) {
            return false;
        }
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != subscription.id);
        entries.len() != before
    }

    /// Deliver `event` to every live subscriber of its topic.
    pub fn emit(&self, event: BusEvent) {
        let topic = event.topic();
        let targets: Vec<(Handler, Arc<AtomicBool>)> = {
            let entries = self.inner.entries.lock();
            entries
                .iter()
                .filter(|e| e.topic == topic)
                .map(|e| (e.handler.clone(), e.live.clone()))
                .collect()
        };

        for (handler, live) in targets {
            if live.load(Ordering::Acquire) {
                handler(&event);
            }
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn listener_count(&self, topic: Topic) -> usize {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|e| e.topic == topic)
            .count()
    }

    /// Number of live subscriptions across all topics.
    pub fn total_listeners(&self) -> usize {
        self.inner.entries.lock().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.total_listeners())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Deferred effects
// ---------------------------------------------------------------------------

/// Events and outbound frames produced by a component while its lock was
/// held. The caller dispatches them after releasing the lock.
#[derive(Debug, Default, PartialEq)]
pub struct Effects {
    pub events: Vec<BusEvent>,
    pub frames: Vec<Frame>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event(&mut self, event: BusEvent) {
        self.events.push(event);
    }

    pub fn frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn extend(&mut self, other: Effects) {
        self.events.extend(other.events);
        self.frames.extend(other.frames);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.frames.is_empty()
    }

    /// Send frames first, then publish events.
    pub fn dispatch<S: FrameSink + ?Sized>(self, bus: &EventBus, sink: &S) {
        for frame in &self.frames {
            sink.send(frame);
        }
        for event in self.events {
            bus.emit(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription group
// ---------------------------------------------------------------------------

/// The subscriptions one component registered, removed together.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Remove every subscription from `bus`. Safe to call repeatedly.
    pub fn clear(&mut self, bus: &EventBus) -> usize {
        let removed = self
            .subscriptions
            .drain(..)
            .filter(|s| bus.off(s))
            .count();
        log::debug!("[bus] released {} subscriptions", removed);
        removed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
