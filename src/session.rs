//! Communication session – one per active space.
//!
//! The session owns the movement engine, proximity evaluator, audio mixer
//! and zone router, and wires them together through the [`EventBus`]:
//!
//! | Topic           | Handler                                                 |
//! |-----------------|---------------------------------------------------------|
//! | `Connected`     | re-send zone, announce local position, request roster   |
//! | `Message`       | movement + router frame handling                        |
//! | `LocalPosition` | re-evaluate every peer, move the audio listener         |
//! | `RemoteMoved`   | re-evaluate one peer / forget a removed one             |
//! | `Roster`        | register listed peers with the evaluator                |
//! | `Zone`          | router zone transitions                                 |
//! | `CommMode`      | suspend or resume proximity audio                       |
//! | `InputFocus`    | enable or disable movement input                        |
//!
//! Every handler takes a component lock only for the state update and
//! dispatches the resulting [`Effects`] after releasing it.
//!
//! [`CommunicationSession::disconnect`] removes every listener *before*
//! closing the transport and leaving media, so no callback can observe a
//! torn-down session. [`SessionHost`] guarantees at most one live session.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::audio::{AudioSink, SpatialAudioMixer};
use crate::bus::{BusEvent, CommMode, Effects, EventBus, SubscriptionSet, Topic};
use crate::config::ClientSettings;
use crate::movement::{MovementEngine, WorldMap};
use crate::proximity::{PeerAction, PeerDecision, PeerState, ProximityEvaluator};
use crate::transport::{Link, TransportError};
use crate::types::{ConnectionState, Direction, Position, RosterEntry, ZoneState};
use crate::zone::{ChatTarget, MediaBackend, ZoneRouter};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

/// Everything needed to enter a space.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub space_id: String,
    pub token: String,
    pub local_id: String,
    pub username: Option<String>,
    pub settings: ClientSettings,
    pub map: WorldMap,
}

impl SessionOptions {
    pub fn new(space_id: impl Into<String>, token: impl Into<String>, local_id: impl Into<String>) -> Self {
        let settings = ClientSettings::default();
        let map = WorldMap::open(
            settings.movement.default_width,
            settings.movement.default_height,
        );
        Self {
            space_id: space_id.into(),
            token: token.into(),
            local_id: local_id.into(),
            username: None,
            settings,
            map,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared component state
// ---------------------------------------------------------------------------

struct Core {
    space_id: String,
    bus: EventBus,
    link: Arc<dyn Link>,
    movement: Mutex<MovementEngine>,
    proximity: Mutex<ProximityEvaluator>,
    mixer: Mutex<SpatialAudioMixer>,
    router: Mutex<ZoneRouter>,
}

impl Core {
    fn dispatch(&self, fx: Effects) {
        fx.dispatch(&self.bus, self.link.as_ref());
    }

    /// Push evaluator output into the mixer and publish transitions.
    fn apply_decisions(&self, decisions: Vec<PeerDecision>) {
        {
            let mut mixer = self.mixer.lock();
            for d in &decisions {
                let distance = d.distance.is_finite().then_some(d.distance);
                mixer.set_distance(&d.peer_id, distance);
            }
        }
        for d in decisions {
            if d.action == PeerAction::Stay {
                continue;
            }
            log::debug!(
                "[session] {} at {:.2} tiles -> {:?}",
                d.peer_id,
                d.distance,
                d.action
            );
            self.bus.emit(BusEvent::ProximityChanged {
                peer_id: d.peer_id,
                distance: d.distance,
                in_range: d.target == ConnectionState::Connected,
                state: d.state,
            });
        }
    }

    fn on_local_position(&self, position: Position) {
        let decisions = self.proximity.lock().update_local(position);
        self.mixer.lock().update_listener(position);
        self.apply_decisions(decisions);
    }

    fn on_comm_mode(&self, mode: &CommMode) {
        match mode {
            CommMode::InPrivateZone { .. } => {
                self.proximity.lock().disconnect_all();
                self.mixer.lock().disconnect_all();
            }
            CommMode::Open => {
                self.mixer.lock().resume();
                let decisions = self.proximity.lock().resume();
                self.apply_decisions(decisions);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct CommunicationSession {
    core: Arc<Core>,
    subscriptions: Mutex<SubscriptionSet>,
    active: AtomicBool,
}

impl CommunicationSession {
    /// Build the components, wire the bus, join the proximity room and open
    /// the transport.
    pub fn start(
        bus: EventBus,
        link: Arc<dyn Link>,
        media: Box<dyn MediaBackend>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let SessionOptions {
            space_id,
            token,
            local_id,
            username,
            settings,
            map,
        } = options;

        let movement = MovementEngine::new(settings.movement, local_id.clone(), username, map);
        let spawn = movement.position();
        let mut proximity = ProximityEvaluator::new(settings.proximity, local_id.clone());
        proximity.update_local(spawn);
        let mut mixer = SpatialAudioMixer::new(settings.audio);
        mixer.update_listener(spawn);
        let router = ZoneRouter::new(settings.router, space_id.clone(), media);

        let core = Arc::new(Core {
            space_id: space_id.clone(),
            bus: bus.clone(),
            link,
            movement: Mutex::new(movement),
            proximity: Mutex::new(proximity),
            mixer: Mutex::new(mixer),
            router: Mutex::new(router),
        });

        let session = Self {
            subscriptions: Mutex::new(wire(&core)),
            core,
            active: AtomicBool::new(true),
        };

        log::info!(
            "[session] starting space {} as {} at {}",
            space_id,
            local_id,
            spawn
        );
        let fx = session.core.router.lock().start();
        session.core.dispatch(fx);

        if let Err(e) = session.core.link.open(&space_id, &token) {
            session.disconnect();
            return Err(e.into());
        }
        Ok(session)
    }

    pub fn space_id(&self) -> &str {
        &self.core.space_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.core.bus
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Remove listeners, then close the transport, then leave media.
    /// Safe to call any number of times.
    pub fn disconnect(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            log::debug!("[session] {} already disconnected", self.core.space_id);
            return;
        }
        let removed = self.subscriptions.lock().clear(&self.core.bus);
        self.core.link.close();
        self.core.router.lock().stop();
        self.core.mixer.lock().disconnect_all();
        self.core.proximity.lock().clear();
        self.core.movement.lock().clear_remotes();
        log::info!(
            "[session] left space {} ({} listeners removed)",
            self.core.space_id,
            removed
        );
    }

    // -----------------------------------------------------------------------
    // Local input
    // -----------------------------------------------------------------------

    pub fn step(&self, direction: Direction) -> bool {
        if !self.is_active() {
            return false;
        }
        let fx = self.core.movement.lock().step(direction, Instant::now());
        let moved = !fx.is_empty();
        self.core.dispatch(fx);
        moved
    }

    pub fn finish_step(&self) {
        if !self.is_active() {
            return;
        }
        let fx = self.core.movement.lock().finish_step(Instant::now());
        self.core.dispatch(fx);
    }

    /// Render-loop tick.
    pub fn tick(&self) {
        if !self.is_active() {
            return;
        }
        let fx = self.core.movement.lock().tick(Instant::now());
        self.core.dispatch(fx);
    }

    /// UI focus: text inputs take the keyboard away from the world.
    pub fn set_input_enabled(&self, enabled: bool) {
        self.core.bus.emit(BusEvent::InputFocus { enabled });
    }

    pub fn send_chat(&self, target: &ChatTarget, text: &str) {
        let fx = self.core.router.lock().send_chat(target, text);
        self.core.dispatch(fx);
    }

    pub fn notify_direct_message(&self, target_id: &str, message: &str) {
        let fx = self
            .core
            .router
            .lock()
            .notify_direct_message(target_id, message);
        self.core.dispatch(fx);
    }

    pub fn leave_zone(&self) {
        let fx = self.core.router.lock().leave_zone();
        self.core.dispatch(fx);
    }

    pub fn request_users(&self) {
        let fx = self.core.movement.lock().request_users();
        self.core.dispatch(fx);
    }

    pub fn set_microphone(&self, enabled: bool) {
        let fx = self.core.router.lock().set_microphone(enabled);
        self.core.dispatch(fx);
    }

    pub fn set_camera(&self, enabled: bool) {
        let fx = self.core.router.lock().set_camera(enabled);
        self.core.dispatch(fx);
    }

    // -----------------------------------------------------------------------
    // Media hooks
    // -----------------------------------------------------------------------

    /// A remote audio track was subscribed.
    pub fn attach_audio(&self, peer_id: &str, sink: Box<dyn AudioSink>) {
        self.core.mixer.lock().attach(peer_id, sink);
    }

    /// A remote audio track was unsubscribed.
    pub fn detach_audio(&self, peer_id: &str) -> Option<Box<dyn AudioSink>> {
        self.core.mixer.lock().detach(peer_id)
    }

    pub fn attach_emitter(&self, name: &str, sink: Box<dyn AudioSink>) -> bool {
        self.core.mixer.lock().attach_emitter(name, sink)
    }

    /// The media layer established the peer connection it was asked for.
    pub fn peer_connected(&self, peer_id: &str) {
        self.core.proximity.lock().mark_connected(peer_id);
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub fn position(&self) -> Position {
        self.core.movement.lock().position()
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.core.movement.lock().roster()
    }

    pub fn comm_mode(&self) -> CommMode {
        self.core.router.lock().mode().clone()
    }

    pub fn zone(&self) -> Option<ZoneState> {
        self.core.router.lock().zone().cloned()
    }

    pub fn peer(&self, peer_id: &str) -> Option<PeerState> {
        self.core.proximity.lock().peer(peer_id).cloned()
    }

    pub fn peers(&self) -> Vec<PeerState> {
        let mut peers: Vec<PeerState> = self.core.proximity.lock().peers().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn gain_for(&self, peer_id: &str) -> f32 {
        self.core.mixer.lock().gain_for(peer_id)
    }

    pub fn listener_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

impl Drop for CommunicationSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for CommunicationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicationSession")
            .field("space_id", &self.core.space_id)
            .field("active", &self.is_active())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn wire(core: &Arc<Core>) -> SubscriptionSet {
    let bus = &core.bus;
    let mut subs = SubscriptionSet::new();

    let c = core.clone();
    subs.push(bus.on(Topic::Connected, move |ev| {
        let BusEvent::Connected { space_id } = ev else { return };
        if *space_id != c.space_id {
            return;
        }
        // Router first: the announce below re-emits ZoneEntered, which the
        // router ignores for a zone it already holds.
        let fx = c.router.lock().resync();
        c.dispatch(fx);
        let fx = {
            let mut movement = c.movement.lock();
            let mut fx = movement.announce(Instant::now());
            fx.extend(movement.request_users());
            fx
        };
        c.dispatch(fx);
    }));

    let c = core.clone();
    subs.push(bus.on(Topic::Message, move |ev| {
        let BusEvent::Message(frame) = ev else { return };
        let fx = c.movement.lock().handle_frame(frame, Instant::now());
        c.dispatch(fx);
        let fx = c.router.lock().handle_frame(frame);
        c.dispatch(fx);
    }));

    let c = core.clone();
    subs.push(bus.on(Topic::LocalPosition, move |ev| {
        if let BusEvent::LocalPosition { position, .. } = ev {
            c.on_local_position(*position);
        }
    }));

    let c = core.clone();
    subs.push(bus.on(Topic::RemoteMoved, move |ev| match ev {
        BusEvent::RemoteMoved {
            peer_id, position, ..
        } => {
            let decision = c
                .proximity
                .lock()
                .update_remote(peer_id, *position, Instant::now());
            c.apply_decisions(decision.into_iter().collect());
        }
        BusEvent::RemoteRemoved { peer_id } => {
            c.proximity.lock().remove(peer_id);
            c.mixer.lock().forget(peer_id);
        }
        _ => {}
    }));

    let c = core.clone();
    subs.push(bus.on(Topic::Roster, move |ev| {
        let BusEvent::Roster(entries) = ev else { return };
        let now = Instant::now();
        let mut proximity = c.proximity.lock();
        for entry in entries {
            proximity.observe(&entry.user_id, entry.position(), now);
        }
    }));

    let c = core.clone();
    subs.push(bus.on(Topic::Zone, move |ev| {
        let fx = match ev {
            BusEvent::ZoneEntered { zone_id, kind } => {
                c.router.lock().on_zone_entered(zone_id, *kind)
            }
            BusEvent::ZoneExited { zone_id, .. } => c.router.lock().on_zone_exited(zone_id),
            _ => return,
        };
        c.dispatch(fx);
    }));

    let c = core.clone();
    subs.push(bus.on(Topic::CommMode, move |ev| {
        if let BusEvent::CommModeChanged(mode) = ev {
            c.on_comm_mode(mode);
        }
    }));

    let c = core.clone();
    subs.push(bus.on(Topic::InputFocus, move |ev| {
        if let BusEvent::InputFocus { enabled } = ev {
            c.movement.lock().set_input_enabled(*enabled);
        }
    }));

    subs
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Holds the single live session. Creating a new one tears down the old one
/// first.
#[derive(Debug, Default)]
pub struct SessionHost {
    bus: EventBus,
    current: Mutex<Option<Arc<CommunicationSession>>>,
}

impl SessionHost {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            current: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn create_session(
        &self,
        link: Arc<dyn Link>,
        media: Box<dyn MediaBackend>,
        options: SessionOptions,
    ) -> Result<Arc<CommunicationSession>, SessionError> {
        let mut current = self.current.lock();
        if let Some(previous) = current.take() {
            log::info!("[session] replacing session for {}", previous.space_id());
            previous.disconnect();
        }
        let session = Arc::new(CommunicationSession::start(
            self.bus.clone(),
            link,
            media,
            options,
        )?);
        *current = Some(session.clone());
        Ok(session)
    }

    pub fn current(&self) -> Option<Arc<CommunicationSession>> {
        self.current.lock().clone()
    }

    /// Tear down the live session, if any.
    pub fn destroy(&self) -> bool {
        match self.current.lock().take() {
            Some(session) => {
                session.disconnect();
                true
            }
            None => false,
        }
    }
}
