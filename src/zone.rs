//! Zone & communication router.
//!
//! Owns the communication mode and the current [`ZoneState`]:
//!
//! ```text
//!            zone entered (Private)
//!   Open  ───────────────────────────►  InPrivateZone(zone_id)
//!         ◄───────────────────────────
//!            zone exited / leave_zone
//! ```
//!
//! | Transition        | Media                                              | Input  |
//! |-------------------|----------------------------------------------------|--------|
//! | Open → Private    | token for `video_{zone}`, join, leave proximity    | paused |
//! | Private → Open    | leave conference, token for `audio_{space}`, join  | resumed|
//!
//! Media failures never block a transition. They are published as
//! [`BusEvent::MediaFault`] and the router carries on in degraded mode.
//!
//! Chat scope tagging is the pure function [`tag_chat`]; inbound routing is
//! [`surface_for`].

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

use crate::bus::{BusEvent, ChatSurface, CommMode, DirectMessageEvent, Effects};
use crate::protocol::{ChatMessage, ChatScope, Frame};
use crate::types::{ZoneKind, ZoneState};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Disable world movement input while in a private zone.
    pub pause_input_in_private: bool,
    /// Ephemeral zone messages kept for the zone panel.
    pub zone_chat_limit: usize,
    pub conference_room_prefix: String,
    pub proximity_room_prefix: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            pause_input_in_private: true,
            zone_chat_limit: 20,
            conference_room_prefix: "video_".into(),
            proximity_room_prefix: "audio_".into(),
        }
    }
}

impl RouterConfig {
    pub fn conference_room(&self, zone_id: &str) -> String {
        format!("{}{}", self.conference_room_prefix, zone_id)
    }

    pub fn proximity_room(&self, space_id: &str) -> String {
        format!("{}{}", self.proximity_room_prefix, space_id)
    }
}

// ---------------------------------------------------------------------------
// Media collaborator
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("token request for `{room}` failed: {reason}")]
    Token { room: String, reason: String },
    #[error("joining `{room}` failed: {reason}")]
    Join { room: String, reason: String },
    #[error("leaving `{room}` failed: {reason}")]
    Leave { room: String, reason: String },
    #[error("{device} unavailable: {reason}")]
    Device {
        device: &'static str,
        reason: String,
    },
}

/// Black-box media SDK: token-based room join plus local device toggles.
pub trait MediaBackend: Send {
    fn fetch_token(&mut self, room: &str) -> Result<String, MediaError>;
    fn join_room(&mut self, room: &str, token: &str) -> Result<(), MediaError>;
    fn leave_room(&mut self, room: &str) -> Result<(), MediaError>;
    fn set_microphone(&mut self, enabled: bool) -> Result<(), MediaError>;
    fn set_camera(&mut self, enabled: bool) -> Result<(), MediaError>;
}

/// Backend with no media stack: every call succeeds and nothing plays.
#[derive(Debug, Default)]
pub struct NullMedia;

impl MediaBackend for NullMedia {
    fn fetch_token(&mut self, room: &str) -> Result<String, MediaError> {
        Ok(format!("null:{}", room))
    }

    fn join_room(&mut self, room: &str, _token: &str) -> Result<(), MediaError> {
        log::debug!("[media] join {} (no media stack)", room);
        Ok(())
    }

    fn leave_room(&mut self, room: &str) -> Result<(), MediaError> {
        log::debug!("[media] leave {} (no media stack)", room);
        Ok(())
    }

    fn set_microphone(&mut self, _enabled: bool) -> Result<(), MediaError> {
        Ok(())
    }

    fn set_camera(&mut self, _enabled: bool) -> Result<(), MediaError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Chat scope
// ---------------------------------------------------------------------------

/// Who the user chose to talk to.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatTarget {
    /// A persistent channel; `message_data` is the stored message object.
    Channel {
        channel_id: String,
        message_data: Option<serde_json::Value>,
    },
    /// One specific user.
    Direct { user_id: String },
    /// Whoever is nearby: the current zone, or proximity in the open world.
    Nearby,
    /// The whole space.
    Everyone,
}

/// Build the outbound frame for `text` sent to `target` while in `zone`.
pub fn tag_chat(zone: Option<&ZoneState>, target: &ChatTarget, text: &str) -> Frame {
    match target {
        ChatTarget::Channel {
            channel_id,
            message_data,
        } => {
            let mut msg = ChatMessage::new(ChatScope::Channel, text);
            msg.channel_id = Some(channel_id.clone());
            msg.message_data = message_data.clone();
            Frame::ChatMessage(msg)
        }
        ChatTarget::Direct { user_id } => {
            let mut msg = ChatMessage::new(ChatScope::Direct, text);
            msg.target_id = Some(user_id.clone());
            Frame::ChatMessage(msg)
        }
        ChatTarget::Nearby => match zone {
            Some(z) => {
                let mut msg = ChatMessage::new(ChatScope::Zone, text);
                msg.zone_id = Some(z.id.clone());
                Frame::ChatMessage(msg)
            }
            None => Frame::ProximityChat(ChatMessage::new(ChatScope::Proximity, text)),
        },
        ChatTarget::Everyone => Frame::ChatMessage(ChatMessage::new(ChatScope::Global, text)),
    }
}

/// UI surface an inbound message with `scope` belongs on.
pub fn surface_for(scope: ChatScope) -> ChatSurface {
    match scope {
        ChatScope::Channel => ChatSurface::ChannelFeed,
        ChatScope::Zone => ChatSurface::ZonePanel,
        ChatScope::Direct => ChatSurface::DirectMessages,
        ChatScope::Proximity | ChatScope::Global => ChatSurface::WorldOverlay,
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct ZoneRouter {
    config: RouterConfig,
    space_id: String,
    mode: CommMode,
    zone: Option<ZoneState>,
    media: Box<dyn MediaBackend>,
    /// Media room currently joined, if any.
    room: Option<String>,
    input_paused: bool,
    zone_chat: VecDeque<ChatMessage>,
    /// Last requested device states; re-applied after every join.
    microphone: Option<bool>,
    camera: Option<bool>,
}

impl ZoneRouter {
    pub fn new(config: RouterConfig, space_id: impl Into<String>, media: Box<dyn MediaBackend>) -> Self {
        Self {
            config,
            space_id: space_id.into(),
            mode: CommMode::Open,
            zone: None,
            media,
            room: None,
            input_paused: false,
            zone_chat: VecDeque::new(),
            microphone: None,
            camera: None,
        }
    }

    pub fn mode(&self) -> &CommMode {
        &self.mode
    }

    pub fn zone(&self) -> Option<&ZoneState> {
        self.zone.as_ref()
    }

    pub fn active_room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn zone_chat(&self) -> impl Iterator<Item = &ChatMessage> {
        self.zone_chat.iter()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Join the proximity room for the space.
    pub fn start(&mut self) -> Effects {
        let mut fx = Effects::new();
        let room = self.config.proximity_room(&self.space_id);
        self.join(&room, &mut fx);
        fx
    }

    /// Leave whatever room is joined. No events: listeners are already gone
    /// when the session calls this.
    pub fn stop(&mut self) {
        if let Some(room) = self.room.take() {
            if let Err(e) = self.media.leave_room(&room) {
                log::debug!("[router] leave on shutdown: {}", e);
            }
        }
        self.zone = None;
        self.zone_chat.clear();
        self.mode = CommMode::Open;
    }

    // -----------------------------------------------------------------------
    // Zone transitions
    // -----------------------------------------------------------------------

    pub fn on_zone_entered(&mut self, zone_id: &str, kind: ZoneKind) -> Effects {
        let mut fx = Effects::new();
        if self.zone.as_ref().is_some_and(|z| z.id == zone_id) {
            return fx;
        }
        if let Some(previous) = self.zone.as_ref().map(|z| z.id.clone()) {
            fx.extend(self.on_zone_exited(&previous));
        }

        log::info!("[router] entered {} zone {}", kind_label(kind), zone_id);
        self.zone = Some(ZoneState::new(zone_id, kind));
        self.zone_chat.clear();
        fx.frame(Frame::ZoneEnter {
            zone_id: zone_id.to_string(),
            zone_type: kind,
        });

        if kind == ZoneKind::Private && self.mode == CommMode::Open {
            self.enter_conference(zone_id, &mut fx);
        }
        fx
    }

    pub fn on_zone_exited(&mut self, zone_id: &str) -> Effects {
        let mut fx = Effects::new();
        if !self.zone.as_ref().is_some_and(|z| z.id == zone_id) {
            log::debug!("[router] exit from {} ignored (not current zone)", zone_id);
            return fx;
        }
        log::info!("[router] exited zone {}", zone_id);
        self.zone = None;
        self.zone_chat.clear();
        fx.frame(Frame::ZoneExit {
            zone_id: zone_id.to_string(),
        });

        if matches!(&self.mode, CommMode::InPrivateZone { zone_id: z } if z == zone_id) {
            self.return_to_open(&mut fx);
        }
        fx
    }

    /// Re-send membership for the current zone on a fresh connection. The
    /// media room and mode are left as they are.
    pub fn resync(&self) -> Effects {
        let mut fx = Effects::new();
        if let Some(zone) = &self.zone {
            log::debug!("[router] re-announcing zone {}", zone.id);
            fx.frame(Frame::ZoneEnter {
                zone_id: zone.id.clone(),
                zone_type: zone.kind,
            });
        }
        fx
    }

    /// Explicit "leave room" action from the UI.
    pub fn leave_zone(&mut self) -> Effects {
        match self.zone.as_ref().map(|z| z.id.clone()) {
            Some(id) => self.on_zone_exited(&id),
            None => Effects::new(),
        }
    }

    fn enter_conference(&mut self, zone_id: &str, fx: &mut Effects) {
        let room = self.config.conference_room(zone_id);
        self.join(&room, fx);

        self.mode = CommMode::InPrivateZone {
            zone_id: zone_id.to_string(),
        };
        fx.event(BusEvent::CommModeChanged(self.mode.clone()));
        if self.config.pause_input_in_private {
            self.input_paused = true;
            fx.event(BusEvent::InputFocus { enabled: false });
        }
    }

    fn return_to_open(&mut self, fx: &mut Effects) {
        let room = self.config.proximity_room(&self.space_id);
        self.join(&room, fx);

        self.mode = CommMode::Open;
        fx.event(BusEvent::CommModeChanged(CommMode::Open));
        if self.input_paused {
            self.input_paused = false;
            fx.event(BusEvent::InputFocus { enabled: true });
        }
    }

    /// Leave the current room (if any) and join `room`. The room is recorded
    /// even when joining fails so the next transition still leaves it.
    fn join(&mut self, room: &str, fx: &mut Effects) {
        if let Some(current) = self.room.take() {
            if let Err(e) = self.media.leave_room(&current) {
                media_fault(fx, "leave", e);
            }
        }
        let joined = self
            .media
            .fetch_token(room)
            .and_then(|token| self.media.join_room(room, &token));
        match joined {
            Ok(()) => {
                log::info!("[router] joined media room {}", room);
                self.reapply_devices(fx);
            }
            Err(e) => media_fault(fx, "join", e),
        }
        self.room = Some(room.to_string());
    }

    fn reapply_devices(&mut self, fx: &mut Effects) {
        if let Some(enabled) = self.microphone {
            if let Err(e) = self.media.set_microphone(enabled) {
                media_fault(fx, "microphone", e);
            }
        }
        if let Some(enabled) = self.camera {
            if let Err(e) = self.media.set_camera(enabled) {
                media_fault(fx, "camera", e);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Devices
    // -----------------------------------------------------------------------

    pub fn set_microphone(&mut self, enabled: bool) -> Effects {
        let mut fx = Effects::new();
        self.microphone = Some(enabled);
        if let Err(e) = self.media.set_microphone(enabled) {
            media_fault(&mut fx, "microphone", e);
        }
        fx
    }

    pub fn set_camera(&mut self, enabled: bool) -> Effects {
        let mut fx = Effects::new();
        self.camera = Some(enabled);
        if let Err(e) = self.media.set_camera(enabled) {
            media_fault(&mut fx, "camera", e);
        }
        fx
    }

    // -----------------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------------

    /// Tag and queue an outbound chat message.
    pub fn send_chat(&self, target: &ChatTarget, text: &str) -> Effects {
        let mut fx = Effects::new();
        let text = text.trim();
        if text.is_empty() {
            return fx;
        }
        fx.frame(tag_chat(self.zone.as_ref(), target, text));
        fx
    }

    /// Tell the server a direct message was persisted so the target is
    /// notified.
    pub fn notify_direct_message(&self, target_id: &str, message: &str) -> Effects {
        let mut fx = Effects::new();
        fx.frame(Frame::DmSent {
            target_id: target_id.to_string(),
            message: message.to_string(),
        });
        fx
    }

    /// Route inbound chat, DM and zone-confirmation frames.
    pub fn handle_frame(&mut self, frame: &Frame) -> Effects {
        let mut fx = Effects::new();
        match frame {
            Frame::ChatMessage(msg) => self.route_chat(msg, &mut fx),
            Frame::ProximityChat(msg) => fx.event(BusEvent::Chat {
                surface: ChatSurface::WorldOverlay,
                message: msg.clone(),
            }),
            Frame::DmReceived { message } => {
                fx.event(BusEvent::DirectMessage(DirectMessageEvent::Received(
                    message.clone(),
                )));
            }
            Frame::DmUpdated { message } => {
                fx.event(BusEvent::DirectMessage(DirectMessageEvent::Updated(
                    message.clone(),
                )));
            }
            Frame::DmDeleted { message_id } => {
                fx.event(BusEvent::DirectMessage(DirectMessageEvent::Deleted {
                    message_id: message_id.clone(),
                }));
            }
            Frame::ZoneEntered {
                zone_id, members, ..
            } => match self.zone.as_mut() {
                Some(z) if &z.id == zone_id => {
                    z.members = members.iter().cloned().collect();
                }
                _ => log::debug!("[router] stale zone_entered for {}", zone_id),
            },
            Frame::ZoneExited { zone_id } => {
                if let Some(z) = self.zone.as_mut().filter(|z| &z.id == zone_id) {
                    z.members.clear();
                }
            }
            _ => {}
        }
        fx
    }

    fn route_chat(&mut self, msg: &ChatMessage, fx: &mut Effects) {
        if msg.scope == ChatScope::Zone {
            let current = self.zone.as_ref().map(|z| z.id.as_str());
            if current.is_none() || msg.zone_id.as_deref() != current {
                log::debug!("[router] zone chat for another zone dropped");
                return;
            }
            if self.zone_chat.len() >= self.config.zone_chat_limit {
                self.zone_chat.pop_front();
            }
            self.zone_chat.push_back(msg.clone());
        }
        fx.event(BusEvent::Chat {
            surface: surface_for(msg.scope),
            message: msg.clone(),
        });
    }
}

impl std::fmt::Debug for ZoneRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneRouter")
            .field("space_id", &self.space_id)
            .field("mode", &self.mode)
            .field("zone", &self.zone)
            .field("room", &self.room)
            .finish()
    }
}

fn kind_label(kind: ZoneKind) -> &'static str {
    match kind {
        ZoneKind::Public => "public",
        ZoneKind::Private => "private",
    }
}

fn media_fault(fx: &mut Effects, context: &str, err: MediaError) {
    log::warn!("[router] media {} failed: {}", context, err);
    fx.event(BusEvent::MediaFault {
        context: context.to_string(),
        message: err.to_string(),
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
