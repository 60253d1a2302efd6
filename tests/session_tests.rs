//! CommunicationSession and SessionHost tests

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tilespace::{
        audio::AudioSink,
        bus::{BusEvent, CommMode, EventBus, Topic},
        movement::{MapObject, TileGrid, WorldMap, ZoneMap},
        protocol::{Frame, FrameSink, MoveFrame},
        session::{CommunicationSession, SessionHost, SessionOptions},
        transport::{Link, TransportError},
        types::{ConnectionState, Direction, Position},
        zone::{MediaBackend, MediaError, NullMedia},
    };

    // -----------------------------------------------------------------------
    // Doubles
    // -----------------------------------------------------------------------

    /// Link that records frames and, on close, how many bus listeners were
    /// still registered.
    struct RecordingLink {
        bus: EventBus,
        frames: Mutex<Vec<Frame>>,
        opens: Mutex<Vec<(String, String)>>,
        closes: AtomicUsize,
        listeners_at_close: Mutex<Vec<usize>>,
    }

    impl RecordingLink {
        fn new(bus: &EventBus) -> Arc<Self> {
            Arc::new(Self {
                bus: bus.clone(),
                frames: Mutex::new(Vec::new()),
                opens: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
                listeners_at_close: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Frame> {
            self.frames.lock().clone()
        }
    }

    impl FrameSink for RecordingLink {
        fn send(&self, frame: &Frame) -> bool {
            self.frames.lock().push(frame.clone());
            true
        }
    }

    impl Link for RecordingLink {
        fn open(&self, space_id: &str, token: &str) -> Result<(), TransportError> {
            if space_id.is_empty() {
                return Err(TransportError::EmptySpace);
            }
            self.opens.lock().push((space_id.into(), token.into()));
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.listeners_at_close
                .lock()
                .push(self.bus.total_listeners());
        }
    }

    #[derive(Clone, Default)]
    struct CountingMedia {
        tokens: Arc<Mutex<Vec<String>>>,
    }

    impl MediaBackend for CountingMedia {
        fn fetch_token(&mut self, room: &str) -> Result<String, MediaError> {
            self.tokens.lock().push(room.to_string());
            Ok("t".into())
        }
        fn join_room(&mut self, _room: &str, _token: &str) -> Result<(), MediaError> {
            Ok(())
        }
        fn leave_room(&mut self, _room: &str) -> Result<(), MediaError> {
            Ok(())
        }
        fn set_microphone(&mut self, _enabled: bool) -> Result<(), MediaError> {
            Ok(())
        }
        fn set_camera(&mut self, _enabled: bool) -> Result<(), MediaError> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct VolumeRecorder(Arc<Mutex<Vec<f32>>>);

    impl VolumeRecorder {
        fn last(&self) -> f32 {
            self.0.lock().last().copied().unwrap_or(f32::NAN)
        }
    }

    impl AudioSink for VolumeRecorder {
        fn set_volume(&mut self, volume: f32) {
            self.0.lock().push(volume);
        }
    }

    /// Spawn at (10, 10); `Room1` covers the tiles just east of spawn.
    fn options(local_id: &str) -> SessionOptions {
        let zones = ZoneMap::from_objects(vec![
            MapObject {
                name: "Spawn_main".into(),
                x: 320.0,
                y: 352.0,
                width: 0.0,
                height: 0.0,
            },
            MapObject {
                name: "Room1".into(),
                x: 352.0,
                y: 320.0,
                width: 64.0,
                height: 64.0,
            },
        ]);
        let mut opts = SessionOptions::new("s1", "secret", local_id);
        opts.map = WorldMap {
            grid: TileGrid::open(40, 30),
            zones,
        };
        opts
    }

    fn start(bus: &EventBus, link: &Arc<RecordingLink>) -> CommunicationSession {
        CommunicationSession::start(bus.clone(), link.clone(), Box::new(NullMedia), options("me"))
            .unwrap()
    }

    fn inbound_move(user_id: &str, x: i32, y: i32) -> BusEvent {
        BusEvent::Message(Frame::Move(MoveFrame {
            user_id: Some(user_id.into()),
            x,
            y,
            direction: Direction::Down,
            username: None,
        }))
    }

    fn record(bus: &EventBus, topic: Topic) -> (tilespace::Subscription, Arc<Mutex<Vec<BusEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = bus.on(topic, move |ev| s.lock().push(ev.clone()));
        (sub, seen)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn start_opens_link_with_space_and_token() {
        let bus = EventBus::new();
        let link = RecordingLink::new(&bus);
        let session = start(&bus, &link);
        assert_eq!(
            *link.opens.lock(),
            vec![("s1".to_string(), "secret".to_string())]
        );
        assert!(session.is_active());
        assert_eq!(session.listener_count(), bus.total_listeners());
        assert_eq!(session.position(), Position::new(10, 10));
    }

    #[test]
    fn failed_open_leaves_no_listeners() {
        let bus = EventBus::new();
        let link = RecordingLink::new(&bus);
        let mut opts = options("me");
        opts.space_id = String::new();
        let result = CommunicationSession::start(bus.clone(), link.clone(), Box::new(NullMedia), opts);
        assert!(result.is_err());
        assert_eq!(bus.total_listeners(), 0);
    }

    #[test]
    fn disconnect_twice_is_harmless() {
        let bus = EventBus::new();
        let link = RecordingLink::new(&bus);
        let session = start(&bus, &link);

        session.disconnect();
        session.disconnect();

        assert!(!session.is_active());
        assert_eq!(bus.total_listeners(), 0);
        assert_eq!(link.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listeners_are_removed_before_transport_closes() {
        let bus = EventBus::new();
        let link = RecordingLink::new(&bus);
        let session = start(&bus, &link);
        assert!(bus.total_listeners() > 0);

        session.disconnect();
        assert_eq!(*link.listeners_at_close.lock(), vec![0]);
    }

    #[test]
    fn torn_down_session_ignores_bus_traffic() {
        let bus = EventBus::new();
        let link = RecordingLink::new(&bus);
        let session = start(&bus, &link);
        session.disconnect();

        bus.emit(inbound_move("peer", 11, 10));
        assert!(session.peer("peer").is_none());
        assert!(!session.step(Direction::Up));
    }

    #[test]
    fn drop_disconnects() {
        let bus = EventBus::new();
        let link = RecordingLink::new(&bus);
        drop(start(&bus, &link));
        assert_eq!(bus.total_listeners(), 0);
        assert_eq!(link.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn host_tears_down_previous_session_first() {
        let bus = EventBus::new();
        let host = SessionHost::new(bus.clone());
        let first_link = RecordingLink::new(&bus);
        let first = host
            .create_session(first_link.clone(), Box::new(NullMedia), options("me"))
            .unwrap();
        let per_session = bus.total_listeners();

        let second_link = RecordingLink::new(&bus);
        let second = host
            .create_session(second_link.clone(), Box::new(NullMedia), options("me"))
            .unwrap();

        assert!(!first.is_active());
        assert!(second.is_active());
        assert_eq!(first_link.closes.load(Ordering::SeqCst), 1);
        assert_eq!(*first_link.listeners_at_close.lock(), vec![0]);
        assert_eq!(bus.total_listeners(), per_session);
        assert!(Arc::ptr_eq(&host.current().unwrap(), &second));

        assert!(host.destroy());
        assert!(!host.destroy());
        assert_eq!(bus.total_listeners(), 0);
    }

    // -----------------------------------------------------------------------
    // Wiring
    // -----------------------------------------------------------------------

    #[test]
    fn connected_announces_position_and_requests_roster() {
        let bus = EventBus::new();
        let link = RecordingLink::new(&bus);
        let _session = start(&bus, &link);

        bus.emit(BusEvent::Connected {
            space_id: "s1".into(),
        });
        let sent = link.sent();
        assert!(matches!(&sent[0], Frame::Move(m) if (m.x, m.y) == (10, 10)));
        assert_eq!(sent[1], Frame::RequestUsers);

        // Another space's connection is not ours.
        bus.emit(BusEvent::Connected {
            space_id: "other".into(),
        });
        assert_eq!(link.sent().len(), 2);
    }

    #[test]
    fn nearby_peer_connects_and_gets_proportional_gain() {
        let bus = EventBus::new();
        let link = RecordingLink::new(&bus);
        let (_sub, changes) = record(&bus, Topic::Proximity);
        let session = start(&bus, &link);

        let volume = VolumeRecorder::default();
        session.attach_audio("peer", Box::new(volume.clone()));
        assert_eq!(volume.last(), 0.0);

        bus.emit(inbound_move("peer", 12, 11));

        let peer = session.peer("peer").unwrap();
        assert_eq!(peer.connection_state, ConnectionState::Connecting);
        assert!((peer.audio_gain - 0.2546).abs() < 1e-3);
        assert!((volume.last() - 0.2546).abs() < 1e-3);

        let changes = changes.lock();
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            &changes[0],
            BusEvent::ProximityChanged { peer_id, in_range: true, state: ConnectionState::Connecting, .. }
                if peer_id == "peer"
        ));

        session.peer_connected("peer");
        assert_eq!(
            session.peer("peer").unwrap().connection_state,
            ConnectionState::Connected
        );
    }

    #[test]
    fn local_step_reevaluates_peers() {
        let bus = EventBus::new();
        let link = RecordingLink::new(&bus);
        let session = start(&bus, &link);
        let volume = VolumeRecorder::default();
        session.attach_audio("peer", Box::new(volume.clone()));

        bus.emit(inbound_move("peer", 10, 13));
        assert_eq!(volume.last(), 0.0);

        assert!(session.step(Direction::Down));
        assert!((volume.last() - (1.0 - 2.0 / 3.0)).abs() < 1e-5);
    }

    #[test]
    fn user_left_forgets_peer() {
        let bus = EventBus::new();
        let link = RecordingLink::new(&bus);
        let session = start(&bus, &link);
        session.attach_audio("peer", Box::new(VolumeRecorder::default()));
        bus.emit(inbound_move("peer", 11, 10));
        assert!(session.peer("peer").is_some());

        bus.emit(BusEvent::Message(Frame::UserLeft {
            user_id: "peer".into(),
        }));
        assert!(session.peer("peer").is_none());
        assert!(session.detach_audio("peer").is_none());
    }

    #[test]
    fn entering_private_room_suspends_proximity_audio() {
        let bus = EventBus::new();
        let link = RecordingLink::new(&bus);
        let media = CountingMedia::default();
        let session = CommunicationSession::start(
            bus.clone(),
            link.clone(),
            Box::new(media.clone()),
            options("me"),
        )
        .unwrap();

        let volume = VolumeRecorder::default();
        session.attach_audio("peer", Box::new(volume.clone()));
        bus.emit(inbound_move("peer", 10, 11));
        assert!(volume.last() > 0.0);

        assert!(session.step(Direction::Right));
        session.finish_step();

        assert_eq!(
            session.comm_mode(),
            CommMode::InPrivateZone {
                zone_id: "Room1".into()
            }
        );
        let video_tokens = media
            .tokens
            .lock()
            .iter()
            .filter(|r| r.as_str() == "video_Room1")
            .count();
        assert_eq!(video_tokens, 1);
        assert_eq!(volume.last(), 0.0);
        assert!(session.detach_audio("peer").is_none());
        assert!(link.sent().iter().any(|f| matches!(
            f,
            Frame::ZoneEnter { zone_id, .. } if zone_id == "Room1"
        )));

        // World input is paused while in the room.
        assert!(!session.step(Direction::Right));

        session.leave_zone();
        assert_eq!(session.comm_mode(), CommMode::Open);
        assert_eq!(media.tokens.lock().last().map(String::as_str), Some("audio_s1"));
        assert!(session.step(Direction::Left));
    }

    #[test]
    fn private_room_holds_proximity_until_exit() {
        let bus = EventBus::new();
        let link = RecordingLink::new(&bus);
        let (_sub, changes) = record(&bus, Topic::Proximity);
        let session = start(&bus, &link);

        assert!(session.step(Direction::Right));
        session.finish_step();
        assert!(matches!(session.comm_mode(), CommMode::InPrivateZone { .. }));

        // One tile away, but the conference owns audio.
        bus.emit(inbound_move("peer", 12, 10));
        assert!(changes.lock().is_empty());
        let peer = session.peer("peer").unwrap();
        assert_eq!(peer.connection_state, ConnectionState::Disconnected);
        assert_eq!(peer.audio_gain, 0.0);
        assert_eq!(session.gain_for("peer"), 0.0);

        session.leave_zone();
        let changes = changes.lock();
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            &changes[0],
            BusEvent::ProximityChanged { peer_id, in_range: true, state: ConnectionState::Connecting, .. }
                if peer_id == "peer"
        ));
        assert_eq!(
            session.peer("peer").unwrap().connection_state,
            ConnectionState::Connecting
        );
        assert!(session.gain_for("peer") > 0.6);
    }

    #[test]
    fn reconnect_reannounces_current_zone() {
        let bus = EventBus::new();
        let link = RecordingLink::new(&bus);
        let session = start(&bus, &link);
        let zone_enters = |link: &RecordingLink| {
            link.sent()
                .iter()
                .filter(|f| matches!(f, Frame::ZoneEnter { zone_id, .. } if zone_id == "Room1"))
                .count()
        };

        bus.emit(BusEvent::Connected {
            space_id: "s1".into(),
        });
        assert!(session.step(Direction::Right));
        session.finish_step();
        assert_eq!(zone_enters(&link), 1);

        bus.emit(BusEvent::Disconnected {
            space_id: "s1".into(),
            reason: "server went away".into(),
        });
        bus.emit(BusEvent::Connected {
            space_id: "s1".into(),
        });
        assert_eq!(zone_enters(&link), 2);
        assert!(matches!(session.comm_mode(), CommMode::InPrivateZone { .. }));
    }

    #[test]
    fn ui_focus_disables_steps() {
        let bus = EventBus::new();
        let link = RecordingLink::new(&bus);
        let session = start(&bus, &link);
        session.set_input_enabled(false);
        assert!(!session.step(Direction::Up));
        session.set_input_enabled(true);
        assert!(session.step(Direction::Up));
    }
}
