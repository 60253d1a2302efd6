//! Transport connection – one persistent WebSocket per active space.
//!
//! ## Lifecycle
//!
//! ```text
//!  connect()          open              close (not caller-initiated)
//!  Closed ──► Opening ────► Open ──────────────────────────► Opening
//!                ▲                                             │
//!                └──────── backoff: min(base·2ⁿ, cap) ─────────┘
//!                          n ≥ max_attempts → ReconnectExhausted, Closed
//! ```
//!
//! The I/O loop runs on a Tokio task and only talks to the rest of the
//! client through the [`EventBus`] (inbound) and an unbounded channel
//! (outbound). [`TransportConnection::send`] never queues while the socket is
//! not open: the frame is dropped with a warning.
//!
//! The pure parts (URL building, backoff policy) are always compiled; the
//! connection itself needs the `runtime` feature.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::form_urlencoded;

use crate::protocol::FrameSink;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint `{0}`: expected http(s):// or ws(s)://")]
    InvalidEndpoint(String),
    #[error("space id must not be empty")]
    EmptySpace,
    #[error("no Tokio runtime available to drive the connection")]
    NoRuntime,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Server base URL, `http(s)://` or `ws(s)://`.
    pub endpoint: String,
    pub reconnect: ReconnectPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000".into(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 10_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect number `attempt` (0-based), or `None` once the
    /// budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Some(Duration::from_millis(ms))
    }

    /// The full schedule for a run of immediate failures.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..).map_while(|n| self.next_delay(n)).collect()
    }
}

/// `{endpoint}/ws/{space_id}?token={token}` with `http(s)` rewritten to
/// `ws(s)` and any trailing slash trimmed. The token is form-encoded.
pub fn connection_url(endpoint: &str, space_id: &str, token: &str) -> Result<String, TransportError> {
    if space_id.is_empty() {
        return Err(TransportError::EmptySpace);
    }
    let trimmed = endpoint.trim().trim_end_matches('/');
    let base = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
    };
    let token: String = form_urlencoded::byte_serialize(token.as_bytes()).collect();
    Ok(format!("{}/ws/{}?token={}", base, space_id, token))
}

/// The connection as seen by a session: open, close, send.
pub trait Link: FrameSink {
    /// Open for `space_id`; a no-op while already open or opening.
    fn open(&self, space_id: &str, token: &str) -> Result<(), TransportError>;
    /// Caller-initiated close. Safe to call repeatedly.
    fn close(&self);
}

#[cfg(feature = "runtime")]
pub use link::{LinkPhase, TransportConnection};

// ---------------------------------------------------------------------------
// Connection (runtime feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "runtime")]
mod link {
    use futures_util::{SinkExt, StreamExt};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpStream;
    use tokio::sync::{mpsc, Notify};
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use super::{connection_url, Link, TransportConfig, TransportError};
    use crate::bus::{BusEvent, EventBus};
    use crate::protocol::{self, Frame, FrameSink};

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LinkPhase {
        Closed,
        Opening,
        Open,
    }

    /// Caller-side stop signal for one run of the I/O loop.
    #[derive(Default)]
    struct Control {
        closing: AtomicBool,
        notify: Notify,
    }

    impl Control {
        fn stop(&self) {
            self.closing.store(true, Ordering::Release);
            self.notify.notify_one();
        }

        fn is_closing(&self) -> bool {
            self.closing.load(Ordering::Acquire)
        }
    }

    struct Slot {
        /// Incremented per `connect`; a finished run only clears the slot
        /// it owns.
        generation: u64,
        phase: LinkPhase,
        space_id: Option<String>,
        outbound: Option<mpsc::UnboundedSender<String>>,
        control: Option<Arc<Control>>,
        task: Option<JoinHandle<()>>,
    }

    struct Shared {
        config: TransportConfig,
        bus: EventBus,
        slot: Mutex<Slot>,
    }

    /// Cheaply clonable handle to the space connection.
    #[derive(Clone)]
    pub struct TransportConnection {
        shared: Arc<Shared>,
    }

    impl TransportConnection {
        pub fn new(config: TransportConfig, bus: EventBus) -> Self {
            Self {
                shared: Arc::new(Shared {
                    config,
                    bus,
                    slot: Mutex::new(Slot {
                        generation: 0,
                        phase: LinkPhase::Closed,
                        space_id: None,
                        outbound: None,
                        control: None,
                        task: None,
                    }),
                }),
            }
        }

        pub fn phase(&self) -> LinkPhase {
            self.shared.slot.lock().phase
        }

        pub fn is_open(&self) -> bool {
            self.phase() == LinkPhase::Open
        }

        pub fn space_id(&self) -> Option<String> {
            self.shared.slot.lock().space_id.clone()
        }

        /// Open the connection for `space_id`. A no-op while already open or
        /// opening.
        pub fn connect(&self, space_id: &str, token: &str) -> Result<(), TransportError> {
            let url = connection_url(&self.shared.config.endpoint, space_id, token)?;
            let runtime =
                tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

            let mut slot = self.shared.slot.lock();
            if slot.phase != LinkPhase::Closed {
                log::debug!("[transport] connect ignored, link already {:?}", slot.phase);
                return Ok(());
            }

            slot.generation += 1;
            let control = Arc::new(Control::default());
            slot.phase = LinkPhase::Opening;
            slot.space_id = Some(space_id.to_string());
            slot.control = Some(control.clone());

            log::info!("[transport] connecting to space {}", space_id);
            let task = runtime.spawn(run_link(
                self.shared.clone(),
                slot.generation,
                control,
                space_id.to_string(),
                url,
            ));
            slot.task = Some(task);
            Ok(())
        }

        /// Caller-initiated close: suppresses auto-reconnect. The running
        /// loop loses the slot, so a handshake finishing late cannot reopen it.
        pub fn disconnect(&self) {
            let mut slot = self.shared.slot.lock();
            slot.generation += 1;
            if let Some(control) = slot.control.take() {
                control.stop();
            }
            slot.outbound = None;
            slot.task = None;
            if slot.phase != LinkPhase::Closed {
                log::info!("[transport] disconnecting");
            }
            slot.phase = LinkPhase::Closed;
        }

        /// Send `frame` if the socket is open; otherwise drop it.
        pub fn send(&self, frame: &Frame) -> bool {
            let outbound = {
                let slot = self.shared.slot.lock();
                if slot.phase != LinkPhase::Open {
                    None
                } else {
                    slot.outbound.clone()
                }
            };
            let Some(tx) = outbound else {
                log::warn!("[transport] not open, dropped `{}` frame", frame.tag());
                return false;
            };
            match protocol::encode(frame) {
                Ok(text) => tx.send(text).is_ok(),
                Err(e) => {
                    log::error!("[transport] {}", e);
                    false
                }
            }
        }
    }

    impl FrameSink for TransportConnection {
        fn send(&self, frame: &Frame) -> bool {
            TransportConnection::send(self, frame)
        }
    }

    impl Link for TransportConnection {
        fn open(&self, space_id: &str, token: &str) -> Result<(), TransportError> {
            self.connect(space_id, token)
        }

        fn close(&self) {
            self.disconnect();
        }
    }

    impl std::fmt::Debug for TransportConnection {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let slot = self.shared.slot.lock();
            f.debug_struct("TransportConnection")
                .field("endpoint", &self.shared.config.endpoint)
                .field("phase", &slot.phase)
                .field("space_id", &slot.space_id)
                .finish()
        }
    }

    // -----------------------------------------------------------------------
    // I/O loop
    // -----------------------------------------------------------------------

    impl Shared {
        /// Update the slot only if `generation` still owns it. Returns
        /// whether the update was applied.
        fn with_slot(&self, generation: u64, f: impl FnOnce(&mut Slot)) -> bool {
            let mut slot = self.slot.lock();
            if slot.generation != generation {
                return false;
            }
            f(&mut slot);
            true
        }
    }

    async fn run_link(
        shared: Arc<Shared>,
        generation: u64,
        control: Arc<Control>,
        space_id: String,
        url: String,
    ) {
        let policy = shared.config.reconnect;
        let bus = shared.bus.clone();
        let mut attempt: u32 = 0;

        loop {
            let opened = tokio::select! {
                r = connect_async(url.as_str()) => Some(r),
                _ = control.notify.notified() => None,
            };
            let Some(opened) = opened else { break };

            match opened {
                Ok((mut socket, _)) => {
                    attempt = 0;
                    let (tx, rx) = mpsc::unbounded_channel();
                    let published = shared.with_slot(generation, |s| {
                        s.phase = LinkPhase::Open;
                        s.outbound = Some(tx);
                    });
                    if !published {
                        log::debug!("[transport] handshake finished after disconnect, closing");
                        if let Err(e) = socket.close(None).await {
                            log::debug!("[transport] close handshake: {}", e);
                        }
                        return;
                    }
                    log::info!("[transport] connected to space {}", space_id);
                    bus.emit(BusEvent::Connected {
                        space_id: space_id.clone(),
                    });

                    let reason = pump(socket, rx, &control, &bus).await;

                    shared.with_slot(generation, |s| {
                        s.outbound = None;
                        if s.phase == LinkPhase::Open {
                            s.phase = LinkPhase::Opening;
                        }
                    });
                    log::info!("[transport] disconnected from {}: {}", space_id, reason);
                    bus.emit(BusEvent::Disconnected {
                        space_id: space_id.clone(),
                        reason,
                    });
                }
                Err(e) if control.is_closing() => {
                    log::debug!("[transport] connect error while closing: {}", e);
                }
                Err(e) => {
                    log::warn!("[transport] connect to {} failed: {}", space_id, e);
                }
            }

            if control.is_closing() {
                break;
            }

            let Some(delay) = policy.next_delay(attempt) else {
                log::error!("[transport] giving up after {} attempts", attempt);
                bus.emit(BusEvent::ReconnectExhausted { attempts: attempt });
                break;
            };
            attempt += 1;
            log::info!(
                "[transport] reconnect {}/{} in {:?}",
                attempt,
                policy.max_attempts,
                delay
            );
            bus.emit(BusEvent::ReconnectScheduled { attempt, delay });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = control.notify.notified() => break,
            }
        }

        shared.with_slot(generation, |s| {
            s.phase = LinkPhase::Closed;
            s.outbound = None;
            s.control = None;
            s.task = None;
        });
    }

    /// Drive one open socket until it closes. Returns the close reason.
    async fn pump(
        socket: Socket,
        mut outbound: mpsc::UnboundedReceiver<String>,
        control: &Control,
        bus: &EventBus,
    ) -> String {
        let (mut write, mut read) = socket.split();

        loop {
            tokio::select! {
                biased;
                _ = control.notify.notified() => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        log::debug!("[transport] close handshake: {}", e);
                    }
                    return "client disconnect".into();
                }
                out = outbound.recv() => {
                    let Some(text) = out else {
                        if control.is_closing() {
                            return "client disconnect".into();
                        }
                        return "outbound channel closed".into();
                    };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        report(control, bus, format!("send failed: {}", e));
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => dispatch(&text, bus),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => dispatch(text, bus),
                        Err(_) => log::debug!("[transport] non-UTF-8 binary frame dropped"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        return frame
                            .map(|f| format!("closed by server ({}): {}", f.code, f.reason))
                            .unwrap_or_else(|| "closed by server".into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        report(control, bus, e.to_string());
                        return e.to_string();
                    }
                    None => return "stream ended".into(),
                }
            }
        }
    }

    fn report(control: &Control, bus: &EventBus, message: String) {
        if control.is_closing() {
            log::debug!("[transport] error while closing: {}", message);
            return;
        }
        log::warn!("[transport] {}", message);
        bus.emit(BusEvent::TransportError { message });
    }

    fn dispatch(text: &str, bus: &EventBus) {
        match protocol::decode(text) {
            Ok(envelope) => bus.emit(BusEvent::Message(envelope.frame)),
            Err(e) => log::warn!("[transport] dropped inbound payload: {}", e),
        }
    }

}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
