//! Transport connection: one negotiated, ordered channel to exactly one peer
//!
//! A `TransportConnection` owns its [`PeerSession`] and a small pump task that
//! applies the backend's state transitions before forwarding everything to the
//! mesh manager as [`PeerEvent`]s tagged with the peer id. Negotiation failures
//! are reported as `Error` events, never returned to the caller.

use super::abstraction::{
    ConnectionState, IceCandidate, PeerSession, SessionDescription, SessionFactory, SessionRole,
    SessionSignal, TransportError,
};
use crate::message::{encode_envelope, Envelope};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Events a connection reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Local offer/answer to relay to the peer through signaling
    LocalDescription(SessionDescription),
    /// Local ICE candidate to relay to the peer through signaling
    IceCandidate(IceCandidate),
    StateChanged(ConnectionState),
    /// Raw text frame received from the peer
    Message(String),
    Error(String),
    /// `close()` was called
    Closed,
}

/// A connection event tagged with the peer it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub peer_id: String,
    pub event: ConnectionEvent,
}

/// Throughput and latency counters for an open connection
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub round_trip_time_ms: Option<f64>,
}

/// State shared between the connection and its pump task
#[derive(Debug)]
struct ConnectionShared {
    state: RwLock<ConnectionState>,
    ready: AtomicBool,
    closed: AtomicBool,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl ConnectionShared {
    fn new() -> Self {
        Self {
            state: RwLock::new(ConnectionState::New),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Apply a transition; returns false when nothing changed or the
    /// connection was already closed locally
    fn transition(&self, next: ConnectionState) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut state = self.state.write();
        if *state == next {
            return false;
        }
        *state = next;
        self.ready
            .store(next == ConnectionState::Connected, Ordering::SeqCst);
        true
    }
}

/// One peer-to-peer channel, negotiated through offer/answer/ICE.
pub struct TransportConnection {
    peer_id: String,
    role: SessionRole,
    session: Arc<dyn PeerSession>,
    shared: Arc<ConnectionShared>,
    events: mpsc::UnboundedSender<PeerEvent>,
    pump: JoinHandle<()>,
}

impl TransportConnection {
    /// Open a session for `peer_id` through `factory` and wrap it
    pub async fn open(
        peer_id: impl Into<String>,
        role: SessionRole,
        factory: &dyn SessionFactory,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, TransportError> {
        let peer_id = peer_id.into();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let session = factory.open(&peer_id, role, signal_tx).await?;
        Ok(Self::with_session(peer_id, role, session, signal_rx, events))
    }

    /// Wrap an already opened session whose signals arrive on `signals`
    pub fn with_session(
        peer_id: impl Into<String>,
        role: SessionRole,
        session: Arc<dyn PeerSession>,
        signals: mpsc::UnboundedReceiver<SessionSignal>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let peer_id = peer_id.into();
        let shared = Arc::new(ConnectionShared::new());
        let pump = tokio::spawn(pump_signals(
            peer_id.clone(),
            Arc::clone(&shared),
            signals,
            events.clone(),
        ));

        Self {
            peer_id,
            role,
            session,
            shared,
            events,
            pump,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Whether the channel is open for `send`
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    /// Create and emit the local offer
    pub async fn create_offer(&self) -> Option<SessionDescription> {
        self.begin_negotiation();
        match self.session.create_offer().await {
            Ok(offer) => Some(offer),
            Err(e) => {
                self.emit_error(format!("create offer failed: {}", e));
                None
            }
        }
    }

    /// Create and emit the local answer
    pub async fn create_answer(&self) -> Option<SessionDescription> {
        self.begin_negotiation();
        match self.session.create_answer().await {
            Ok(answer) => Some(answer),
            Err(e) => {
                self.emit_error(format!("create answer failed: {}", e));
                None
            }
        }
    }

    /// Apply a remote offer and answer it
    pub async fn handle_offer(&self, offer: SessionDescription) -> Option<SessionDescription> {
        self.begin_negotiation();
        if let Err(e) = self.session.set_remote_description(offer).await {
            self.emit_error(format!("apply remote offer failed: {}", e));
            return None;
        }
        self.create_answer().await
    }

    /// Apply the remote answer to our offer
    pub async fn handle_answer(&self, answer: SessionDescription) {
        if let Err(e) = self.session.set_remote_description(answer).await {
            self.emit_error(format!("apply remote answer failed: {}", e));
        }
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.session.add_ice_candidate(candidate).await {
            self.emit_error(format!("add ICE candidate failed: {}", e));
        }
    }

    /// Serialize and write one envelope.
    ///
    /// Returns `false` when the channel is not open or the write fails; the
    /// envelope is not queued or retried.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        if !self.is_ready() {
            debug!(
                "Dropping {} for {}: channel not open",
                envelope.message_type(),
                self.peer_id
            );
            return false;
        }

        let text = match encode_envelope(envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {} for {}: {}", envelope.message_type(), self.peer_id, e);
                return false;
            }
        };
        let len = text.len() as u64;

        match self.session.send_text(text).await {
            Ok(()) => {
                self.shared.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.shared.bytes_sent.fetch_add(len, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!("Send to {} failed: {}", self.peer_id, e);
                false
            }
        }
    }

    /// Release the channel and the underlying session.
    ///
    /// Safe to call repeatedly; the session is closed once, a `Closed` event is
    /// emitted on every call.
    pub async fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.pump.abort();
            *self.shared.state.write() = ConnectionState::Closed;
            self.shared.ready.store(false, Ordering::SeqCst);
            if let Err(e) = self.session.close().await {
                debug!("Closing session for {} reported: {}", self.peer_id, e);
            }
        }
        self.emit(ConnectionEvent::Closed);
    }

    /// Counters for the open connection, `None` when not connected
    pub async fn get_stats(&self) -> Option<ConnectionStats> {
        if !self.is_ready() {
            return None;
        }
        let round_trip_time_ms = self
            .session
            .round_trip_time()
            .await
            .map(|rtt| rtt.as_secs_f64() * 1000.0);

        Some(ConnectionStats {
            messages_sent: self.shared.messages_sent.load(Ordering::Relaxed),
            messages_received: self.shared.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_received.load(Ordering::Relaxed),
            round_trip_time_ms,
        })
    }

    fn begin_negotiation(&self) {
        if self.state() == ConnectionState::New && self.shared.transition(ConnectionState::Connecting) {
            self.emit(ConnectionEvent::StateChanged(ConnectionState::Connecting));
        }
    }

    fn emit_error(&self, message: String) {
        warn!("Transport error for {}: {}", self.peer_id, message);
        self.emit(ConnectionEvent::Error(message));
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(PeerEvent {
            peer_id: self.peer_id.clone(),
            event,
        });
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

async fn pump_signals(
    peer_id: String,
    shared: Arc<ConnectionShared>,
    mut signals: mpsc::UnboundedReceiver<SessionSignal>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    while let Some(signal) = signals.recv().await {
        let event = match signal {
            SessionSignal::LocalDescription(description) => {
                ConnectionEvent::LocalDescription(description)
            }
            SessionSignal::LocalIceCandidate(candidate) => ConnectionEvent::IceCandidate(candidate),
            SessionSignal::StateChanged(state) => {
                if !shared.transition(state) {
                    continue;
                }
                debug!("Connection to {} is now {}", peer_id, state);
                ConnectionEvent::StateChanged(state)
            }
            SessionSignal::Message(text) => {
                shared.messages_received.fetch_add(1, Ordering::Relaxed);
                shared
                    .bytes_received
                    .fetch_add(text.len() as u64, Ordering::Relaxed);
                ConnectionEvent::Message(text)
            }
            SessionSignal::Error(message) => ConnectionEvent::Error(message),
        };

        if events
            .send(PeerEvent {
                peer_id: peer_id.clone(),
                event,
            })
            .is_err()
        {
            break;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
