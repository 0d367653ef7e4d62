// In-process loopback sessions
//
// Sessions created from clones of one `MemorySessionFactory` share a
// switchboard. The "SDP" is just a switchboard key, so offers and answers can
// still travel through a real signaling path; once the offerer applies the
// answer both ends are linked and report `Connected`. Used for simulations and
// for exercising the mesh without a network.

use super::abstraction::{
    ConnectionState, IceCandidate, PeerSession, SdpKind, SessionDescription, SessionFactory,
    SessionRole, SessionSignal, SignalSink, TransportError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const MEMORY_SDP_PREFIX: &str = "memory:";

#[derive(Default)]
struct Slot {
    offerer: Option<SignalSink>,
    answerer: Option<SignalSink>,
}

#[derive(Default)]
struct Switchboard {
    sessions: HashMap<String, Slot>,
    unreachable: HashSet<String>,
}

/// Factory for loopback sessions; clones share one switchboard
#[derive(Clone, Default)]
pub struct MemorySessionFactory {
    switchboard: Arc<Mutex<Switchboard>>,
}

impl MemorySessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future attempt to open a session towards `peer_id` fail
    pub fn set_unreachable(&self, peer_id: impl Into<String>) {
        self.switchboard.lock().unreachable.insert(peer_id.into());
    }

    pub fn set_reachable(&self, peer_id: &str) {
        self.switchboard.lock().unreachable.remove(peer_id);
    }

    /// Number of sessions currently registered on the switchboard
    pub fn active_sessions(&self) -> usize {
        self.switchboard.lock().sessions.len()
    }
}

#[async_trait]
impl SessionFactory for MemorySessionFactory {
    async fn open(
        &self,
        peer_id: &str,
        role: SessionRole,
        signals: SignalSink,
    ) -> Result<Arc<dyn PeerSession>, TransportError> {
        if self.switchboard.lock().unreachable.contains(peer_id) {
            return Err(TransportError::Unreachable(peer_id.to_string()));
        }
        Ok(Arc::new(MemorySession {
            role,
            signals,
            switchboard: Arc::clone(&self.switchboard),
            key: Mutex::new(None),
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One end of a loopback link
pub struct MemorySession {
    role: SessionRole,
    signals: SignalSink,
    switchboard: Arc<Mutex<Switchboard>>,
    key: Mutex<Option<String>>,
    remote: Mutex<Option<SignalSink>>,
    closed: AtomicBool,
}

impl MemorySession {
    fn session_key(description: &SessionDescription) -> Result<String, TransportError> {
        description
            .sdp
            .strip_prefix(MEMORY_SDP_PREFIX)
            .map(str::to_string)
            .ok_or_else(|| TransportError::Negotiation("not a memory session description".to_string()))
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerSession for MemorySession {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        if self.role != SessionRole::Initiator {
            return Err(TransportError::Negotiation("responder cannot create an offer".to_string()));
        }

        let key = uuid::Uuid::new_v4().to_string();
        let offer = SessionDescription::offer(format!("{}{}", MEMORY_SDP_PREFIX, key));

        // Registered before the offer leaves so the answerer can always find it
        self.switchboard.lock().sessions.insert(
            key.clone(),
            Slot {
                offerer: Some(self.signals.clone()),
                answerer: None,
            },
        );
        *self.key.lock() = Some(key.clone());
        let _ = self.signals.send(SessionSignal::LocalDescription(offer.clone()));
        let _ = self.signals.send(SessionSignal::LocalIceCandidate(IceCandidate {
            candidate: format!("candidate:memory {}", key),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let key = self
            .key
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Negotiation("no remote offer applied".to_string()))?;

        let answer = SessionDescription::answer(format!("{}{}", MEMORY_SDP_PREFIX, key));
        {
            let mut board = self.switchboard.lock();
            let slot = board
                .sessions
                .get_mut(&key)
                .ok_or_else(|| TransportError::Negotiation("offer withdrawn".to_string()))?;
            slot.answerer = Some(self.signals.clone());
        }
        let _ = self.signals.send(SessionSignal::LocalDescription(answer.clone()));
        Ok(answer)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let key = Self::session_key(&description)?;

        match description.kind {
            SdpKind::Offer => {
                let offerer = self
                    .switchboard
                    .lock()
                    .sessions
                    .get(&key)
                    .and_then(|slot| slot.offerer.clone())
                    .ok_or_else(|| TransportError::Negotiation(format!("unknown session {}", key)))?;
                *self.key.lock() = Some(key);
                *self.remote.lock() = Some(offerer);
            }
            SdpKind::Answer => {
                if self.key.lock().as_deref() != Some(key.as_str()) {
                    return Err(TransportError::Negotiation("answer for a different session".to_string()));
                }
                let answerer = self
                    .switchboard
                    .lock()
                    .sessions
                    .get(&key)
                    .and_then(|slot| slot.answerer.clone())
                    .ok_or_else(|| TransportError::Negotiation(format!("session {} not answered", key)))?;

                // Our own Connected goes first so it precedes anything the
                // answerer sends once it sees its own
                *self.remote.lock() = Some(answerer.clone());
                let _ = self
                    .signals
                    .send(SessionSignal::StateChanged(ConnectionState::Connected));
                let _ = answerer.send(SessionSignal::StateChanged(ConnectionState::Connected));
                debug!("Memory session {} linked", key);
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.ensure_open()?;
        let remote = self.remote.lock().clone().ok_or(TransportError::ChannelNotOpen)?;
        remote
            .send(SessionSignal::Message(text))
            .map_err(|_| TransportError::SendFailed("remote end dropped".to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(remote) = self.remote.lock().take() {
            let _ = remote.send(SessionSignal::StateChanged(ConnectionState::Disconnected));
        }
        if let Some(key) = self.key.lock().take() {
            self.switchboard.lock().sessions.remove(&key);
        }
        Ok(())
    }

    async fn round_trip_time(&self) -> Option<Duration> {
        None
    }
}
