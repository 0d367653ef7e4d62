// Mesh network manager: peer tables, discovery, health checks and alert
// flooding
//
// The manager is a plain struct owned by the mesh task (see `runtime.rs`); every
// mutation happens on that task, so none of the tables need locking.

use super::cache::AlertCache;
use super::events::MeshEvent;
use super::status::{NetworkStatus, PeerSummary};
use crate::config::MeshConfig;
use crate::device::{now_millis, DeviceInfo, DiscoveredDevice, Location};
use crate::message::{decode_envelope, Alert, CachedAlert, Envelope, Payload};
use crate::signaling::{SignalingEvent, SignalingLink};
use crate::transport::{
    ConnectionEvent, ConnectionState, IceCandidate, PeerEvent, SdpKind, SessionDescription,
    SessionFactory, SessionRole, TransportConnection,
};
use crate::MeshError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A device with an open direct channel
#[derive(Debug)]
pub struct Peer {
    pub id: String,
    pub connection: TransportConnection,
    /// Last record received from the peer, if any yet
    pub info: Option<DeviceInfo>,
    /// Epoch milliseconds when the channel opened
    pub connected_at: u64,
    pub last_heartbeat: Instant,
}

/// An outbound or inbound negotiation that has not opened yet
#[derive(Debug)]
struct Attempt {
    connection: TransportConnection,
    started_at: Instant,
}

impl Attempt {
    fn new(connection: TransportConnection) -> Self {
        Self {
            connection,
            started_at: Instant::now(),
        }
    }
}

pub struct MeshManager {
    config: MeshConfig,
    device: DeviceInfo,
    signaling: Arc<dyn SignalingLink>,
    sessions: Arc<dyn SessionFactory>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    events: mpsc::UnboundedSender<MeshEvent>,
    peers: HashMap<String, Peer>,
    /// In-flight attempts; an entry here blocks a second attempt to the same id
    connecting: HashMap<String, Attempt>,
    discovered: HashMap<String, DiscoveredDevice>,
    alerts: AlertCache,
    active: bool,
}

impl MeshManager {
    pub fn new(
        device: DeviceInfo,
        config: MeshConfig,
        signaling: Arc<dyn SignalingLink>,
        sessions: Arc<dyn SessionFactory>,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Self {
        let alerts = AlertCache::new(config.max_alert_cache_size);
        Self {
            config,
            device,
            signaling,
            sessions,
            peer_events,
            events,
            peers: HashMap::new(),
            connecting: HashMap::new(),
            discovered: HashMap::new(),
            alerts,
            active: false,
        }
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Mark the node active and announce it. The caller starts the timers.
    pub async fn initialize(&mut self) -> Result<(), MeshError> {
        if self.active {
            return Err(MeshError::AlreadyActive);
        }
        self.active = true;
        info!("Mesh node {} ({}) active", self.device.id, self.device.name);
        self.emit(MeshEvent::NetworkStarted {
            device_id: self.device.id.clone(),
        });
        self.discover_devices();
        Ok(())
    }

    /// Disconnect everything and clear all tables. Safe to call repeatedly.
    pub async fn shutdown(&mut self) {
        let was_active = self.active;
        self.active = false;

        for (id, attempt) in self.connecting.drain() {
            debug!("Abandoning connection attempt to {}", id);
            attempt.connection.close().await;
        }
        let peers: Vec<Peer> = self.peers.drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            peer.connection.close().await;
            self.emit(MeshEvent::PeerDisconnected { peer_id: peer.id });
        }
        self.discovered.clear();
        self.alerts.clear();

        if was_active {
            info!("Mesh node {} stopped", self.device.id);
            self.emit(MeshEvent::NetworkStopped);
        }
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    /// Broadcast our record through signaling and purge stale discoveries
    pub fn discover_devices(&mut self) {
        if !self.active {
            return;
        }
        let queued = !self.signaling.send(Payload::Discovery {
            device_info: self.device.clone(),
        });
        if queued {
            debug!("Discovery broadcast queued until signaling reconnects");
        }

        let now = now_millis();
        let max_age = self.config.discovery_stale_after().as_millis() as u64;
        let peers = &self.peers;
        let before = self.discovered.len();
        self.discovered
            .retain(|id, entry| peers.contains_key(id) || !entry.is_stale(now, max_age));
        let purged = before - self.discovered.len();
        if purged > 0 {
            debug!("Purged {} stale discovered devices", purged);
        }
    }

    pub async fn handle_discovered_device(&mut self, info: DeviceInfo) {
        if info.id == self.device.id {
            return;
        }

        let id = info.id.clone();
        let accepts_alerts = info.accepts_alerts();
        let announce = match self.discovered.get_mut(&id) {
            Some(entry) => {
                entry.discovered_at = now_millis();
                if info.timestamp > entry.info.timestamp {
                    entry.info = info.clone();
                    true
                } else {
                    false
                }
            }
            None => {
                self.discovered
                    .insert(id.clone(), DiscoveredDevice::new(info.clone()));
                true
            }
        };
        if announce {
            debug!("Discovered device {} ({})", id, info.name);
            self.emit(MeshEvent::DeviceDiscovered(info));
        }

        let should_connect = self.active
            && accepts_alerts
            && self.peers.len() + self.connecting.len() < self.config.max_peers
            && !self.peers.contains_key(&id)
            && !self.connecting.contains_key(&id);
        if should_connect {
            if let Err(e) = self.connect_to_peer(&id).await {
                debug!("Auto-connect to {} failed: {}", id, e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Start an outbound connection. The peer is added once its channel opens.
    pub async fn connect_to_peer(&mut self, peer_id: &str) -> Result<(), MeshError> {
        if !self.active {
            return Err(MeshError::NotActive);
        }
        if peer_id == self.device.id {
            return Err(MeshError::SelfConnection);
        }
        if self.peers.contains_key(peer_id) || self.connecting.contains_key(peer_id) {
            return Err(MeshError::AlreadyConnected(peer_id.to_string()));
        }
        if self.peers.len() + self.connecting.len() >= self.config.max_peers {
            return Err(MeshError::PeerTableFull(self.config.max_peers));
        }

        let connection = match TransportConnection::open(
            peer_id,
            SessionRole::Initiator,
            self.sessions.as_ref(),
            self.peer_events.clone(),
        )
        .await
        {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Failed to open connection to {}: {}", peer_id, e);
                self.emit(MeshEvent::ConnectionError {
                    peer_id: peer_id.to_string(),
                    error: e.to_string(),
                });
                return Err(e.into());
            }
        };

        info!("Connecting to {}", peer_id);
        self.connecting
            .insert(peer_id.to_string(), Attempt::new(connection));
        if let Some(attempt) = self.connecting.get(peer_id) {
            // Failures come back as an Error event and fail the attempt there
            attempt.connection.create_offer().await;
        }
        Ok(())
    }

    /// Close and forget a peer. Unknown ids are ignored.
    pub async fn disconnect_peer(&mut self, peer_id: &str) {
        if let Some(attempt) = self.connecting.remove(peer_id) {
            debug!("Cancelled connection attempt to {}", peer_id);
            attempt.connection.close().await;
        }
        if let Some(peer) = self.peers.remove(peer_id) {
            peer.connection.close().await;
            info!("Disconnected from {}", peer_id);
            self.emit(MeshEvent::PeerDisconnected {
                peer_id: peer_id.to_string(),
            });
        }
    }

    async fn fail_attempt(&mut self, peer_id: &str, error: String) {
        if let Some(attempt) = self.connecting.remove(peer_id) {
            warn!("Connection attempt to {} failed: {}", peer_id, error);
            attempt.connection.close().await;
            self.emit(MeshEvent::ConnectionError {
                peer_id: peer_id.to_string(),
                error,
            });
        }
    }

    /// Move an in-flight attempt into the peer table and say hello
    async fn promote(&mut self, peer_id: &str) {
        let connection = match self.connecting.remove(peer_id) {
            Some(attempt) => attempt.connection,
            None => return,
        };
        if self.peers.len() >= self.config.max_peers {
            connection.close().await;
            self.emit(MeshEvent::ConnectionError {
                peer_id: peer_id.to_string(),
                error: MeshError::PeerTableFull(self.config.max_peers).to_string(),
            });
            return;
        }

        let peer = Peer {
            id: peer_id.to_string(),
            connection,
            info: self.discovered.get(peer_id).map(|entry| entry.info.clone()),
            connected_at: now_millis(),
            last_heartbeat: Instant::now(),
        };
        let handshake = Envelope::new(
            self.device.id.clone(),
            Payload::Handshake {
                device_info: self.device.clone(),
                alert_count: self.alerts.len(),
            },
        );
        if !peer.connection.send(&handshake).await {
            warn!("Handshake to {} could not be sent", peer_id);
        }
        self.peers.insert(peer_id.to_string(), peer);

        info!("Connected to {} ({} peers)", peer_id, self.peers.len());
        self.emit(MeshEvent::PeerConnected {
            peer_id: peer_id.to_string(),
        });
    }

    fn connection_for(&self, peer_id: &str) -> Option<&TransportConnection> {
        self.connecting
            .get(peer_id)
            .map(|attempt| &attempt.connection)
            .or_else(|| self.peers.get(peer_id).map(|peer| &peer.connection))
    }

    /// React to one event from a peer connection's pump
    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        let PeerEvent { peer_id, event } = event;
        match event {
            ConnectionEvent::LocalDescription(description) => {
                if self.connection_for(&peer_id).is_none() {
                    return;
                }
                let payload = match description.kind {
                    SdpKind::Offer => Payload::Offer { offer: description },
                    SdpKind::Answer => Payload::Answer {
                        answer: description,
                    },
                };
                self.signaling.send_to_peer(&peer_id, payload);
            }
            ConnectionEvent::IceCandidate(candidate) => {
                if self.connection_for(&peer_id).is_none() {
                    return;
                }
                self.signaling
                    .send_to_peer(&peer_id, Payload::IceCandidate { candidate });
            }
            ConnectionEvent::StateChanged(ConnectionState::Connected) => {
                self.promote(&peer_id).await;
            }
            ConnectionEvent::StateChanged(state) if state.is_terminal() => {
                if self.peers.contains_key(&peer_id) {
                    debug!("Connection to {} is {}", peer_id, state);
                    self.disconnect_peer(&peer_id).await;
                } else {
                    self.fail_attempt(&peer_id, format!("connection {}", state))
                        .await;
                }
            }
            ConnectionEvent::StateChanged(_) => {}
            ConnectionEvent::Message(raw) => {
                self.handle_received_message(&peer_id, &raw).await;
            }
            ConnectionEvent::Error(error) => {
                if self.connecting.contains_key(&peer_id) {
                    self.fail_attempt(&peer_id, error).await;
                } else {
                    warn!("Error on connection to {}: {}", peer_id, error);
                }
            }
            ConnectionEvent::Closed => {}
        }
    }

    // ------------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------------

    /// React to one event from the rendezvous channel
    pub async fn handle_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => {
                // Re-announce after a reconnect
                self.discover_devices();
            }
            SignalingEvent::Disconnected { code, reason } => {
                debug!("Signaling disconnected ({:?}): {}", code, reason);
            }
            SignalingEvent::ReconnectFailed { attempts } => {
                self.emit(MeshEvent::SignalingReconnectFailed { attempts });
            }
            SignalingEvent::Offer { from, offer } => self.handle_remote_offer(&from, offer).await,
            SignalingEvent::Answer { from, answer } => match self.connecting.get(&from) {
                Some(attempt) if attempt.connection.role() == SessionRole::Initiator => {
                    attempt.connection.handle_answer(answer).await;
                }
                _ => debug!("Ignoring answer from {} with no pending offer", from),
            },
            SignalingEvent::IceCandidate { from, candidate } => {
                self.handle_remote_candidate(&from, candidate).await;
            }
            SignalingEvent::PeerMessage { from, payload } => {
                self.handle_relayed(&from, payload).await;
            }
            SignalingEvent::PeerList(peers) => {
                debug!("Signaling server reports {} registered devices", peers.len());
            }
            SignalingEvent::PeerJoined(peer_id) => debug!("{} joined signaling", peer_id),
            SignalingEvent::PeerLeft(peer_id) => {
                debug!("{} left signaling", peer_id);
                if !self.peers.contains_key(&peer_id) {
                    self.discovered.remove(&peer_id);
                    // Nobody is left to answer
                    self.fail_attempt(&peer_id, "peer left signaling".to_string())
                        .await;
                }
            }
            SignalingEvent::ServerError(_) => {}
            SignalingEvent::Relay(envelope) => {
                self.handle_relayed(&envelope.from, envelope.payload).await;
            }
        }
    }

    async fn handle_relayed(&mut self, from: &str, payload: Payload) {
        match payload {
            Payload::Discovery { device_info } => self.handle_discovered_device(device_info).await,
            Payload::DeviceUpdate { device_info } => self.handle_device_update(device_info),
            other => debug!(
                "Ignoring relayed {} from {}",
                other.message_type(),
                from
            ),
        }
    }

    async fn handle_remote_offer(&mut self, from: &str, offer: SessionDescription) {
        if !self.active || from == self.device.id {
            return;
        }
        if self.peers.contains_key(from) {
            debug!("Ignoring offer from already connected {}", from);
            return;
        }

        if let Some(existing) = self.connecting.get(from) {
            if existing.connection.role() == SessionRole::Responder {
                debug!("Ignoring repeated offer from {}", from);
                return;
            }
            // Both sides offered: the smaller id keeps its offer
            if self.device.id.as_str() < from {
                debug!("Offer collision with {}, keeping ours", from);
                return;
            }
            debug!("Offer collision with {}, answering theirs", from);
            if let Some(ours) = self.connecting.remove(from) {
                ours.connection.close().await;
            }
        }

        if self.peers.len() + self.connecting.len() >= self.config.max_peers {
            debug!("Peer table full, ignoring offer from {}", from);
            return;
        }

        let connection = match TransportConnection::open(
            from,
            SessionRole::Responder,
            self.sessions.as_ref(),
            self.peer_events.clone(),
        )
        .await
        {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Failed to accept offer from {}: {}", from, e);
                self.emit(MeshEvent::ConnectionError {
                    peer_id: from.to_string(),
                    error: e.to_string(),
                });
                return;
            }
        };

        self.connecting
            .insert(from.to_string(), Attempt::new(connection));
        if let Some(attempt) = self.connecting.get(from) {
            // The answer is relayed from its LocalDescription event
            attempt.connection.handle_offer(offer).await;
        }
    }

    async fn handle_remote_candidate(&mut self, from: &str, candidate: IceCandidate) {
        match self.connection_for(from) {
            Some(connection) => connection.add_ice_candidate(candidate).await,
            None => debug!("Dropping ICE candidate from unknown {}", from),
        }
    }

    // ------------------------------------------------------------------------
    // Peer messages
    // ------------------------------------------------------------------------

    /// Parse and dispatch one frame from a peer channel. Bad frames are
    /// logged and dropped.
    pub async fn handle_received_message(&mut self, peer_id: &str, raw: &str) {
        let envelope = match decode_envelope(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping message from {}: {}", peer_id, e);
                return;
            }
        };

        match envelope.payload {
            Payload::Handshake {
                device_info,
                alert_count,
            } => {
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.info = Some(device_info.clone());
                    peer.last_heartbeat = Instant::now();
                }
                debug!("Handshake from {} ({} cached alerts)", peer_id, alert_count);
                self.emit(MeshEvent::PeerHandshake {
                    peer_id: peer_id.to_string(),
                    device_info,
                    alert_count,
                });
            }
            Payload::Heartbeat { device_info } => {
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.info = Some(device_info);
                    peer.last_heartbeat = Instant::now();
                }
            }
            Payload::Alert {
                alert,
                hops,
                max_hops,
                origin_device,
            } => {
                self.handle_alert(peer_id, alert, hops, max_hops, origin_device)
                    .await;
            }
            Payload::Discovery { device_info } => self.handle_discovered_device(device_info).await,
            Payload::DeviceUpdate { device_info } => self.handle_device_update(device_info),
            other => warn!(
                "Unexpected {} on direct channel from {}",
                other.message_type(),
                peer_id
            ),
        }
    }

    async fn handle_alert(
        &mut self,
        from: &str,
        alert: Alert,
        hops: u32,
        max_hops: u32,
        origin_device: String,
    ) {
        if origin_device == self.device.id {
            debug!("Dropping own alert {} echoed by {}", alert.id, from);
            return;
        }
        if self.alerts.contains(&alert.id) {
            debug!("Dropping duplicate alert {} from {}", alert.id, from);
            return;
        }

        let max_hops = max_hops.min(self.config.max_hops);
        let cached = CachedAlert {
            alert: alert.clone(),
            received_at: now_millis(),
            received_from: Some(from.to_string()),
            hops,
            origin_device: origin_device.clone(),
        };
        self.alerts.insert(cached.clone());
        info!(
            "Received alert {} from {} (hop {}/{})",
            alert.id, from, hops, max_hops
        );
        self.emit(MeshEvent::AlertReceived(cached));

        if hops >= max_hops {
            debug!("Alert {} reached its hop limit", alert.id);
            return;
        }
        let relay = Envelope::new(
            self.device.id.clone(),
            Payload::Alert {
                alert,
                hops: hops + 1,
                max_hops,
                origin_device,
            },
        );
        let relayed = self.broadcast(&relay, Some(from)).await;
        debug!("Relayed alert to {} peers", relayed);
    }

    fn handle_device_update(&mut self, info: DeviceInfo) {
        if info.id == self.device.id {
            return;
        }
        if let Some(peer) = self.peers.get_mut(&info.id) {
            peer.info = Some(info.clone());
        }
        if let Some(entry) = self.discovered.get_mut(&info.id) {
            entry.info = info.clone();
        }
        debug!("Device {} updated its record", info.id);
        self.emit(MeshEvent::DeviceUpdated(info));
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Send to every peer except `except`; returns how many sends succeeded
    async fn broadcast(&self, envelope: &Envelope, except: Option<&str>) -> usize {
        let mut sent = 0;
        for peer in self.peers.values() {
            if Some(peer.id.as_str()) == except {
                continue;
            }
            if peer.connection.send(envelope).await {
                sent += 1;
            }
        }
        sent
    }

    /// Cache a locally sourced alert and flood it to all peers
    pub async fn share_alert(&mut self, alert: Alert) -> Result<CachedAlert, MeshError> {
        if alert.id.is_empty() {
            return Err(MeshError::InvalidAlert("alert id is empty".to_string()));
        }
        if self.alerts.contains(&alert.id) {
            return Err(MeshError::DuplicateAlert(alert.id));
        }

        let cached = CachedAlert {
            alert: alert.clone(),
            received_at: now_millis(),
            received_from: None,
            hops: 0,
            origin_device: self.device.id.clone(),
        };
        self.alerts.insert(cached.clone());

        let envelope = Envelope::new(
            self.device.id.clone(),
            Payload::Alert {
                alert,
                hops: 0,
                max_hops: self.config.max_hops,
                origin_device: self.device.id.clone(),
            },
        );
        let sent = self.broadcast(&envelope, None).await;
        info!("Shared alert {} with {} peers", cached.alert_id(), sent);
        self.emit(MeshEvent::AlertShared(cached.clone()));
        Ok(cached)
    }

    /// Replace our location and tell every peer
    pub async fn update_location(&mut self, location: Location) {
        self.device.location = Some(location);
        self.device.timestamp = now_millis();

        let envelope = Envelope::new(
            self.device.id.clone(),
            Payload::DeviceUpdate {
                device_info: self.device.clone(),
            },
        );
        let sent = self.broadcast(&envelope, None).await;
        debug!("Location update sent to {} peers", sent);
    }

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    /// Heartbeat every peer, then drop the ones that went quiet
    pub async fn run_heartbeat(&mut self, now: Instant) -> Vec<String> {
        let heartbeat = Envelope::new(
            self.device.id.clone(),
            Payload::Heartbeat {
                device_info: self.device.clone(),
            },
        );
        self.broadcast(&heartbeat, None).await;
        self.check_peer_health(now).await
    }

    /// Disconnect peers whose last heartbeat is older than three intervals and
    /// fail attempts that have been negotiating for as long
    pub async fn check_peer_health(&mut self, now: Instant) -> Vec<String> {
        let max_age = self.config.peer_stale_after();

        let expired: Vec<String> = self
            .connecting
            .iter()
            .filter(|(_, attempt)| now.saturating_duration_since(attempt.started_at) > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for peer_id in expired {
            self.fail_attempt(&peer_id, "negotiation timed out".to_string())
                .await;
        }

        let stale: Vec<String> = self
            .peers
            .values()
            .filter(|peer| now.saturating_duration_since(peer.last_heartbeat) > max_age)
            .map(|peer| peer.id.clone())
            .collect();

        for peer_id in &stale {
            warn!("Peer {} missed heartbeats, disconnecting", peer_id);
            self.disconnect_peer(peer_id).await;
        }
        stale
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    pub fn network_status(&self) -> NetworkStatus {
        let now = Instant::now();
        let mut peers: Vec<PeerSummary> = self
            .peers
            .values()
            .map(|peer| PeerSummary {
                id: peer.id.clone(),
                name: peer.info.as_ref().map(|info| info.name.clone()),
                state: peer.connection.state(),
                connected_at: peer.connected_at,
                last_heartbeat_ms_ago: now
                    .saturating_duration_since(peer.last_heartbeat)
                    .as_millis() as u64,
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));

        NetworkStatus {
            is_active: self.active,
            device_id: self.device.id.clone(),
            connected_peers: self.peers.len(),
            discovered_devices: self.discovered.len(),
            connecting: self.connecting.len(),
            cached_alerts: self.alerts.len(),
            peers,
        }
    }

    /// Cached alerts, oldest first
    pub fn cached_alerts(&self) -> Vec<CachedAlert> {
        self.alerts.snapshot()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{PeerSession, SessionSignal, SignalSink, TransportError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Duration;

    // ------------------------------------------------------------------------
    // Mocks
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct RecordingSignaling {
        broadcasts: Mutex<Vec<Payload>>,
        direct: Mutex<Vec<(String, Payload)>>,
    }

    impl SignalingLink for RecordingSignaling {
        fn send(&self, payload: Payload) -> bool {
            self.broadcasts.lock().push(payload);
            true
        }

        fn send_to_peer(&self, peer_id: &str, payload: Payload) -> bool {
            self.direct.lock().push((peer_id.to_string(), payload));
            true
        }
    }

    struct RecordingSession {
        signals: SignalSink,
        sent: Mutex<Vec<String>>,
        closed: Mutex<bool>,
    }

    impl RecordingSession {
        fn sent_payloads(&self) -> Vec<Payload> {
            self.sent
                .lock()
                .iter()
                .map(|raw| decode_envelope(raw).unwrap().payload)
                .collect()
        }

        fn sent_alerts(&self) -> Vec<(String, u32)> {
            self.sent_payloads()
                .into_iter()
                .filter_map(|payload| match payload {
                    Payload::Alert { alert, hops, .. } => Some((alert.id, hops)),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl PeerSession for RecordingSession {
        async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
            let offer = SessionDescription::offer("recorded-offer");
            let _ = self
                .signals
                .send(SessionSignal::LocalDescription(offer.clone()));
            Ok(offer)
        }

        async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
            let answer = SessionDescription::answer("recorded-answer");
            let _ = self
                .signals
                .send(SessionSignal::LocalDescription(answer.clone()));
            Ok(answer)
        }

        async fn set_remote_description(
            &self,
            _description: SessionDescription,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send_text(&self, text: String) -> Result<(), TransportError> {
            self.sent.lock().push(text);
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            *self.closed.lock() = true;
            Ok(())
        }

        async fn round_trip_time(&self) -> Option<Duration> {
            None
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        sessions: Mutex<HashMap<String, Arc<RecordingSession>>>,
        unreachable: Mutex<HashSet<String>>,
    }

    impl RecordingFactory {
        fn session(&self, peer_id: &str) -> Arc<RecordingSession> {
            self.sessions.lock().get(peer_id).cloned().unwrap()
        }

        fn signal(&self, peer_id: &str, signal: SessionSignal) {
            self.session(peer_id).signals.send(signal).unwrap();
        }
    }

    #[async_trait]
    impl SessionFactory for RecordingFactory {
        async fn open(
            &self,
            peer_id: &str,
            _role: SessionRole,
            signals: SignalSink,
        ) -> Result<Arc<dyn PeerSession>, TransportError> {
            if self.unreachable.lock().contains(peer_id) {
                return Err(TransportError::Unreachable(peer_id.to_string()));
            }
            let session = Arc::new(RecordingSession {
                signals,
                sent: Mutex::new(Vec::new()),
                closed: Mutex::new(false),
            });
            self.sessions
                .lock()
                .insert(peer_id.to_string(), Arc::clone(&session));
            Ok(session)
        }
    }

    // ------------------------------------------------------------------------
    // Harness
    // ------------------------------------------------------------------------

    struct Harness {
        manager: MeshManager,
        signaling: Arc<RecordingSignaling>,
        factory: Arc<RecordingFactory>,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        events: mpsc::UnboundedReceiver<MeshEvent>,
    }

    impl Harness {
        async fn new(device_id: &str, config: MeshConfig) -> Self {
            let signaling = Arc::new(RecordingSignaling::default());
            let factory = Arc::new(RecordingFactory::default());
            let (peer_tx, peer_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let mut manager = MeshManager::new(
                DeviceInfo::new(device_id, device_id.to_uppercase(), "mobile"),
                config,
                signaling.clone(),
                factory.clone(),
                peer_tx,
                event_tx,
            );
            manager.initialize().await.unwrap();

            let mut harness = Self {
                manager,
                signaling,
                factory,
                peer_events: peer_rx,
                events: event_rx,
            };
            harness.drain_events();
            harness
        }

        /// Feed pending connection events to the manager until quiet
        async fn settle(&mut self) {
            while let Ok(Some(event)) =
                tokio::time::timeout(Duration::from_millis(50), self.peer_events.recv()).await
            {
                self.manager.handle_peer_event(event).await;
            }
        }

        async fn connect(&mut self, peer_id: &str) -> Arc<RecordingSession> {
            self.manager.connect_to_peer(peer_id).await.unwrap();
            self.factory
                .signal(peer_id, SessionSignal::StateChanged(ConnectionState::Connected));
            self.settle().await;
            assert!(self.manager.peers.contains_key(peer_id));
            self.factory.session(peer_id)
        }

        fn drain_events(&mut self) -> Vec<MeshEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn remote(id: &str) -> DeviceInfo {
        DeviceInfo::new(id, id.to_uppercase(), "mobile")
    }

    fn alert_frame(from: &str, id: &str, hops: u32, max_hops: u32, origin: &str) -> String {
        let envelope = Envelope::new(
            from,
            Payload::Alert {
                alert: Alert::new(id).with_field("severity", "severe"),
                hops,
                max_hops,
                origin_device: origin.to_string(),
            },
        );
        crate::message::encode_envelope(&envelope).unwrap()
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_initialize_broadcasts_discovery() {
        let h = Harness::new("dev-a", MeshConfig::default()).await;
        let broadcasts = h.signaling.broadcasts.lock().clone();

        assert_eq!(broadcasts.len(), 1);
        assert!(matches!(&broadcasts[0], Payload::Discovery { device_info } if device_info.id == "dev-a"));
    }

    #[tokio::test]
    async fn test_initialize_twice_is_rejected() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        assert!(matches!(
            h.manager.initialize().await,
            Err(MeshError::AlreadyActive)
        ));
    }

    #[tokio::test]
    async fn test_self_discovery_is_ignored() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        let me = h.manager.device().clone();

        h.manager.handle_discovered_device(me).await;

        assert!(h.manager.discovered.is_empty());
        assert!(h.manager.connecting.is_empty());
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_discovery_auto_connects() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;

        h.manager.handle_discovered_device(remote("dev-b")).await;
        h.settle().await;

        assert!(h.manager.connecting.contains_key("dev-b"));
        assert_eq!(
            h.drain_events(),
            vec![MeshEvent::DeviceDiscovered(remote_with_ts(&h, "dev-b"))]
        );
        let direct = h.signaling.direct.lock().clone();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].0, "dev-b");
        assert!(matches!(&direct[0].1, Payload::Offer { offer } if offer.sdp == "recorded-offer"));
    }

    fn remote_with_ts(h: &Harness, id: &str) -> DeviceInfo {
        h.manager.discovered.get(id).unwrap().info.clone()
    }

    #[tokio::test]
    async fn test_discovery_without_alert_capability_does_not_connect() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;

        h.manager
            .handle_discovered_device(remote("sensor-1").with_capabilities(["telemetry"]))
            .await;

        assert!(h.manager.discovered.contains_key("sensor-1"));
        assert!(h.manager.connecting.is_empty());
    }

    #[tokio::test]
    async fn test_older_discovery_does_not_replace_entry() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        let mut newer = remote("dev-b").with_capabilities(["relay"]);
        newer.timestamp = 2_000;
        let mut older = newer.clone();
        older.timestamp = 1_000;
        older.name = "stale".to_string();

        h.manager.handle_discovered_device(newer).await;
        h.manager
            .discovered
            .get_mut("dev-b")
            .unwrap()
            .discovered_at = 0;
        h.manager.handle_discovered_device(older).await;

        let entry = &h.manager.discovered["dev-b"];
        assert_eq!(entry.info.name, "DEV-B");
        // The stale copy still counts as a sign of life
        assert!(entry.discovered_at > 0);
        assert_eq!(h.drain_events().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_connect_respects_capacity() {
        let config = MeshConfig {
            max_peers: 2,
            ..Default::default()
        };
        let mut h = Harness::new("dev-a", config).await;

        for id in ["dev-b", "dev-c", "dev-d"] {
            h.manager.handle_discovered_device(remote(id)).await;
        }

        assert_eq!(h.manager.connecting.len(), 2);
        assert!(!h.manager.connecting.contains_key("dev-d"));
        assert_eq!(h.manager.discovered.len(), 3);
        assert!(matches!(
            h.manager.connect_to_peer("dev-d").await,
            Err(MeshError::PeerTableFull(2))
        ));
    }

    #[tokio::test]
    async fn test_auto_connect_skipped_when_peer_table_full() {
        let config = MeshConfig {
            max_peers: 2,
            ..Default::default()
        };
        let mut h = Harness::new("dev-a", config).await;
        h.connect("dev-b").await;
        h.connect("dev-c").await;
        h.drain_events();

        h.manager.handle_discovered_device(remote("dev-d")).await;

        assert_eq!(h.manager.peers.len(), 2);
        assert!(h.manager.connecting.is_empty());
        assert!(h.manager.discovered.contains_key("dev-d"));
        assert!(matches!(
            h.manager.connect_to_peer("dev-d").await,
            Err(MeshError::PeerTableFull(2))
        ));
    }

    #[tokio::test]
    async fn test_stale_discoveries_are_purged() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        h.manager
            .handle_discovered_device(remote("sensor-1").with_capabilities(["telemetry"]))
            .await;
        h.manager
            .discovered
            .get_mut("sensor-1")
            .unwrap()
            .discovered_at = 1;

        h.manager.discover_devices();
        assert!(h.manager.discovered.is_empty());
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_connect_guards() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;

        assert!(matches!(
            h.manager.connect_to_peer("dev-a").await,
            Err(MeshError::SelfConnection)
        ));
        h.manager.connect_to_peer("dev-b").await.unwrap();
        assert!(matches!(
            h.manager.connect_to_peer("dev-b").await,
            Err(MeshError::AlreadyConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_connected_peer_gets_handshake() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        let session = h.connect("dev-b").await;

        let sent = session.sent_payloads();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            Payload::Handshake { device_info, alert_count: 0 } if device_info.id == "dev-a"
        ));
        assert!(h.manager.connecting.is_empty());
        assert!(h
            .drain_events()
            .contains(&MeshEvent::PeerConnected {
                peer_id: "dev-b".to_string()
            }));
    }

    #[tokio::test]
    async fn test_unreachable_peer_emits_connection_error() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        h.factory.unreachable.lock().insert("dev-x".to_string());

        assert!(h.manager.connect_to_peer("dev-x").await.is_err());
        assert!(h.manager.connecting.is_empty());
        assert!(matches!(
            h.drain_events().as_slice(),
            [MeshEvent::ConnectionError { peer_id, .. }] if peer_id == "dev-x"
        ));
    }

    #[tokio::test]
    async fn test_failed_negotiation_clears_in_flight_marker() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        h.manager.connect_to_peer("dev-b").await.unwrap();

        h.factory
            .signal("dev-b", SessionSignal::StateChanged(ConnectionState::Failed));
        h.settle().await;

        assert!(h.manager.connecting.is_empty());
        assert!(h.manager.peers.is_empty());
        assert!(h
            .drain_events()
            .iter()
            .any(|e| matches!(e, MeshEvent::ConnectionError { peer_id, .. } if peer_id == "dev-b")));

        // No automatic retry, but a manual one is allowed
        h.manager.connect_to_peer("dev-b").await.unwrap();
    }

    #[tokio::test]
    async fn test_terminal_state_disconnects_peer() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        let session = h.connect("dev-b").await;
        h.drain_events();

        h.factory.signal(
            "dev-b",
            SessionSignal::StateChanged(ConnectionState::Disconnected),
        );
        h.settle().await;

        assert!(h.manager.peers.is_empty());
        assert!(*session.closed.lock());
        assert_eq!(
            h.drain_events(),
            vec![MeshEvent::PeerDisconnected {
                peer_id: "dev-b".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_disconnect_unknown_peer_is_noop() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        h.manager.disconnect_peer("nobody").await;
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_remote_offer_creates_responder_and_relays_answer() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;

        h.manager
            .handle_signaling_event(SignalingEvent::Offer {
                from: "dev-b".to_string(),
                offer: SessionDescription::offer("their-offer"),
            })
            .await;
        h.settle().await;

        assert_eq!(
            h.manager.connecting.get("dev-b").map(|c| c.connection.role()),
            Some(SessionRole::Responder)
        );
        let direct = h.signaling.direct.lock().clone();
        assert!(matches!(
            direct.as_slice(),
            [(to, Payload::Answer { answer })] if to == "dev-b" && answer.sdp == "recorded-answer"
        ));
    }

    #[tokio::test]
    async fn test_offer_collision_smaller_id_keeps_offer() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        h.manager.connect_to_peer("dev-b").await.unwrap();

        h.manager
            .handle_signaling_event(SignalingEvent::Offer {
                from: "dev-b".to_string(),
                offer: SessionDescription::offer("their-offer"),
            })
            .await;

        assert_eq!(
            h.manager.connecting.get("dev-b").map(|c| c.connection.role()),
            Some(SessionRole::Initiator)
        );
    }

    #[tokio::test]
    async fn test_offer_collision_larger_id_answers() {
        let mut h = Harness::new("dev-z", MeshConfig::default()).await;
        h.manager.connect_to_peer("dev-b").await.unwrap();
        let ours = h.factory.session("dev-b");

        h.manager
            .handle_signaling_event(SignalingEvent::Offer {
                from: "dev-b".to_string(),
                offer: SessionDescription::offer("their-offer"),
            })
            .await;
        h.settle().await;

        assert!(*ours.closed.lock());
        assert_eq!(
            h.manager.connecting.get("dev-b").map(|c| c.connection.role()),
            Some(SessionRole::Responder)
        );
        assert!(!h
            .drain_events()
            .iter()
            .any(|e| matches!(e, MeshEvent::ConnectionError { .. })));
    }

    #[tokio::test]
    async fn test_relayed_discovery_is_handled() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        let envelope = Envelope::new(
            "dev-b",
            Payload::Discovery {
                device_info: remote("dev-b"),
            },
        );

        h.manager
            .handle_signaling_event(SignalingEvent::Relay(envelope))
            .await;
        assert!(h.manager.discovered.contains_key("dev-b"));
    }

    #[tokio::test]
    async fn test_reconnect_failure_is_surfaced() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        h.manager
            .handle_signaling_event(SignalingEvent::ReconnectFailed { attempts: 5 })
            .await;
        assert_eq!(
            h.drain_events(),
            vec![MeshEvent::SignalingReconnectFailed { attempts: 5 }]
        );
    }

    // ------------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_share_alert_broadcasts_to_all_peers() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        let b = h.connect("dev-b").await;
        let c = h.connect("dev-c").await;

        let cached = h.manager.share_alert(Alert::new("quake-1")).await.unwrap();

        assert!(cached.is_local());
        assert_eq!(cached.origin_device, "dev-a");
        assert_eq!(b.sent_alerts(), vec![("quake-1".to_string(), 0)]);
        assert_eq!(c.sent_alerts(), vec![("quake-1".to_string(), 0)]);
        assert!(matches!(
            h.manager.share_alert(Alert::new("quake-1")).await,
            Err(MeshError::DuplicateAlert(_))
        ));
        assert!(matches!(
            h.manager.share_alert(Alert::new("")).await,
            Err(MeshError::InvalidAlert(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_eviction_is_fifo() {
        let config = MeshConfig {
            max_alert_cache_size: 2,
            ..Default::default()
        };
        let mut h = Harness::new("dev-a", config).await;

        for id in ["a1", "a2", "a3"] {
            h.manager.share_alert(Alert::new(id)).await.unwrap();
        }

        let ids: Vec<_> = h
            .manager
            .cached_alerts()
            .iter()
            .map(|c| c.alert_id().to_string())
            .collect();
        assert_eq!(ids, vec!["a2", "a3"]);
    }

    #[tokio::test]
    async fn test_duplicate_alert_is_suppressed() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        h.connect("dev-b").await;
        h.connect("dev-c").await;
        h.drain_events();

        h.manager
            .handle_received_message("dev-b", &alert_frame("dev-b", "flood-1", 1, 5, "dev-z"))
            .await;
        h.manager
            .handle_received_message("dev-c", &alert_frame("dev-c", "flood-1", 1, 5, "dev-z"))
            .await;

        let received: Vec<_> = h
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, MeshEvent::AlertReceived(_)))
            .collect();
        assert_eq!(received.len(), 1);
        assert_eq!(h.manager.cached_alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_relay_skips_sender_and_increments_hops() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        let b = h.connect("dev-b").await;
        let c = h.connect("dev-c").await;

        h.manager
            .handle_received_message("dev-b", &alert_frame("dev-b", "flood-2", 2, 5, "dev-z"))
            .await;

        assert!(b.sent_alerts().is_empty());
        assert_eq!(c.sent_alerts(), vec![("flood-2".to_string(), 3)]);

        let cached = &h.manager.cached_alerts()[0];
        assert_eq!(cached.received_from.as_deref(), Some("dev-b"));
        assert_eq!(cached.hops, 2);
        assert_eq!(cached.alert.fields["severity"], "severe");
    }

    #[tokio::test]
    async fn test_alert_at_hop_limit_is_not_relayed() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        h.connect("dev-b").await;
        let c = h.connect("dev-c").await;
        h.drain_events();

        h.manager
            .handle_received_message("dev-b", &alert_frame("dev-b", "flood-3", 5, 5, "dev-z"))
            .await;

        assert!(c.sent_alerts().is_empty());
        assert_eq!(h.manager.cached_alerts().len(), 1);
        assert!(matches!(
            h.drain_events().as_slice(),
            [MeshEvent::AlertReceived(cached)] if cached.hops == 5
        ));
    }

    #[tokio::test]
    async fn test_local_hop_limit_caps_remote_limit() {
        let config = MeshConfig {
            max_hops: 2,
            ..Default::default()
        };
        let mut h = Harness::new("dev-a", config).await;
        h.connect("dev-b").await;
        let c = h.connect("dev-c").await;

        h.manager
            .handle_received_message("dev-b", &alert_frame("dev-b", "flood-4", 2, 50, "dev-z"))
            .await;
        assert!(c.sent_alerts().is_empty());
    }

    #[tokio::test]
    async fn test_own_alert_echo_is_dropped() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        h.connect("dev-b").await;
        h.drain_events();

        h.manager
            .handle_received_message("dev-b", &alert_frame("dev-b", "mine", 1, 5, "dev-a"))
            .await;

        assert!(h.manager.cached_alerts().is_empty());
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        h.connect("dev-b").await;
        h.drain_events();

        h.manager.handle_received_message("dev-b", "{not json").await;
        h.manager
            .handle_received_message("dev-b", r#"{"type":"teleport","from":"dev-b"}"#)
            .await;
        h.manager
            .handle_received_message("dev-b", r#"{"type":"alert","from":"dev-b","hops":1}"#)
            .await;

        assert!(h.drain_events().is_empty());
        assert_eq!(h.manager.peers.len(), 1);
    }

    // ------------------------------------------------------------------------
    // Health, updates and lifecycle
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_stale_peer_is_disconnected() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        h.connect("dev-b").await;
        h.drain_events();

        let later = Instant::now() + Duration::from_secs(31);
        let dropped = h.manager.run_heartbeat(later).await;

        assert_eq!(dropped, vec!["dev-b".to_string()]);
        assert!(h.manager.peers.is_empty());
        assert_eq!(
            h.drain_events(),
            vec![MeshEvent::PeerDisconnected {
                peer_id: "dev-b".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_unanswered_attempt_expires_and_frees_capacity() {
        let config = MeshConfig {
            max_peers: 1,
            ..Default::default()
        };
        let mut h = Harness::new("dev-a", config).await;
        h.manager.handle_discovered_device(remote("dev-b")).await;
        h.manager.handle_discovered_device(remote("dev-c")).await;
        assert!(h.manager.connecting.contains_key("dev-b"));
        assert!(!h.manager.connecting.contains_key("dev-c"));
        h.drain_events();

        // A young attempt survives the health check
        h.manager.run_heartbeat(Instant::now()).await;
        assert!(h.manager.connecting.contains_key("dev-b"));

        let later = Instant::now() + Duration::from_secs(31);
        h.manager.run_heartbeat(later).await;

        assert!(h.manager.connecting.is_empty());
        assert!(*h.factory.session("dev-b").closed.lock());
        assert!(matches!(
            h.drain_events().as_slice(),
            [MeshEvent::ConnectionError { peer_id, .. }] if peer_id == "dev-b"
        ));

        h.manager.handle_discovered_device(remote("dev-c")).await;
        assert!(h.manager.connecting.contains_key("dev-c"));
    }

    #[tokio::test]
    async fn test_peer_left_cancels_attempt() {
        let config = MeshConfig {
            max_peers: 1,
            ..Default::default()
        };
        let mut h = Harness::new("dev-a", config).await;
        h.manager.handle_discovered_device(remote("dev-b")).await;
        h.drain_events();

        h.manager
            .handle_signaling_event(SignalingEvent::PeerLeft("dev-b".to_string()))
            .await;

        assert!(h.manager.connecting.is_empty());
        assert!(!h.manager.discovered.contains_key("dev-b"));
        assert!(matches!(
            h.drain_events().as_slice(),
            [MeshEvent::ConnectionError { peer_id, .. }] if peer_id == "dev-b"
        ));
        assert!(h.manager.connect_to_peer("dev-c").await.is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_peer_alive() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        let b = h.connect("dev-b").await;

        let dropped = h.manager.run_heartbeat(Instant::now()).await;
        assert!(dropped.is_empty());
        assert!(b
            .sent_payloads()
            .iter()
            .any(|p| matches!(p, Payload::Heartbeat { .. })));

        let heartbeat = Envelope::new("dev-b", Payload::Heartbeat { device_info: remote("dev-b") });
        h.manager
            .handle_received_message("dev-b", &crate::message::encode_envelope(&heartbeat).unwrap())
            .await;
        assert_eq!(
            h.manager.peers["dev-b"].info.as_ref().map(|i| i.id.as_str()),
            Some("dev-b")
        );
    }

    #[tokio::test]
    async fn test_update_location_is_broadcast() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        let b = h.connect("dev-b").await;

        h.manager
            .update_location(Location {
                latitude: 29.76,
                longitude: -95.37,
                accuracy: Some(12.0),
            })
            .await;

        assert!(h.manager.device().location.is_some());
        assert!(b.sent_payloads().iter().any(|p| matches!(
            p,
            Payload::DeviceUpdate { device_info } if device_info.location.is_some()
        )));
    }

    #[tokio::test]
    async fn test_device_update_replaces_peer_record() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        h.connect("dev-b").await;
        h.drain_events();

        let mut updated = remote("dev-b");
        updated.name = "Bravo (moved)".to_string();
        let frame = Envelope::new(
            "dev-b",
            Payload::DeviceUpdate {
                device_info: updated.clone(),
            },
        );
        h.manager
            .handle_received_message("dev-b", &crate::message::encode_envelope(&frame).unwrap())
            .await;

        assert_eq!(h.drain_events(), vec![MeshEvent::DeviceUpdated(updated)]);
        assert_eq!(
            h.manager.network_status().peers[0].name.as_deref(),
            Some("Bravo (moved)")
        );
    }

    #[tokio::test]
    async fn test_network_status_snapshot() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        h.connect("dev-b").await;
        h.manager
            .handle_discovered_device(remote("sensor-1").with_capabilities(["telemetry"]))
            .await;
        h.manager.share_alert(Alert::new("a1")).await.unwrap();

        let status = h.manager.network_status();
        assert!(status.is_active);
        assert_eq!(status.device_id, "dev-a");
        assert_eq!(status.connected_peers, 1);
        assert_eq!(status.discovered_devices, 1);
        assert_eq!(status.cached_alerts, 1);
        assert_eq!(status.peers[0].state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut h = Harness::new("dev-a", MeshConfig::default()).await;
        let b = h.connect("dev-b").await;
        h.manager.share_alert(Alert::new("a1")).await.unwrap();
        h.drain_events();

        h.manager.shutdown().await;
        let first = h.drain_events();
        h.manager.shutdown().await;

        assert!(*b.closed.lock());
        assert_eq!(
            first,
            vec![
                MeshEvent::PeerDisconnected {
                    peer_id: "dev-b".to_string()
                },
                MeshEvent::NetworkStopped,
            ]
        );
        assert!(h.drain_events().is_empty());

        let status = h.manager.network_status();
        assert!(!status.is_active);
        assert_eq!(status.connected_peers, 0);
        assert_eq!(status.cached_alerts, 0);
    }

    #[tokio::test]
    async fn test_shutdown_without_initialize() {
        let (peer_tx, _peer_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut manager = MeshManager::new(
            remote("dev-a"),
            MeshConfig::default(),
            Arc::new(RecordingSignaling::default()),
            Arc::new(RecordingFactory::default()),
            peer_tx,
            event_tx,
        );

        manager.shutdown().await;
        assert!(!manager.is_active());
        assert!(event_rx.try_recv().is_err());
    }
}
