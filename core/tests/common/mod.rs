//! Shared helpers for the integration tests: an in-process signaling hub with
//! configurable reachability, and small polling utilities.

#![allow(dead_code)]

use alertmesh_core::message::{Envelope, Payload};
use alertmesh_core::signaling::{SignalingEvent, SignalingLink};
use alertmesh_core::{start_mesh, DeviceInfo, MeshConfig, MeshEvent, MeshHandle, MemorySessionFactory};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Routes signaling traffic between nodes in one process.
///
/// Broadcasts only reach linked nodes, which lets a test build a line or star
/// topology; point-to-point messages reach any registered node.
#[derive(Default)]
pub struct SignalingHub {
    nodes: Mutex<HashMap<String, mpsc::UnboundedSender<SignalingEvent>>>,
    links: Mutex<HashSet<(String, String)>>,
}

impl SignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(
        self: &Arc<Self>,
        device_id: &str,
    ) -> (Arc<HubLink>, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.lock().insert(device_id.to_string(), tx);
        let link = Arc::new(HubLink {
            hub: Arc::clone(self),
            device_id: device_id.to_string(),
        });
        (link, rx)
    }

    /// Make broadcasts from either node audible to the other
    pub fn link(&self, a: &str, b: &str) {
        let mut links = self.links.lock();
        links.insert((a.to_string(), b.to_string()));
        links.insert((b.to_string(), a.to_string()));
    }

    fn deliver(&self, to: &str, event: SignalingEvent) {
        if let Some(tx) = self.nodes.lock().get(to) {
            let _ = tx.send(event);
        }
    }
}

pub struct HubLink {
    hub: Arc<SignalingHub>,
    device_id: String,
}

impl SignalingLink for HubLink {
    fn send(&self, payload: Payload) -> bool {
        let envelope = Envelope::new(self.device_id.clone(), payload);
        let targets: Vec<String> = self
            .hub
            .links
            .lock()
            .iter()
            .filter(|(from, _)| from == &self.device_id)
            .map(|(_, to)| to.clone())
            .collect();
        for target in targets {
            self.hub
                .deliver(&target, SignalingEvent::Relay(envelope.clone()));
        }
        true
    }

    fn send_to_peer(&self, peer_id: &str, payload: Payload) -> bool {
        let from = self.device_id.clone();
        let event = match payload {
            Payload::Offer { offer } => SignalingEvent::Offer { from, offer },
            Payload::Answer { answer } => SignalingEvent::Answer { from, answer },
            Payload::IceCandidate { candidate } => SignalingEvent::IceCandidate { from, candidate },
            payload => SignalingEvent::PeerMessage { from, payload },
        };
        self.hub.deliver(peer_id, event);
        true
    }
}

pub struct TestNode {
    pub id: String,
    pub handle: MeshHandle,
    pub events: mpsc::UnboundedReceiver<MeshEvent>,
}

/// Timers short enough for a test, long enough not to evict live peers
pub fn fast_config() -> MeshConfig {
    MeshConfig {
        discovery_interval_ms: 100,
        heartbeat_interval_ms: 200,
        ..Default::default()
    }
}

/// Route core logs through the test harness; filter with `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn spawn_node(
    hub: &Arc<SignalingHub>,
    sessions: &MemorySessionFactory,
    id: &str,
    config: MeshConfig,
) -> TestNode {
    init_tracing();
    let (link, signaling_events) = hub.register(id);
    let (handle, events) = start_mesh(
        DeviceInfo::new(id, id.to_uppercase(), "mobile"),
        config,
        link,
        signaling_events,
        Arc::new(sessions.clone()),
    )
    .expect("valid config");

    TestNode {
        id: id.to_string(),
        handle,
        events,
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Wait for the first event matching `predicate`
pub async fn wait_for_event<F>(
    events: &mut mpsc::UnboundedReceiver<MeshEvent>,
    timeout: Duration,
    mut predicate: F,
) -> Option<MeshEvent>
where
    F: FnMut(&MeshEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        while let Some(event) = events.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}
