// Message types: the wire envelope shared by the rendezvous channel and
// direct peer channels

use crate::device::{now_millis, DeviceInfo};
use crate::message::Alert;
use crate::transport::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};

/// A message as it travels on the wire.
///
/// Serialized as a flat JSON object:
/// `{ type, from, to?, messageId, timestamp, ...type-specific fields }`.
/// Envelopes are never persisted; they exist only on the wire and while being
/// dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending device id (empty for messages originated by the signaling server)
    #[serde(default)]
    pub from: String,
    /// Target device id for point-to-point messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Unique message ID (UUID v4)
    #[serde(rename = "messageId", default)]
    pub message_id: String,
    /// Epoch milliseconds at the sender
    #[serde(default)]
    pub timestamp: u64,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    /// Wrap a payload with a fresh message id and the current timestamp
    pub fn new(from: impl Into<String>, payload: Payload) -> Self {
        Self {
            from: from.into(),
            to: None,
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            payload,
        }
    }

    /// Address the envelope to a single device
    pub fn to(mut self, peer_id: impl Into<String>) -> Self {
        self.to = Some(peer_id.into());
        self
    }

    pub fn message_type(&self) -> &'static str {
        self.payload.message_type()
    }
}

/// Type-specific body of an envelope, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    /// Periodic announcement of a device to whoever can hear it
    #[serde(rename = "discovery")]
    Discovery {
        #[serde(rename = "deviceInfo")]
        device_info: DeviceInfo,
    },
    /// First message on a freshly opened peer channel
    #[serde(rename = "handshake")]
    Handshake {
        #[serde(rename = "deviceInfo")]
        device_info: DeviceInfo,
        #[serde(rename = "alertCount")]
        alert_count: usize,
    },
    /// Liveness ping between connected peers
    #[serde(rename = "heartbeat")]
    Heartbeat {
        #[serde(rename = "deviceInfo")]
        device_info: DeviceInfo,
    },
    /// An alert being flooded through the mesh
    #[serde(rename = "alert")]
    Alert {
        alert: Alert,
        hops: u32,
        #[serde(rename = "maxHops")]
        max_hops: u32,
        #[serde(rename = "originDevice")]
        origin_device: String,
    },
    /// A peer's device record changed (e.g. new location)
    #[serde(rename = "deviceUpdate")]
    DeviceUpdate {
        #[serde(rename = "deviceInfo")]
        device_info: DeviceInfo,
    },
    #[serde(rename = "offer")]
    Offer { offer: SessionDescription },
    #[serde(rename = "answer")]
    Answer { answer: SessionDescription },
    #[serde(rename = "ice-candidate")]
    IceCandidate { candidate: IceCandidate },
    /// Point-to-point relay through the signaling server
    #[serde(rename = "peer-message")]
    PeerMessage { payload: Box<Payload> },
    /// Devices currently registered with the signaling server
    #[serde(rename = "peer-list")]
    PeerList { peers: Vec<String> },
    #[serde(rename = "peer-joined")]
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    #[serde(rename = "peer-left")]
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// Registration of this device with the signaling server
    #[serde(rename = "register")]
    Register {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    /// Error reported by the signaling server
    #[serde(rename = "error")]
    Error { message: String },
}

/// Every `type` tag understood by this node.
pub const KNOWN_MESSAGE_TYPES: &[&str] = &[
    "discovery",
    "handshake",
    "heartbeat",
    "alert",
    "deviceUpdate",
    "offer",
    "answer",
    "ice-candidate",
    "peer-message",
    "peer-list",
    "peer-joined",
    "peer-left",
    "register",
    "error",
];

impl Payload {
    /// Wire name of this payload's `type`
    pub fn message_type(&self) -> &'static str {
        match self {
            Payload::Discovery { .. } => "discovery",
            Payload::Handshake { .. } => "handshake",
            Payload::Heartbeat { .. } => "heartbeat",
            Payload::Alert { .. } => "alert",
            Payload::DeviceUpdate { .. } => "deviceUpdate",
            Payload::Offer { .. } => "offer",
            Payload::Answer { .. } => "answer",
            Payload::IceCandidate { .. } => "ice-candidate",
            Payload::PeerMessage { .. } => "peer-message",
            Payload::PeerList { .. } => "peer-list",
            Payload::PeerJoined { .. } => "peer-joined",
            Payload::PeerLeft { .. } => "peer-left",
            Payload::Register { .. } => "register",
            Payload::Error { .. } => "error",
        }
    }
}
