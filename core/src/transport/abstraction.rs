//! Transport abstraction layer for alertmesh
//!
//! Defines the negotiation vocabulary (session descriptions, ICE candidates,
//! connection states) and the seam between a [`TransportConnection`] and the
//! backend that actually moves bytes.
//!
//! [`TransportConnection`]: super::connection::TransportConnection

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Per-peer connection state.
///
/// `New → Connecting → Connected`, then one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Whether the manager must tear the peer down on observing this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Which side of the offer/answer exchange a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Creates the data channel and the offer
    Initiator,
    /// Receives the offer and answers it
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged over signaling (`{type, sdp}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickle ICE candidate in its JSON init form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Notifications a session backend pushes to its owning connection
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// Local description produced; always sent before it is applied locally so
    /// it precedes every candidate it triggers
    LocalDescription(SessionDescription),
    LocalIceCandidate(IceCandidate),
    StateChanged(ConnectionState),
    /// Text frame received on the channel
    Message(String),
    Error(String),
}

/// Sender half handed to a backend when its session is opened
pub type SignalSink = mpsc::UnboundedSender<SessionSignal>;

/// Transport error types
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Channel not open")]
    ChannelNotOpen,

    #[error("Connection closed")]
    Closed,

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// One negotiated channel to one peer.
///
/// Implementations report everything asynchronous (state changes, gathered
/// candidates, inbound frames) through the [`SignalSink`] they were opened
/// with.
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Create an offer, emit it, and set it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create an answer, emit it, and set it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply the remote side's offer or answer
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Write one text frame to the channel without queueing
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    /// Current round-trip time, when the backend measures one
    async fn round_trip_time(&self) -> Option<Duration>;
}

/// Creates sessions for a given peer and role
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        peer_id: &str,
        role: SessionRole,
        signals: SignalSink,
    ) -> Result<Arc<dyn PeerSession>, TransportError>;
}
