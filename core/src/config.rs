// Mesh configuration: timers, capacities and endpoint settings
//
// All durations are carried as milliseconds so the struct round-trips through
// the JSON config file unchanged.

use crate::MeshError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for a mesh node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Interval between discovery broadcasts
    pub discovery_interval_ms: u64,
    /// Interval between heartbeats / peer health checks
    pub heartbeat_interval_ms: u64,
    /// Maximum number of connected peers
    pub max_peers: usize,
    /// Maximum number of relay steps for an alert
    pub max_hops: u32,
    /// Maximum number of alerts retained for duplicate suppression
    pub max_alert_cache_size: usize,
    /// Rendezvous channel settings
    pub signaling: SignalingConfig,
    /// Direct peer channel settings
    pub transport: TransportConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            discovery_interval_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            max_peers: 10,
            max_hops: 5,
            max_alert_cache_size: 100,
            signaling: SignalingConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl MeshConfig {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Age after which an unpromoted discovered device is purged
    pub fn discovery_stale_after(&self) -> Duration {
        self.discovery_interval() * 3
    }

    /// Age of the last heartbeat after which a peer is considered dead
    pub fn peer_stale_after(&self) -> Duration {
        self.heartbeat_interval() * 3
    }

    /// Reject configurations the mesh cannot run with
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.discovery_interval_ms == 0 {
            return Err(MeshError::InvalidConfig(
                "discovery_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(MeshError::InvalidConfig(
                "heartbeat_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_peers == 0 {
            return Err(MeshError::InvalidConfig("max_peers must be at least 1".to_string()));
        }
        if self.max_alert_cache_size == 0 {
            return Err(MeshError::InvalidConfig(
                "max_alert_cache_size must be at least 1".to_string(),
            ));
        }
        self.signaling.validate()
    }
}

/// Signaling (rendezvous) endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the rendezvous endpoint
    pub url: String,
    /// First reconnect delay; doubles on every further attempt
    pub reconnect_base_delay_ms: u64,
    /// Attempts before giving up and reporting `ReconnectFailed`
    pub max_reconnect_attempts: u32,
    /// Messages kept while the channel is down; oldest dropped beyond this
    pub max_pending_messages: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/signaling".to_string(),
            reconnect_base_delay_ms: 1_000,
            max_reconnect_attempts: 5,
            max_pending_messages: 256,
        }
    }
}

impl SignalingConfig {
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        if self.url.trim().is_empty() {
            return Err(MeshError::InvalidConfig("signaling url is empty".to_string()));
        }
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(MeshError::InvalidConfig(format!(
                "signaling url must use ws:// or wss://: {}",
                self.url
            )));
        }
        Ok(())
    }
}

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Direct peer channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// Request in-order delivery on the data channel
    pub ordered: bool,
    /// Bounded retransmission count for the data channel
    pub max_retransmits: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
            ordered: true,
            max_retransmits: 3,
        }
    }
}
