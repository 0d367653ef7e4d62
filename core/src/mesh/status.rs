// Read-only snapshots for status displays

use crate::transport::ConnectionState;
use serde::Serialize;

/// Summary of one connected peer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: String,
    /// Display name from the peer's last handshake, heartbeat or discovery
    pub name: Option<String>,
    pub state: ConnectionState,
    /// Epoch milliseconds when the channel opened
    pub connected_at: u64,
    pub last_heartbeat_ms_ago: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub is_active: bool,
    pub device_id: String,
    pub connected_peers: usize,
    pub discovered_devices: usize,
    /// Connection attempts still negotiating
    pub connecting: usize,
    pub cached_alerts: usize,
    pub peers: Vec<PeerSummary>,
}
