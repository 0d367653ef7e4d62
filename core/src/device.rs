// Device identity: who this node is and what it advertises to the mesh

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Capability advertised by devices that accept and forward alerts.
pub const CAPABILITY_ALERTS: &str = "alerts";
/// Capability advertised by devices willing to relay for others.
pub const CAPABILITY_RELAY: &str = "relay";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Geographic position reported by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters, when the platform reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

/// Identity and capabilities of a device, as exchanged on the wire.
///
/// The local instance is created once by the mesh manager and only changes
/// through `update_location`. Remote instances are replaced wholesale whenever
/// a newer copy arrives in a discovery, handshake, heartbeat or device update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable device identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Device class (e.g. "mobile", "desktop", "gateway")
    #[serde(rename = "type")]
    pub device_type: String,
    /// Advertised capabilities
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Epoch milliseconds of the last update to this record
    pub timestamp: u64,
}

impl DeviceInfo {
    /// Create a device record advertising the default `alerts` + `relay` capabilities
    pub fn new(id: impl Into<String>, name: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device_type: device_type.into(),
            capabilities: [CAPABILITY_ALERTS, CAPABILITY_RELAY]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            location: None,
            timestamp: now_millis(),
        }
    }

    /// Replace the advertised capability set
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Whether this device takes part in alert exchange
    pub fn accepts_alerts(&self) -> bool {
        self.has_capability(CAPABILITY_ALERTS)
    }
}

/// A device observed through a discovery broadcast but not (yet) connected.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub info: DeviceInfo,
    /// Epoch milliseconds when the entry was last inserted or refreshed
    pub discovered_at: u64,
}

impl DiscoveredDevice {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            discovered_at: now_millis(),
        }
    }

    /// Whether this entry has gone unrefreshed for longer than `max_age_ms`
    pub fn is_stale(&self, now_ms: u64, max_age_ms: u64) -> bool {
        now_ms.saturating_sub(self.discovered_at) > max_age_ms
    }
}
