// Alert payloads and their cached form

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An emergency alert as handed over by an alert source.
///
/// The mesh only relies on `id`; every other field is carried through
/// untouched so producers and consumers can evolve their schema freely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Alert {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Attach an arbitrary field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Build an alert from an arbitrary JSON value; requires a string `id`
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// An alert held in the local cache, with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedAlert {
    pub alert: Alert,
    /// Epoch milliseconds when this node shared or received the alert
    pub received_at: u64,
    /// Peer the alert arrived from; `None` when shared locally
    pub received_from: Option<String>,
    /// Relay steps the alert had taken when it reached this node
    pub hops: u32,
    /// Device that first shared the alert
    pub origin_device: String,
}

impl CachedAlert {
    pub fn alert_id(&self) -> &str {
        &self.alert.id
    }

    /// Whether this node is the alert's origin
    pub fn is_local(&self) -> bool {
        self.received_from.is_none()
    }
}
