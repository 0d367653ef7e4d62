// alertmesh core: peer-to-peer emergency alert propagation
//
// Three cooperating units:
// - transport: one negotiated point-to-point channel per peer
// - signaling: rendezvous channel used to set those channels up
// - mesh: identity, peer tables, discovery, health checks and alert flooding

pub mod config;
pub mod device;
pub mod mesh;
pub mod message;
pub mod signaling;
pub mod transport;

use thiserror::Error;

pub use config::{IceServerConfig, MeshConfig, SignalingConfig, TransportConfig};
pub use device::{DeviceInfo, DiscoveredDevice, Location, CAPABILITY_ALERTS, CAPABILITY_RELAY};
pub use mesh::{start_mesh, MeshEvent, MeshHandle, MeshManager, NetworkStatus, PeerSummary};
pub use message::{Alert, CachedAlert, Envelope, Payload};
pub use signaling::{SignalingEvent, SignalingLink, SignalingService};
pub use transport::{
    ConnectionState, MemorySessionFactory, RtcSessionFactory, SessionFactory, TransportConnection,
    TransportError,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Mesh already active")]
    AlreadyActive,

    #[error("Mesh not active")]
    NotActive,

    #[error("Peer table full ({0} peers)")]
    PeerTableFull(usize),

    #[error("Already connected or connecting to {0}")]
    AlreadyConnected(String),

    #[error("A device cannot connect to itself")]
    SelfConnection,

    #[error("Invalid alert: {0}")]
    InvalidAlert(String),

    #[error("Alert {0} already cached")]
    DuplicateAlert(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] signaling::SignalingError),

    #[error("Mesh task not running")]
    ChannelClosed,
}
