// Events the mesh reports to the application layer

use crate::device::DeviceInfo;
use crate::message::CachedAlert;

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// `initialize` completed; timers are running
    NetworkStarted { device_id: String },
    /// `shutdown` completed
    NetworkStopped,
    /// A device was seen for the first time or announced a newer record
    DeviceDiscovered(DeviceInfo),
    /// Direct channel to a peer is open and the handshake was sent
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },
    /// A peer introduced itself on the direct channel
    PeerHandshake {
        peer_id: String,
        device_info: DeviceInfo,
        alert_count: usize,
    },
    /// A connection attempt failed; no retry is scheduled
    ConnectionError { peer_id: String, error: String },
    /// An alert from the local alert source was cached and broadcast
    AlertShared(CachedAlert),
    /// A new alert arrived from the mesh
    AlertReceived(CachedAlert),
    /// A known device changed its record (e.g. location)
    DeviceUpdated(DeviceInfo),
    /// The rendezvous channel gave up reconnecting
    SignalingReconnectFailed { attempts: u32 },
}
