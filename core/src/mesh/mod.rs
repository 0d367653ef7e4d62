// Mesh module: the node: peer tables, discovery, health and alert flooding

pub mod cache;
pub mod events;
pub mod manager;
pub mod runtime;
pub mod status;

pub use cache::AlertCache;
pub use events::MeshEvent;
pub use manager::{MeshManager, Peer};
pub use runtime::{start_mesh, MeshCommand, MeshHandle};
pub use status::{NetworkStatus, PeerSummary};
