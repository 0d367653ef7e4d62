// Transport module: per-peer data channels and their backends

pub mod abstraction;
pub mod connection;
pub mod memory;
pub mod rtc;

pub use abstraction::{
    ConnectionState, IceCandidate, PeerSession, SdpKind, SessionDescription, SessionFactory,
    SessionRole, SessionSignal, SignalSink, TransportError,
};
pub use connection::{ConnectionEvent, ConnectionStats, PeerEvent, TransportConnection};
pub use memory::MemorySessionFactory;
pub use rtc::{RtcSessionFactory, DATA_CHANNEL_LABEL};
