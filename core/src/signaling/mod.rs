// Signaling module: rendezvous channel and its reconnect policy

pub mod backoff;
pub mod client;

pub use backoff::ReconnectPolicy;
pub use client::{
    SignalingError, SignalingEvent, SignalingLink, SignalingService, SignalingState,
    NORMAL_CLOSURE,
};
