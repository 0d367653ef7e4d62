// Mesh task: the running node
//
// `start_mesh` moves a `MeshManager` onto its own task and drives it from one
// select loop: commands from `MeshHandle`, connection events from every peer,
// signaling events, and the discovery/heartbeat timers while active.

use super::events::MeshEvent;
use super::manager::MeshManager;
use super::status::NetworkStatus;
use crate::config::MeshConfig;
use crate::device::{DeviceInfo, Location};
use crate::message::{Alert, CachedAlert};
use crate::signaling::{SignalingEvent, SignalingLink};
use crate::transport::SessionFactory;
use crate::MeshError;
use std::future::pending;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tracing::{debug, info};

/// Commands that can be sent to the mesh task
#[derive(Debug)]
pub enum MeshCommand {
    Initialize {
        reply: mpsc::Sender<Result<(), MeshError>>,
    },
    Shutdown {
        reply: mpsc::Sender<()>,
    },
    /// Run a discovery round now
    DiscoverDevices,
    ConnectToPeer {
        peer_id: String,
        reply: mpsc::Sender<Result<(), MeshError>>,
    },
    DisconnectPeer {
        peer_id: String,
        reply: mpsc::Sender<()>,
    },
    ShareAlert {
        alert: Alert,
        reply: mpsc::Sender<Result<CachedAlert, MeshError>>,
    },
    UpdateLocation {
        location: Location,
        reply: mpsc::Sender<()>,
    },
    GetNetworkStatus {
        reply: mpsc::Sender<NetworkStatus>,
    },
    GetCachedAlerts {
        reply: mpsc::Sender<Vec<CachedAlert>>,
    },
}

/// Handle to communicate with the running mesh task
#[derive(Clone)]
pub struct MeshHandle {
    command_tx: mpsc::Sender<MeshCommand>,
}

impl MeshHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(mpsc::Sender<T>) -> MeshCommand,
    ) -> Result<T, MeshError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| MeshError::ChannelClosed)?;

        reply_rx.recv().await.ok_or(MeshError::ChannelClosed)
    }

    /// Go active: announce, then start discovery and heartbeat timers
    pub async fn initialize(&self) -> Result<(), MeshError> {
        self.request(|reply| MeshCommand::Initialize { reply }).await?
    }

    /// Disconnect every peer, clear all tables and stop the timers
    pub async fn shutdown(&self) -> Result<(), MeshError> {
        self.request(|reply| MeshCommand::Shutdown { reply }).await
    }

    pub async fn discover_devices(&self) -> Result<(), MeshError> {
        self.command_tx
            .send(MeshCommand::DiscoverDevices)
            .await
            .map_err(|_| MeshError::ChannelClosed)
    }

    pub async fn connect_to_peer(&self, peer_id: impl Into<String>) -> Result<(), MeshError> {
        let peer_id = peer_id.into();
        self.request(|reply| MeshCommand::ConnectToPeer { peer_id, reply })
            .await?
    }

    pub async fn disconnect_peer(&self, peer_id: impl Into<String>) -> Result<(), MeshError> {
        let peer_id = peer_id.into();
        self.request(|reply| MeshCommand::DisconnectPeer { peer_id, reply })
            .await
    }

    /// Cache an alert from the local alert source and flood it
    pub async fn share_alert(&self, alert: Alert) -> Result<CachedAlert, MeshError> {
        self.request(|reply| MeshCommand::ShareAlert { alert, reply })
            .await?
    }

    pub async fn update_location(&self, location: Location) -> Result<(), MeshError> {
        self.request(|reply| MeshCommand::UpdateLocation { location, reply })
            .await
    }

    pub async fn network_status(&self) -> Result<NetworkStatus, MeshError> {
        self.request(|reply| MeshCommand::GetNetworkStatus { reply })
            .await
    }

    /// Cached alerts, oldest first
    pub async fn cached_alerts(&self) -> Result<Vec<CachedAlert>, MeshError> {
        self.request(|reply| MeshCommand::GetCachedAlerts { reply })
            .await
    }
}

async fn next_tick(timer: Option<&mut Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn next_signal(
    events: Option<&mut mpsc::UnboundedReceiver<SignalingEvent>>,
) -> Option<SignalingEvent> {
    match events {
        Some(events) => events.recv().await,
        None => pending().await,
    }
}

fn periodic(period: std::time::Duration) -> Interval {
    let mut timer = interval_at(tokio::time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Start the mesh task for `device`.
///
/// The node stays inactive until [`MeshHandle::initialize`] is called. The task
/// shuts the node down and exits once every handle is dropped.
pub fn start_mesh(
    device: DeviceInfo,
    config: MeshConfig,
    signaling: Arc<dyn SignalingLink>,
    signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
    sessions: Arc<dyn SessionFactory>,
) -> Result<(MeshHandle, mpsc::UnboundedReceiver<MeshEvent>), MeshError> {
    config.validate()?;

    let (command_tx, mut command_rx) = mpsc::channel::<MeshCommand>(64);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();

    let mut manager = MeshManager::new(device, config, signaling, sessions, peer_tx, event_tx);
    let mut signaling_events = Some(signaling_events);

    tokio::spawn(async move {
        let mut discovery_timer: Option<Interval> = None;
        let mut heartbeat_timer: Option<Interval> = None;

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        debug!("All mesh handles dropped");
                        manager.shutdown().await;
                        break;
                    };
                    match command {
                        MeshCommand::Initialize { reply } => {
                            let result = manager.initialize().await;
                            if result.is_ok() {
                                discovery_timer = Some(periodic(manager.config().discovery_interval()));
                                heartbeat_timer = Some(periodic(manager.config().heartbeat_interval()));
                            }
                            let _ = reply.send(result).await;
                        }
                        MeshCommand::Shutdown { reply } => {
                            discovery_timer = None;
                            heartbeat_timer = None;
                            manager.shutdown().await;
                            let _ = reply.send(()).await;
                        }
                        MeshCommand::DiscoverDevices => manager.discover_devices(),
                        MeshCommand::ConnectToPeer { peer_id, reply } => {
                            let result = manager.connect_to_peer(&peer_id).await;
                            let _ = reply.send(result).await;
                        }
                        MeshCommand::DisconnectPeer { peer_id, reply } => {
                            manager.disconnect_peer(&peer_id).await;
                            let _ = reply.send(()).await;
                        }
                        MeshCommand::ShareAlert { alert, reply } => {
                            let result = manager.share_alert(alert).await;
                            let _ = reply.send(result).await;
                        }
                        MeshCommand::UpdateLocation { location, reply } => {
                            manager.update_location(location).await;
                            let _ = reply.send(()).await;
                        }
                        MeshCommand::GetNetworkStatus { reply } => {
                            let _ = reply.send(manager.network_status()).await;
                        }
                        MeshCommand::GetCachedAlerts { reply } => {
                            let _ = reply.send(manager.cached_alerts()).await;
                        }
                    }
                }

                Some(event) = peer_rx.recv() => {
                    manager.handle_peer_event(event).await;
                }

                event = next_signal(signaling_events.as_mut()) => {
                    match event {
                        Some(event) => manager.handle_signaling_event(event).await,
                        None => {
                            debug!("Signaling event channel closed");
                            signaling_events = None;
                        }
                    }
                }

                _ = next_tick(discovery_timer.as_mut()) => {
                    manager.discover_devices();
                }

                _ = next_tick(heartbeat_timer.as_mut()) => {
                    manager.run_heartbeat(std::time::Instant::now()).await;
                }
            }
        }

        info!("Mesh task for {} exited", manager.device().id);
    });

    Ok((MeshHandle { command_tx }, event_rx))
}
