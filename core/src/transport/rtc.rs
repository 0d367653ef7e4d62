// WebRTC backend: one RTCPeerConnection with a single "alerts" data channel
// per peer

use super::abstraction::{
    ConnectionState, IceCandidate, PeerSession, SdpKind, SessionDescription, SessionFactory,
    SessionRole, SessionSignal, SignalSink, TransportError,
};
use crate::config::TransportConfig;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

/// Label of the one data channel opened per peer
pub const DATA_CHANNEL_LABEL: &str = "alerts";

fn negotiation(e: impl std::fmt::Display) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

/// Map a peer-connection state onto ours.
///
/// `Connected` is deliberately absent: the session reports it once the data
/// channel opens, which is when `send` can succeed.
fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Connected | RTCPeerConnectionState::Unspecified => None,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp).map_err(negotiation),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp).map_err(negotiation),
    }
}

fn from_rtc_description(description: &RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp.clone())),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp.clone())),
        other => Err(TransportError::Negotiation(format!(
            "unsupported description type {:?}",
            other
        ))),
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// Opens WebRTC sessions sharing one configured API instance
pub struct RtcSessionFactory {
    api: Arc<API>,
    config: TransportConfig,
}

impl RtcSessionFactory {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::Internal(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api: Arc::new(api),
            config,
        })
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect()
    }
}

#[async_trait]
impl SessionFactory for RtcSessionFactory {
    async fn open(
        &self,
        peer_id: &str,
        role: SessionRole,
        signals: SignalSink,
    ) -> Result<Arc<dyn PeerSession>, TransportError> {
        let pc = self
            .api
            .new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers(),
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", peer_id, e)))?;

        let session = Arc::new(RtcSession {
            pc: Arc::new(pc),
            channel: Arc::new(RwLock::new(None)),
            signals,
        });
        session.install_handlers();

        match role {
            SessionRole::Initiator => {
                let init = RTCDataChannelInit {
                    ordered: Some(self.config.ordered),
                    max_retransmits: Some(self.config.max_retransmits),
                    ..Default::default()
                };
                let channel = session
                    .pc
                    .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
                    .await
                    .map_err(negotiation)?;
                RtcSession::attach_channel(&session.channel, &session.signals, channel);
            }
            SessionRole::Responder => {
                let slot = Arc::clone(&session.channel);
                let sink = session.signals.clone();
                session.pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                    let slot = Arc::clone(&slot);
                    let sink = sink.clone();
                    Box::pin(async move {
                        debug!("Remote opened data channel '{}'", channel.label());
                        RtcSession::attach_channel(&slot, &sink, channel);
                    })
                }));
            }
        }

        info!("Opened WebRTC session for {} as {:?}", peer_id, role);
        Ok(session)
    }
}

/// A single WebRTC peer connection
pub struct RtcSession {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    signals: SignalSink,
}

impl RtcSession {
    fn install_handlers(&self) {
        let sink = self.signals.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    if let Some(state) = map_state(state) {
                        let _ = sink.send(SessionSignal::StateChanged(state));
                    }
                })
            }));

        let sink = self.signals.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = sink.clone();
                Box::pin(async move {
                    // None marks the end of gathering
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = sink.send(SessionSignal::LocalIceCandidate(init.into()));
                        }
                        Err(e) => {
                            let _ = sink.send(SessionSignal::Error(format!(
                                "candidate serialization failed: {}",
                                e
                            )));
                        }
                    }
                })
            }));
    }

    fn attach_channel(
        slot: &RwLock<Option<Arc<RTCDataChannel>>>,
        sink: &SignalSink,
        channel: Arc<RTCDataChannel>,
    ) {
        let open_sink = sink.clone();
        channel.on_open(Box::new(move || {
            Box::pin(async move {
                let _ = open_sink.send(SessionSignal::StateChanged(ConnectionState::Connected));
            })
        }));

        let message_sink = sink.clone();
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            let message_sink = message_sink.clone();
            Box::pin(async move {
                match String::from_utf8(message.data.to_vec()) {
                    Ok(text) => {
                        let _ = message_sink.send(SessionSignal::Message(text));
                    }
                    Err(_) => {
                        let _ = message_sink
                            .send(SessionSignal::Error("non-UTF-8 frame received".to_string()));
                    }
                }
            })
        }));

        // The channel may have opened before the handler was registered
        if channel.ready_state() == RTCDataChannelState::Open {
            let _ = sink.send(SessionSignal::StateChanged(ConnectionState::Connected));
        }
        *slot.write() = Some(channel);
    }

    async fn apply_local(&self, description: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
        let ours = from_rtc_description(&description)?;
        let _ = self
            .signals
            .send(SessionSignal::LocalDescription(ours.clone()));
        self.pc
            .set_local_description(description)
            .await
            .map_err(negotiation)?;
        Ok(ours)
    }
}

#[async_trait]
impl PeerSession for RtcSession {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        self.apply_local(offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        self.apply_local(answer).await
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(negotiation)
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let channel = self
            .channel
            .read()
            .clone()
            .ok_or(TransportError::ChannelNotOpen)?;
        if channel.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::ChannelNotOpen);
        }
        channel
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let channel = self.channel.write().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                debug!("Data channel close reported: {}", e);
            }
        }
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Internal(e.to_string()))
    }

    async fn round_trip_time(&self) -> Option<Duration> {
        let stats = self.pc.get_stats().await;
        stats.reports.values().find_map(|report| match report {
            StatsReportType::CandidatePair(pair) if pair.nominated => {
                Some(Duration::from_secs_f64(pair.current_round_trip_time.max(0.0)))
            }
            _ => None,
        })
    }
}
