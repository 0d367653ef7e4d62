// Signaling client: the WebSocket rendezvous channel used before a direct
// peer channel exists
//
// The socket is owned by two tasks: a writer draining an outbound channel and a
// supervisor that runs the read loop and, when the socket drops abnormally,
// the reconnect back-off. Callers only touch the outbound sender and the
// pending queue, both behind locks, so `send` never awaits.

use super::backoff::ReconnectPolicy;
use crate::config::SignalingConfig;
use crate::message::{decode_envelope, encode_envelope, CodecError, Envelope, Payload};
use crate::transport::{IceCandidate, SessionDescription};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReader = futures::stream::SplitStream<WsStream>;
type WsWriter = futures::stream::SplitSink<WsStream, Message>;

/// Close code of a clean shutdown; no reconnect follows it
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to connect to signaling server: {0}")]
    Connect(String),

    #[error("Failed to encode signaling message: {0}")]
    Encode(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Disconnected,
    Connecting,
    Open,
    /// Closed for good: manual disconnect, clean close or exhausted retries
    Closed,
}

/// Everything the rendezvous channel reports upward
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Connected,
    Disconnected { code: Option<u16>, reason: String },
    /// Back-off exhausted; no further attempts are made
    ReconnectFailed { attempts: u32 },
    Offer { from: String, offer: SessionDescription },
    Answer { from: String, answer: SessionDescription },
    IceCandidate { from: String, candidate: IceCandidate },
    /// Any other payload relayed point-to-point
    PeerMessage { from: String, payload: Payload },
    PeerList(Vec<String>),
    PeerJoined(String),
    PeerLeft(String),
    ServerError(String),
    /// Broadcast envelope from another device (discovery arrives this way)
    Relay(Envelope),
}

/// Outbound half of the rendezvous channel as seen by the mesh manager
pub trait SignalingLink: Send + Sync {
    /// Broadcast through the server; returns `false` when the message was queued
    fn send(&self, payload: Payload) -> bool;

    /// Relay to one device through the server; returns `false` when queued
    fn send_to_peer(&self, peer_id: &str, payload: Payload) -> bool;
}

struct Inner {
    device_id: String,
    config: SignalingConfig,
    state: RwLock<SignalingState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<VecDeque<String>>,
    policy: Mutex<ReconnectPolicy>,
    manual_close: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<SignalingEvent>,
}

/// Client side of the rendezvous channel. Cheap to clone.
#[derive(Clone)]
pub struct SignalingService {
    inner: Arc<Inner>,
}

impl SignalingService {
    pub fn new(
        device_id: impl Into<String>,
        config: SignalingConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let policy = ReconnectPolicy::from_config(&config);
        let inner = Inner {
            device_id: device_id.into(),
            config,
            state: RwLock::new(SignalingState::Disconnected),
            outbound: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            policy: Mutex::new(policy),
            manual_close: AtomicBool::new(false),
            supervisor: Mutex::new(None),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn state(&self) -> SignalingState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SignalingState::Open
    }

    /// Messages waiting for the channel to open
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Open the channel, register and flush the queue.
    ///
    /// When the dial fails the error is returned and the back-off keeps
    /// retrying in the background.
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let url = self.inner.config.url.clone();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(SignalingError::InvalidUrl(url));
        }

        self.inner.manual_close.store(false, Ordering::SeqCst);
        if let Some(previous) = self.inner.supervisor.lock().take() {
            previous.abort();
        }
        self.inner.detach();
        self.inner.set_state(SignalingState::Connecting);

        let result = match dial(&url).await {
            Ok(ws) => {
                let reader = Inner::attach(&self.inner, ws);
                Ok(reader)
            }
            Err(e) => {
                warn!("Signaling connect to {} failed: {}", url, e);
                self.inner.set_state(SignalingState::Disconnected);
                Err(e)
            }
        };

        let (reader, outcome) = match result {
            Ok(reader) => (Some(reader), Ok(())),
            Err(e) => (None, Err(e)),
        };
        let handle = tokio::spawn(supervise(Arc::clone(&self.inner), reader));
        *self.inner.supervisor.lock() = Some(handle);
        outcome
    }

    /// Close cleanly (code 1000); no reconnection follows
    pub fn disconnect(&self) {
        self.inner.manual_close.store(true, Ordering::SeqCst);
        if let Some(supervisor) = self.inner.supervisor.lock().take() {
            supervisor.abort();
        }

        let was_open = self.state() == SignalingState::Open;
        if let Some(outbound) = self.inner.outbound.lock().take() {
            let _ = outbound.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            })));
        }
        self.inner.set_state(SignalingState::Closed);

        if was_open {
            info!("Signaling channel closed");
            self.inner.emit(SignalingEvent::Disconnected {
                code: Some(NORMAL_CLOSURE),
                reason: "client disconnect".to_string(),
            });
        }
    }

    /// Broadcast a payload through the server
    pub fn send(&self, payload: Payload) -> bool {
        let envelope = Envelope::new(self.inner.device_id.clone(), payload);
        self.inner.transmit(&envelope)
    }

    /// Relay a payload to one device, wrapped as `peer-message`
    pub fn send_to_peer(&self, peer_id: &str, payload: Payload) -> bool {
        let envelope = Envelope::new(
            self.inner.device_id.clone(),
            Payload::PeerMessage {
                payload: Box::new(payload),
            },
        )
        .to(peer_id);
        self.inner.transmit(&envelope)
    }
}

impl SignalingLink for SignalingService {
    fn send(&self, payload: Payload) -> bool {
        SignalingService::send(self, payload)
    }

    fn send_to_peer(&self, peer_id: &str, payload: Payload) -> bool {
        SignalingService::send_to_peer(self, peer_id, payload)
    }
}

impl Inner {
    fn set_state(&self, state: SignalingState) {
        *self.state.write() = state;
    }

    fn emit(&self, event: SignalingEvent) {
        let _ = self.events.send(event);
    }

    /// Take over a freshly opened socket: start the writer, register, flush
    fn attach(inner: &Arc<Inner>, ws: WsStream) -> WsReader {
        let (writer, reader) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, rx));

        let register = Envelope::new(
            inner.device_id.clone(),
            Payload::Register {
                device_id: inner.device_id.clone(),
            },
        );
        match encode_envelope(&register) {
            Ok(text) => {
                let _ = tx.send(Message::Text(text));
            }
            Err(e) => warn!("Failed to encode register message: {}", e),
        }

        inner.open_channel(tx);
        inner.policy.lock().reset();

        info!("Signaling channel open to {}", inner.config.url);
        inner.emit(SignalingEvent::Connected);
        reader
    }

    fn detach(&self) {
        self.outbound.lock().take();
        if *self.state.read() == SignalingState::Open {
            self.set_state(SignalingState::Disconnected);
        }
    }

    fn transmit(&self, envelope: &Envelope) -> bool {
        let text = match encode_envelope(envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping {} message: {}", envelope.message_type(), e);
                return false;
            }
        };

        // The queue lock is held across the state check so a direct send can
        // never overtake messages still waiting to be flushed
        let mut pending = self.pending.lock();
        if *self.state.read() == SignalingState::Open {
            if let Some(outbound) = self.outbound.lock().as_ref() {
                match outbound.send(Message::Text(text)) {
                    Ok(()) => return true,
                    Err(mpsc::error::SendError(message)) => {
                        if let Message::Text(text) = message {
                            self.enqueue(&mut pending, text);
                        }
                        return false;
                    }
                }
            }
        }

        debug!("Signaling not open, queueing {}", envelope.message_type());
        self.enqueue(&mut pending, text);
        false
    }

    fn enqueue(&self, pending: &mut VecDeque<String>, text: String) {
        let max = self.config.max_pending_messages;
        if max == 0 {
            warn!("Pending queue disabled, dropping signaling message");
            return;
        }
        while pending.len() >= max {
            pending.pop_front();
            warn!("Pending signaling queue full ({}), dropped oldest message", max);
        }
        pending.push_back(text);
    }

    /// Make `tx` the open channel. The queue is drained into it first, under
    /// the queue lock, and only then does the channel become visible as open.
    fn open_channel(&self, tx: mpsc::UnboundedSender<Message>) -> usize {
        let mut pending = self.pending.lock();
        let flushed = Self::drain_pending(&mut pending, &tx);
        *self.outbound.lock() = Some(tx);
        self.set_state(SignalingState::Open);
        flushed
    }

    /// Drain the pending queue in order; a failed write puts the message back
    /// at the front and stops.
    fn drain_pending(
        pending: &mut VecDeque<String>,
        outbound: &mpsc::UnboundedSender<Message>,
    ) -> usize {
        let mut flushed = 0;
        while let Some(text) = pending.pop_front() {
            if let Err(mpsc::error::SendError(message)) = outbound.send(Message::Text(text)) {
                if let Message::Text(text) = message {
                    pending.push_front(text);
                }
                warn!("Flush interrupted, {} messages still pending", pending.len());
                break;
            }
            flushed += 1;
        }
        if flushed > 0 {
            debug!("Flushed {} pending signaling messages", flushed);
        }
        flushed
    }

    fn dispatch(&self, raw: &str) {
        let envelope = match decode_envelope(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping signaling message: {}", e);
                return;
            }
        };

        let from = envelope.from;
        let event = match envelope.payload {
            Payload::PeerMessage { payload } => match *payload {
                Payload::Offer { offer } => SignalingEvent::Offer { from, offer },
                Payload::Answer { answer } => SignalingEvent::Answer { from, answer },
                Payload::IceCandidate { candidate } => {
                    SignalingEvent::IceCandidate { from, candidate }
                }
                payload => SignalingEvent::PeerMessage { from, payload },
            },
            Payload::Offer { offer } => SignalingEvent::Offer { from, offer },
            Payload::Answer { answer } => SignalingEvent::Answer { from, answer },
            Payload::IceCandidate { candidate } => SignalingEvent::IceCandidate { from, candidate },
            Payload::PeerList { peers } => SignalingEvent::PeerList(peers),
            Payload::PeerJoined { peer_id } => SignalingEvent::PeerJoined(peer_id),
            Payload::PeerLeft { peer_id } => SignalingEvent::PeerLeft(peer_id),
            Payload::Error { message } => {
                warn!("Signaling server error: {}", message);
                SignalingEvent::ServerError(message)
            }
            payload => SignalingEvent::Relay(Envelope {
                from,
                to: envelope.to,
                message_id: envelope.message_id,
                timestamp: envelope.timestamp,
                payload,
            }),
        };
        self.emit(event);
    }
}

async fn dial(url: &str) -> Result<WsStream, SignalingError> {
    let (ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| SignalingError::Connect(e.to_string()))?;
    Ok(ws)
}

async fn write_loop(mut writer: WsWriter, mut outbound: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = writer.send(message).await {
            debug!("Signaling write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = writer.close().await;
}

/// Read until the socket closes; returns the close code and reason, if any
async fn read_loop(inner: &Inner, mut reader: WsReader) -> (Option<u16>, String) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => inner.dispatch(&text),
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => inner.dispatch(&text),
                Err(_) => warn!("Dropping non-UTF-8 signaling frame"),
            },
            Ok(Message::Close(frame)) => {
                return match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                    None => (None, String::new()),
                };
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Signaling read error: {}", e);
                return (None, e.to_string());
            }
        }
    }
    (None, "connection dropped".to_string())
}

/// Read loop plus reconnect back-off. Ends on a clean close, a manual
/// disconnect, or when the policy gives up.
async fn supervise(inner: Arc<Inner>, mut reader: Option<WsReader>) {
    loop {
        if let Some(stream) = reader.take() {
            let (code, reason) = read_loop(&inner, stream).await;
            inner.detach();
            info!("Signaling channel closed (code {:?}): {}", code, reason);
            inner.emit(SignalingEvent::Disconnected {
                code,
                reason: reason.clone(),
            });

            if inner.manual_close.load(Ordering::SeqCst) || code == Some(NORMAL_CLOSURE) {
                inner.set_state(SignalingState::Closed);
                return;
            }
        }

        let next = {
            let mut policy = inner.policy.lock();
            policy.next_delay().map(|delay| (delay, policy.attempts(), policy.max_attempts()))
        };
        let (delay, attempt, max_attempts) = match next {
            Some(next) => next,
            None => {
                let attempts = inner.policy.lock().attempts();
                warn!("Giving up on signaling after {} reconnect attempts", attempts);
                inner.set_state(SignalingState::Closed);
                inner.emit(SignalingEvent::ReconnectFailed { attempts });
                return;
            }
        };

        info!(
            "Reconnecting to signaling in {:?} (attempt {}/{})",
            delay, attempt, max_attempts
        );
        tokio::time::sleep(delay).await;
        if inner.manual_close.load(Ordering::SeqCst) {
            return;
        }

        inner.set_state(SignalingState::Connecting);
        match dial(&inner.config.url).await {
            Ok(ws) => reader = Some(Inner::attach(&inner, ws)),
            Err(e) => {
                warn!("Signaling reconnect attempt {} failed: {}", attempt, e);
                inner.set_state(SignalingState::Disconnected);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
