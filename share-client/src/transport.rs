//! Relay transport: one WebSocket to `/room/<CODE>?peerId=<id>`, re-established with
//! exponential backoff. Failures surface only as connectivity state.

use std::borrow::Cow;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use share_core::{wire, ConnectivityState, Message, PeerId, RoomCode, TransferError};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// How long `close()` waits for the leave + close frame to go out.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect schedule: attempt n waits min(base * 2^n, max); give up after `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// What the transport hands to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(Message),
    Connectivity(ConnectivityState),
}

/// Anything that can put a message on the relay.
pub trait RelaySink: Send + Sync {
    fn send(&self, msg: Message) -> Result<(), TransferError>;
}

/// Endpoint URL for a room session.
pub fn endpoint(base: &str, room: &RoomCode, peer: &PeerId) -> String {
    format!(
        "{}/room/{}?peerId={}",
        base.trim_end_matches('/'),
        room,
        peer
    )
}

pub struct ReconnectingTransport {
    state: watch::Receiver<ConnectivityState>,
    outbound: watch::Receiver<Option<mpsc::UnboundedSender<Message>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Link {
    url: String,
    room: RoomCode,
    local: PeerId,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: watch::Sender<ConnectivityState>,
    outbound: watch::Sender<Option<mpsc::UnboundedSender<Message>>>,
    shutdown: watch::Receiver<bool>,
}

enum SessionEnd {
    /// Lost the connection. `welcomed` is false when the relay closed before admitting us.
    Dropped { welcomed: bool },
    Closed,
}

impl ReconnectingTransport {
    /// Start connecting in the background. Events arrive on the returned receiver, which
    /// ends once the transport has closed or given up.
    pub fn connect(
        base_url: &str,
        room: RoomCode,
        local: PeerId,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectivityState::Connecting);
        let (outbound_tx, outbound_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let link = Link {
            url: endpoint(base_url, &room, &local),
            room,
            local,
            policy,
            events: events_tx,
            state: state_tx,
            outbound: outbound_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(link.run());
        (
            Self {
                state: state_rx,
                outbound: outbound_rx,
                shutdown: shutdown_tx,
                task: Mutex::new(Some(task)),
            },
            events_rx,
        )
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.clone()
    }

    /// Intentional close: send `leave`, close normally, never reconnect. Idempotent.
    pub async fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
                debug!("relay transport did not close in time");
            }
        }
    }
}

impl RelaySink for ReconnectingTransport {
    fn send(&self, msg: Message) -> Result<(), TransferError> {
        if *self.state.borrow() != ConnectivityState::Connected {
            return Err(TransferError::ConnectionLost);
        }
        match &*self.outbound.borrow() {
            Some(tx) => tx.send(msg).map_err(|_| TransferError::ConnectionLost),
            None => Err(TransferError::ConnectionLost),
        }
    }
}

impl Link {
    async fn run(mut self) {
        let mut attempt = 0u32;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let connected = tokio::select! {
                r = connect_async(self.url.as_str()) => r,
                _ = self.shutdown.changed() => break,
            };
            match connected {
                Ok((ws, _)) => {
                    info!(room = %self.room, peer = %self.local, "connected to relay");
                    match self.session(ws).await {
                        SessionEnd::Closed => break,
                        SessionEnd::Dropped { welcomed } => {
                            // A relay that accepts and then turns us away counts as a failed attempt.
                            if welcomed {
                                attempt = 0;
                            }
                            warn!(room = %self.room, welcomed, "relay connection dropped");
                        }
                    }
                }
                Err(e) => {
                    warn!(room = %self.room, attempt, error = %e, "relay connect failed");
                }
            }
            if attempt >= self.policy.max_attempts {
                warn!(room = %self.room, attempts = attempt, "giving up on relay");
                self.set_state(ConnectivityState::Disconnected);
                return;
            }
            let delay = self.policy.delay(attempt);
            attempt += 1;
            self.set_state(ConnectivityState::Reconnecting { attempt });
            debug!(room = %self.room, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }
        self.set_state(ConnectivityState::Closed);
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let join = Message::Join {
            room_id: self.room.to_string(),
            peer_id: self.local.clone(),
        };
        if let Err(e) = send_message(&mut sink, &join).await {
            debug!(error = %e, "join send failed");
            return SessionEnd::Dropped { welcomed: false };
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.outbound.send_replace(Some(tx));
        self.set_state(ConnectivityState::Connected);

        let mut welcomed = false;
        let end = loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    if let Err(e) = send_message(&mut sink, &msg).await {
                        debug!(error = %e, "relay write failed");
                        break SessionEnd::Dropped { welcomed };
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => match wire::decode_text(&text) {
                        Ok(msg) => {
                            welcomed |= matches!(msg, Message::Welcome { .. });
                            let _ = self.events.send(TransportEvent::Message(msg));
                        }
                        Err(e) => debug!(error = %e, "undecodable relay frame"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break SessionEnd::Dropped { welcomed },
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "relay read failed");
                        break SessionEnd::Dropped { welcomed };
                    }
                },
                _ = self.shutdown.changed() => {
                    // Flush what was already queued, then leave.
                    while let Ok(msg) = rx.try_recv() {
                        let _ = send_message(&mut sink, &msg).await;
                    }
                    let leave = Message::Leave { peer_id: self.local.clone() };
                    let _ = send_message(&mut sink, &leave).await;
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: Cow::Borrowed("leave"),
                        })))
                        .await;
                    break SessionEnd::Closed;
                }
            }
        };
        self.outbound.send_replace(None);
        end
    }

    fn set_state(&self, state: ConnectivityState) {
        self.state.send_replace(state);
        let _ = self.events.send(TransportEvent::Connectivity(state));
    }
}

async fn send_message<S>(sink: &mut S, msg: &Message) -> Result<(), TransferError>
where
    S: SinkExt<WsMessage> + Unpin,
{
    let text = wire::encode_text(msg).map_err(|e| TransferError::Decode(e.to_string()))?;
    sink.send(WsMessage::Text(text))
        .await
        .map_err(|_| TransferError::ConnectionLost)
}
