//! Room session: the UI boundary. Wires the relay transport, the signaling coordinator and the
//! strategy selector together; one dispatcher task applies everything inbound in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use share_core::{
    Action, ChatMessage, ConnectivityState, Message, NegotiationState, OutgoingFile, PeerId,
    RoomCode, RoomCore, RoomEvent, TransferError, TransferMethod, TransferResult,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connector::TcpConnector;
use crate::signaling::{SignalingCoordinator, SignalingEvent};
use crate::storage::{default_external, DurableStorage, ExternalStorage, WorkerStorage};
use crate::strategy::TransferStrategySelector;
use crate::transfer::{RelayInline, SendOptions};
use crate::transport::{ReconnectingTransport, RelaySink, TransportEvent};

/// Eviction tick for stalled inbound transfers.
const TICK: Duration = Duration::from_secs(1);
const DISPATCHER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("room session already left")]
    Left,
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

pub struct RoomSession {
    local: PeerId,
    room: RoomCode,
    transport: Arc<ReconnectingTransport>,
    signaling: SignalingCoordinator,
    selector: TransferStrategySelector,
    inline: RelayInline,
    events: mpsc::UnboundedSender<RoomEvent>,
    left: AtomicBool,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RoomSession {
    /// Join `room` with the storage backends named in `config`.
    pub fn join(
        config: &ClientConfig,
        room: RoomCode,
        local: PeerId,
    ) -> (Self, mpsc::UnboundedReceiver<RoomEvent>) {
        let durable = Arc::new(WorkerStorage::new(
            config.storage_url.clone(),
            config.durable_limit_bytes,
        ));
        let external = if config.external_storage {
            default_external()
        } else {
            Vec::new()
        };
        Self::join_with(config, room, local, durable, external)
    }

    /// Join with explicit storage collaborators.
    pub fn join_with(
        config: &ClientConfig,
        room: RoomCode,
        local: PeerId,
        durable: Arc<dyn DurableStorage>,
        external: Vec<Box<dyn ExternalStorage>>,
    ) -> (Self, mpsc::UnboundedReceiver<RoomEvent>) {
        let (transport, transport_rx) = ReconnectingTransport::connect(
            &config.relay_url,
            room.clone(),
            local.clone(),
            config.reconnect_policy(),
        );
        let transport = Arc::new(transport);
        let relay: Arc<dyn RelaySink> = transport.clone();
        let (signaling, signaling_rx) = SignalingCoordinator::new(
            local.clone(),
            relay.clone(),
            Arc::new(TcpConnector::new(config.direct_host.clone())),
            config.negotiation_timeout(),
            SendOptions::peer_channel(config),
        );
        let (events, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let mut core = RoomCore::new(local.clone());
        core.set_stall_timeout(config.stall_timeout());
        let dispatcher = Dispatcher {
            core,
            signaling: signaling.clone(),
            events: events.clone(),
        };
        let task = tokio::spawn(dispatcher.run(transport_rx, signaling_rx, stop_rx));
        info!(room = %room, peer = %local, "joining room");

        (
            Self {
                local,
                room,
                transport,
                signaling,
                selector: TransferStrategySelector::new(durable, external),
                inline: RelayInline::new(relay, SendOptions::relay(config)),
                events,
                left: AtomicBool::new(false),
                stop: Mutex::new(Some(stop_tx)),
                dispatcher: Mutex::new(Some(task)),
            },
            events_rx,
        )
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn room(&self) -> &RoomCode {
        &self.room
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.transport.state()
    }

    pub async fn peer_state(&self, peer: &PeerId) -> Option<NegotiationState> {
        self.signaling.state_of(peer).await
    }

    pub fn send_text(&self, content: impl Into<String>) -> Result<(), ClientError> {
        self.ensure_joined()?;
        let message = ChatMessage::text(self.local.clone(), content);
        self.transport.send(Message::Message { message })?;
        Ok(())
    }

    /// Deliver a file. When the outcome is a fetchable URL a file message announces it.
    pub async fn send_file(
        &self,
        file: &OutgoingFile,
        target: Option<&PeerId>,
    ) -> Result<TransferResult, ClientError> {
        self.ensure_joined()?;
        let events = self.events.clone();
        let progress = move |transfer_id: &str, method: TransferMethod, fraction: f32| {
            let _ = events.send(RoomEvent::Progress {
                transfer_id: transfer_id.to_string(),
                method,
                fraction,
            });
        };
        let result = self
            .selector
            .send(file, target, &self.signaling, &self.inline, &progress)
            .await;
        if let Some(url) = result.reference() {
            let message = ChatMessage::file_link(
                self.local.clone(),
                file.name.clone(),
                file.size(),
                &file.content_type,
                url,
            );
            if let Err(e) = self.transport.send(Message::Message { message }) {
                warn!(file = %file.name, error = %e, "file link not announced");
            }
        }
        Ok(result)
    }

    /// Leave the room: close peer connections, send `leave`, stop reconnecting. Idempotent.
    pub async fn leave(&self) {
        if self.left.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(room = %self.room, peer = %self.local, "leaving room");
        self.signaling.close_all().await;
        self.transport.close().await;
        if let Some(stop) = self.stop.lock().await.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.dispatcher.lock().await.take() {
            if tokio::time::timeout(DISPATCHER_STOP_TIMEOUT, task).await.is_err() {
                debug!(room = %self.room, "dispatcher did not stop in time");
            }
        }
    }

    fn ensure_joined(&self) -> Result<(), ClientError> {
        if self.left.load(Ordering::Acquire) {
            Err(ClientError::Left)
        } else {
            Ok(())
        }
    }
}

struct Dispatcher {
    core: RoomCore,
    signaling: SignalingCoordinator,
    events: mpsc::UnboundedSender<RoomEvent>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut transport: mpsc::UnboundedReceiver<TransportEvent>,
        mut signaling: mpsc::UnboundedReceiver<SignalingEvent>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut transport_open = true;
        loop {
            let actions = tokio::select! {
                ev = transport.recv(), if transport_open => match ev {
                    Some(ev) => self.on_transport(ev),
                    None => {
                        transport_open = false;
                        Vec::new()
                    }
                },
                Some(ev) = signaling.recv() => self.on_signaling(ev),
                _ = tick.tick() => self.core.tick(Instant::now()),
                _ = &mut stop => {
                    // Surface the final connectivity change before exiting.
                    while let Ok(ev) = transport.try_recv() {
                        if let TransportEvent::Connectivity(state) = ev {
                            self.emit(RoomEvent::Connectivity(state));
                        }
                    }
                    break;
                }
            };
            for action in actions {
                self.apply(action).await;
            }
        }
    }

    fn on_transport(&mut self, ev: TransportEvent) -> Vec<Action> {
        match ev {
            TransportEvent::Message(msg) => self.core.on_relay_message(msg, Instant::now()),
            TransportEvent::Connectivity(state) => {
                vec![Action::Emit(RoomEvent::Connectivity(state))]
            }
        }
    }

    fn on_signaling(&mut self, ev: SignalingEvent) -> Vec<Action> {
        match ev {
            SignalingEvent::State { peer, state } => {
                vec![Action::Emit(RoomEvent::PeerChannel { peer, state })]
            }
            SignalingEvent::Frame { peer, frame } => {
                self.core.on_channel_frame(&peer, frame, Instant::now())
            }
            SignalingEvent::ChannelClosed { peer } => self.core.on_channel_closed(&peer),
        }
    }

    async fn apply(&mut self, action: Action) {
        match action {
            Action::Emit(event) => self.emit(event),
            Action::RosterChanged(peers) => self.signaling.on_roster(peers).await,
            Action::Signal(msg) => self.signaling.handle_signal(msg).await,
            Action::PeerLeft(peer) => self.signaling.on_peer_left(&peer).await,
        }
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }
}
