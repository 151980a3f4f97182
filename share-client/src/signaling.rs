//! Signaling coordinator: one PeerConnection per remote peer, negotiated through the relay.
//!
//! The greater peer id initiates. Offers, answers and candidates from peers outside the current
//! roster are ignored. A closed connection is not retried automatically.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use share_core::peer::{decide_offer, OfferDecision};
use share_core::{
    ChannelFrame, Message, NegotiationError, NegotiationState, OutgoingFile, PeerConnection,
    PeerId, TransferError,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::PeerChannel;
use crate::connector::{Connector, OpenedChannel};
use crate::transfer::{send_via_channel, PeerTransfer, SendOptions};
use crate::transport::RelaySink;

/// What the coordinator reports to the room dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    State { peer: PeerId, state: NegotiationState },
    Frame { peer: PeerId, frame: ChannelFrame },
    ChannelClosed { peer: PeerId },
}

struct Entry {
    conn: PeerConnection,
    channel: Option<PeerChannel>,
    /// Negotiation task; finished once the channel is open.
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<PeerId, Entry>,
    roster: HashSet<PeerId>,
    closed: bool,
}

#[derive(Clone)]
pub struct SignalingCoordinator {
    local: PeerId,
    inner: Arc<Mutex<Inner>>,
    relay: Arc<dyn RelaySink>,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    timeout: Duration,
    send_options: SendOptions,
}

impl SignalingCoordinator {
    pub fn new(
        local: PeerId,
        relay: Arc<dyn RelaySink>,
        connector: Arc<dyn Connector>,
        timeout: Duration,
        send_options: SendOptions,
    ) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                local,
                inner: Arc::new(Mutex::new(Inner::default())),
                relay,
                connector,
                events,
                timeout,
                send_options,
            },
            rx,
        )
    }

    /// Reconcile against the current roster: start offers to new peers we should initiate to.
    pub async fn on_roster(&self, peers: Vec<PeerId>) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        inner.roster = peers.iter().cloned().collect();
        for peer in peers {
            if !self.local.should_initiate(&peer) || inner.peers.contains_key(&peer) {
                continue;
            }
            if let Err(e) = self.start_offer(&mut inner, peer.clone()).await {
                warn!(peer = %peer, error = %e, "could not start negotiation");
            }
        }
    }

    /// Start a local-initiated connection. No-op while a live connection to `remote` exists.
    pub async fn create_connection(&self, remote: &PeerId) -> Result<(), NegotiationError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(NegotiationError::Closed);
        }
        if let Some(entry) = inner.peers.get(remote) {
            if entry.conn.state() != NegotiationState::Closed {
                return Ok(());
            }
        }
        self.start_offer(&mut inner, remote.clone()).await
    }

    async fn start_offer(&self, inner: &mut Inner, remote: PeerId) -> Result<(), NegotiationError> {
        let mut conn = PeerConnection::new(remote.clone());
        conn.begin_offer()?;
        self.emit_state(&remote, NegotiationState::Offering);
        let id = conn.connection_id().to_string();
        let negotiation = match self.connector.create_offer(&remote, &id).await {
            Ok(n) => n,
            Err(e) => {
                self.insert_closed(inner, conn);
                return Err(e);
            }
        };
        let offer = Message::Offer {
            sdp: negotiation.description,
            from: self.local.clone(),
            to: remote.clone(),
        };
        if let Err(e) = self.relay.send(offer) {
            self.connector.release(&id);
            self.insert_closed(inner, conn);
            return Err(NegotiationError::Failed(e.to_string()));
        }
        conn.offer_sent()?;
        self.emit_state(&remote, NegotiationState::AwaitingAnswer);
        info!(peer = %remote, connection = %id, "offer sent");
        let task = tokio::spawn(self.clone().drive(
            remote.clone(),
            id,
            negotiation.candidates,
            negotiation.opened,
        ));
        self.replace(
            inner,
            Entry {
                conn,
                channel: None,
                task: Some(task),
            },
        );
        Ok(())
    }

    pub async fn handle_offer(&self, from: PeerId, sdp: String) {
        let mut inner = self.inner.lock().await;
        if inner.closed || !inner.roster.contains(&from) {
            debug!(peer = %from, "offer from unknown peer ignored");
            return;
        }
        let existing = inner.peers.get(&from).map(|e| &e.conn);
        if decide_offer(&self.local, &from, existing) == OfferDecision::Ignore {
            debug!(peer = %from, "crossing offer ignored; our attempt wins");
            return;
        }
        let mut conn = PeerConnection::new(from.clone());
        if let Err(e) = conn.begin_answer() {
            warn!(peer = %from, error = %e, "cannot answer");
            return;
        }
        self.emit_state(&from, NegotiationState::Answering);
        let id = conn.connection_id().to_string();
        let negotiation = match self.connector.accept_offer(&from, &id, &sdp).await {
            Ok(n) => n,
            Err(e) => {
                warn!(peer = %from, error = %e, "offer rejected");
                self.insert_closed(&mut inner, conn);
                return;
            }
        };
        let answer = Message::Answer {
            sdp: negotiation.description,
            from: self.local.clone(),
            to: from.clone(),
        };
        if let Err(e) = self.relay.send(answer) {
            warn!(peer = %from, error = %e, "answer not sent");
            self.connector.release(&id);
            self.insert_closed(&mut inner, conn);
            return;
        }
        info!(peer = %from, connection = %id, "answer sent");
        let task = tokio::spawn(self.clone().drive(
            from,
            id,
            negotiation.candidates,
            negotiation.opened,
        ));
        self.replace(
            &mut inner,
            Entry {
                conn,
                channel: None,
                task: Some(task),
            },
        );
    }

    pub async fn handle_answer(&self, from: PeerId, sdp: String) {
        let mut inner = self.inner.lock().await;
        if inner.closed || !inner.roster.contains(&from) {
            return;
        }
        let Some(entry) = inner.peers.get_mut(&from) else {
            debug!(peer = %from, "answer without a connection ignored");
            return;
        };
        if entry.conn.state() != NegotiationState::AwaitingAnswer {
            debug!(peer = %from, state = %entry.conn.state(), "unexpected answer ignored");
            return;
        }
        let id = entry.conn.connection_id().to_string();
        if let Err(e) = self.connector.apply_answer(&id, &sdp).await {
            warn!(peer = %from, error = %e, "answer rejected");
            self.teardown(entry);
        }
    }

    pub async fn handle_candidate(&self, from: PeerId, candidate: String) {
        let inner = self.inner.lock().await;
        if inner.closed || !inner.roster.contains(&from) {
            return;
        }
        let Some(entry) = inner.peers.get(&from) else {
            debug!(peer = %from, "candidate without a connection ignored");
            return;
        };
        if matches!(
            entry.conn.state(),
            NegotiationState::Connected | NegotiationState::Closed
        ) {
            return;
        }
        if let Err(e) = self
            .connector
            .add_candidate(entry.conn.connection_id(), &candidate)
            .await
        {
            debug!(peer = %from, error = %e, "candidate not applied");
        }
    }

    /// Route an `offer`, `answer` or `ice-candidate` addressed to us.
    pub async fn handle_signal(&self, msg: Message) {
        match msg {
            Message::Offer { sdp, from, .. } => self.handle_offer(from, sdp).await,
            Message::Answer { sdp, from, .. } => self.handle_answer(from, sdp).await,
            Message::IceCandidate {
                candidate, from, ..
            } => self.handle_candidate(from, candidate).await,
            other => debug!(kind = other.kind(), "not a signaling message"),
        }
    }

    /// The peer left the room: its connection closes for good.
    pub async fn on_peer_left(&self, peer: &PeerId) {
        let mut inner = self.inner.lock().await;
        inner.roster.remove(peer);
        if let Some(entry) = inner.peers.get_mut(peer) {
            self.teardown(entry);
        }
    }

    /// Close every connection and stop signaling. Used on leave.
    pub async fn close_all(&self) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.roster.clear();
        for entry in inner.peers.values_mut() {
            self.teardown(entry);
        }
    }

    pub async fn state_of(&self, peer: &PeerId) -> Option<NegotiationState> {
        self.inner.lock().await.peers.get(peer).map(|e| e.conn.state())
    }

    /// Snapshot of the connection record for `peer`.
    pub async fn connection(&self, peer: &PeerId) -> Option<PeerConnection> {
        self.inner.lock().await.peers.get(peer).map(|e| e.conn.clone())
    }

    /// The open channel to `peer`, if its connection is `connected`.
    pub async fn channel_for(&self, peer: &PeerId) -> Option<PeerChannel> {
        let inner = self.inner.lock().await;
        let entry = inner.peers.get(peer)?;
        if !entry.conn.is_connected() {
            return None;
        }
        entry.channel.clone().filter(|c| c.is_open())
    }

    /// Forward local candidates and wait for the channel, bounded by the negotiation timeout.
    async fn drive(
        self,
        peer: PeerId,
        id: String,
        mut candidates: mpsc::UnboundedReceiver<String>,
        mut opened: oneshot::Receiver<Result<OpenedChannel, NegotiationError>>,
    ) {
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut gathering = true;
        let result = loop {
            tokio::select! {
                c = candidates.recv(), if gathering => match c {
                    Some(candidate) => {
                        let msg = Message::IceCandidate {
                            candidate,
                            from: self.local.clone(),
                            to: peer.clone(),
                        };
                        if let Err(e) = self.relay.send(msg) {
                            debug!(peer = %peer, error = %e, "candidate not sent");
                        }
                    }
                    None => gathering = false,
                },
                r = &mut opened => {
                    break r.unwrap_or_else(|_| Err(NegotiationError::Failed("connector gave up".into())));
                }
                _ = &mut deadline => break Err(NegotiationError::Timeout),
            }
        };
        self.finish(peer, id, result).await;
    }

    async fn finish(&self, peer: PeerId, id: String, result: Result<OpenedChannel, NegotiationError>) {
        self.connector.release(&id);
        let mut inner = self.inner.lock().await;
        let entry = inner
            .peers
            .get_mut(&peer)
            .filter(|e| e.conn.connection_id() == id && e.conn.state() != NegotiationState::Closed);
        let Some(entry) = entry else {
            // Superseded or torn down meanwhile.
            if let Ok((channel, _)) = result {
                channel.close();
            }
            return;
        };
        match result {
            Ok((channel, frames)) => {
                if let Err(e) = entry.conn.mark_connected() {
                    warn!(peer = %peer, error = %e, "late channel discarded");
                    channel.close();
                    return;
                }
                info!(peer = %peer, connection = %id, "peer channel connected");
                entry.channel = Some(channel);
                entry.task = None;
                self.emit_state(&peer, NegotiationState::Connected);
                tokio::spawn(self.clone().pump(peer, id, frames));
            }
            Err(e) => {
                warn!(peer = %peer, connection = %id, error = %e, "negotiation failed");
                entry.conn.close();
                entry.task = None;
                self.emit_state(&peer, NegotiationState::Closed);
            }
        }
    }

    /// Forward inbound frames until the channel ends.
    async fn pump(self, peer: PeerId, id: String, mut frames: mpsc::UnboundedReceiver<ChannelFrame>) {
        while let Some(frame) = frames.recv().await {
            let _ = self.events.send(SignalingEvent::Frame {
                peer: peer.clone(),
                frame,
            });
        }
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.peers.get_mut(&peer) {
            if entry.conn.connection_id() == id {
                self.teardown(entry);
            }
        }
        drop(inner);
        debug!(peer = %peer, connection = %id, "peer channel ended");
        let _ = self.events.send(SignalingEvent::ChannelClosed { peer });
    }

    fn teardown(&self, entry: &mut Entry) {
        if let Some(task) = entry.task.take() {
            task.abort();
            self.connector.release(entry.conn.connection_id());
        }
        if let Some(channel) = entry.channel.take() {
            channel.close();
        }
        if entry.conn.close() {
            self.emit_state(entry.conn.peer(), NegotiationState::Closed);
        }
    }

    fn replace(&self, inner: &mut Inner, entry: Entry) {
        let peer = entry.conn.peer().clone();
        if let Some(mut old) = inner.peers.insert(peer, entry) {
            self.teardown(&mut old);
        }
    }

    fn insert_closed(&self, inner: &mut Inner, mut conn: PeerConnection) {
        conn.close();
        self.emit_state(conn.peer(), NegotiationState::Closed);
        self.replace(
            inner,
            Entry {
                conn,
                channel: None,
                task: None,
            },
        );
    }

    fn emit_state(&self, peer: &PeerId, state: NegotiationState) {
        let _ = self.events.send(SignalingEvent::State {
            peer: peer.clone(),
            state,
        });
    }
}

#[async_trait]
impl PeerTransfer for SignalingCoordinator {
    async fn is_connected(&self, peer: &PeerId) -> bool {
        self.channel_for(peer).await.is_some()
    }

    async fn send_file(
        &self,
        peer: &PeerId,
        file: &OutgoingFile,
        transfer_id: &str,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<(), TransferError> {
        let channel = self
            .channel_for(peer)
            .await
            .ok_or_else(|| TransferError::NegotiationFailed("no open channel".into()))?;
        send_via_channel(&channel, file, transfer_id, self.send_options, progress).await
    }
}
