//! Host-driven API: RoomCore receives inbound relay messages, peer-channel frames and ticks,
//! and returns actions. The client's dispatcher task owns one per room session.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::chunk::{
    self, ChannelReceiver, ChunkProgress, Reassembler, ReceivedFile, ReceivedVia, TransferMeta,
    DEFAULT_STALL_TIMEOUT,
};
use crate::error::TransferError;
use crate::identity::PeerId;
use crate::peer::NegotiationState;
use crate::protocol::{ChatMessage, Message, PeerInfo};
use crate::strategy::TransferMethod;
use crate::wire::{self, ChannelFrame};

/// Relay connectivity as seen by the UI. Reconnection failures only ever show up here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Gave up reconnecting.
    Disconnected,
    /// Intentional leave.
    Closed,
}

/// Everything a room session reports to its UI.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Welcome { peer_id: PeerId, room_size: usize },
    Message(ChatMessage),
    Roster(Vec<PeerInfo>),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    FileReceived(ReceivedFile),
    TransferFailed {
        transfer_id: String,
        sender: PeerId,
        error: TransferError,
    },
    Connectivity(ConnectivityState),
    PeerChannel {
        peer: PeerId,
        state: NegotiationState,
    },
    /// Outbound progress, reported after each chunk is handed to its channel.
    Progress {
        transfer_id: String,
        method: TransferMethod,
        fraction: f32,
    },
    /// Inbound progress: share of declared chunks received so far.
    Receiving {
        transfer_id: String,
        sender: PeerId,
        via: ReceivedVia,
        fraction: f32,
    },
    RelayError(String),
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Emit(RoomEvent),
    /// Roster changed; the signaling coordinator should reconcile against these peers.
    RosterChanged(Vec<PeerId>),
    /// Signaling message addressed to us.
    Signal(Message),
    /// A peer left the room; tear down its connection.
    PeerLeft(PeerId),
}

pub struct RoomCore {
    local: PeerId,
    relay: Reassembler,
    channel: ChannelReceiver,
    stall_timeout: Duration,
}

impl RoomCore {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            relay: Reassembler::new(ReceivedVia::Relay),
            channel: ChannelReceiver::new(),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    /// Set the inactivity bound for inbound transfers.
    pub fn set_stall_timeout(&mut self, timeout: Duration) {
        self.stall_timeout = timeout;
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// Process one message received from the relay.
    pub fn on_relay_message(&mut self, msg: Message, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        match msg {
            Message::Welcome { peer_id, room_size } => {
                actions.push(Action::Emit(RoomEvent::Welcome { peer_id, room_size }));
            }
            Message::Peers { peers } => {
                let ids = peers
                    .iter()
                    .map(|p| p.id.clone())
                    .filter(|id| *id != self.local)
                    .collect();
                actions.push(Action::Emit(RoomEvent::Roster(peers)));
                actions.push(Action::RosterChanged(ids));
            }
            Message::PeerJoined { peer_id, .. } => {
                if peer_id != self.local {
                    actions.push(Action::Emit(RoomEvent::PeerJoined(peer_id)));
                }
            }
            Message::PeerLeft { peer_id, .. } => {
                for transfer_id in self.relay.abandon_from(&peer_id) {
                    actions.push(transfer_failed(
                        transfer_id,
                        peer_id.clone(),
                        TransferError::ConnectionLost,
                    ));
                }
                actions.push(Action::Emit(RoomEvent::PeerLeft(peer_id.clone())));
                actions.push(Action::PeerLeft(peer_id));
            }
            Message::Message { message } => {
                if message.sender != self.local {
                    actions.push(Action::Emit(RoomEvent::Message(message)));
                }
            }
            Message::Offer { .. } | Message::Answer { .. } | Message::IceCandidate { .. } => {
                if signal_target(&msg).is_some_and(|to| *to == self.local) {
                    actions.push(Action::Signal(msg));
                } else {
                    debug!(kind = msg.kind(), "signaling for another peer ignored");
                }
            }
            Message::Metadata {
                transfer_id,
                file_name,
                file_size,
                content_type,
                total_chunks,
                sender,
                to,
            } => {
                if let Some(sender) = self.inbound_sender(sender, &to) {
                    self.relay.on_metadata(
                        sender,
                        TransferMeta {
                            transfer_id,
                            file_name,
                            file_size,
                            content_type,
                            total_chunks,
                        },
                        now,
                    );
                }
            }
            Message::Chunk {
                transfer_id,
                chunk_index,
                chunk_data,
                sender,
                to,
            } => {
                let Some(sender) = self.inbound_sender(sender, &to) else {
                    return actions;
                };
                let result = chunk::decode_chunk(&chunk_data).and_then(|payload| {
                    self.relay
                        .on_chunk(&sender, &transfer_id, chunk_index, payload, now)
                });
                match result {
                    Ok(progress) => actions.push(receiving(progress, sender, ReceivedVia::Relay)),
                    Err(e) => {
                        warn!(transfer = %transfer_id, peer = %sender, index = chunk_index, error = %e, "relay chunk rejected");
                    }
                }
            }
            Message::Complete {
                transfer_id,
                sender,
                to,
            } => {
                let Some(sender) = self.inbound_sender(sender, &to) else {
                    return actions;
                };
                match self.relay.on_complete(&sender, &transfer_id) {
                    Ok(file) => actions.push(Action::Emit(RoomEvent::FileReceived(file))),
                    Err(e) => {
                        warn!(transfer = %transfer_id, peer = %sender, error = %e, "relay transfer failed");
                        actions.push(transfer_failed(transfer_id, sender, e));
                    }
                }
            }
            Message::Error { message } => {
                warn!(error = %message, "relay reported an error");
                actions.push(Action::Emit(RoomEvent::RelayError(message)));
            }
            other => {
                debug!(kind = other.kind(), "unexpected message from relay ignored");
            }
        }
        actions
    }

    /// Process one frame from a peer channel.
    pub fn on_channel_frame(&mut self, peer: &PeerId, frame: ChannelFrame, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        match frame {
            ChannelFrame::Text(text) => {
                let msg = match wire::decode_text(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "undecodable peer-channel frame dropped");
                        return actions;
                    }
                };
                let transfer_id = transfer_id_of(&msg);
                match self.channel.on_control(peer, msg, now) {
                    Ok(Some(file)) => actions.push(Action::Emit(RoomEvent::FileReceived(file))),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "peer-channel transfer failed");
                        if let Some(id) = transfer_id {
                            actions.push(transfer_failed(id, peer.clone(), e));
                        }
                    }
                }
            }
            ChannelFrame::Binary(payload) => {
                match self.channel.on_binary(peer, payload, now) {
                    Ok(Some(progress)) => {
                        actions.push(receiving(progress, peer.clone(), ReceivedVia::PeerChannel))
                    }
                    Ok(None) => {}
                    Err(e) => warn!(peer = %peer, error = %e, "peer-channel chunk rejected"),
                }
            }
        }
        actions
    }

    /// A peer channel closed: its unfinished inbound transfers are abandoned.
    pub fn on_channel_closed(&mut self, peer: &PeerId) -> Vec<Action> {
        self.channel
            .abandon_from(peer)
            .into_iter()
            .map(|id| {
                transfer_failed(
                    id,
                    peer.clone(),
                    TransferError::NegotiationFailed("peer channel closed".into()),
                )
            })
            .collect()
    }

    /// Periodic tick: evict inbound transfers that stopped making progress.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let timeout = self.stall_timeout;
        let mut stale = self.relay.evict_stalled(now, timeout);
        stale.extend(self.channel.reassembler_mut().evict_stalled(now, timeout));
        stale
            .into_iter()
            .map(|(sender, transfer_id)| {
                warn!(transfer = %transfer_id, peer = %sender, "inbound transfer stalled; evicted");
                let error = TransferError::Stalled(transfer_id.clone());
                transfer_failed(transfer_id, sender, error)
            })
            .collect()
    }

    /// Sender of a relayed transfer frame, if it is meant for us and not our own.
    fn inbound_sender(&self, sender: Option<PeerId>, to: &Option<PeerId>) -> Option<PeerId> {
        if let Some(target) = to {
            if *target != self.local {
                return None;
            }
        }
        match sender {
            Some(s) if s == self.local => None,
            Some(s) => Some(s),
            None => {
                warn!("relayed transfer frame without sender dropped");
                None
            }
        }
    }
}

fn transfer_failed(transfer_id: String, sender: PeerId, error: TransferError) -> Action {
    Action::Emit(RoomEvent::TransferFailed {
        transfer_id,
        sender,
        error,
    })
}

fn receiving(progress: ChunkProgress, sender: PeerId, via: ReceivedVia) -> Action {
    Action::Emit(RoomEvent::Receiving {
        fraction: progress.fraction(),
        transfer_id: progress.transfer_id,
        sender,
        via,
    })
}

fn signal_target(msg: &Message) -> Option<&PeerId> {
    match msg {
        Message::Offer { to, .. }
        | Message::Answer { to, .. }
        | Message::IceCandidate { to, .. } => Some(to),
        _ => None,
    }
}

fn transfer_id_of(msg: &Message) -> Option<String> {
    match msg {
        Message::Metadata { transfer_id, .. }
        | Message::Chunk { transfer_id, .. }
        | Message::ChunkHeader { transfer_id, .. }
        | Message::Complete { transfer_id, .. } => Some(transfer_id.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{encode_chunk, OutgoingFile, TransferPlan, TransferStep};

    fn core() -> RoomCore {
        RoomCore::new(PeerId::from("me"))
    }

    fn stamp(msg: Message, from: &str) -> Message {
        let s = Some(PeerId::from(from));
        match msg {
            Message::Metadata {
                transfer_id,
                file_name,
                file_size,
                content_type,
                total_chunks,
                to,
                ..
            } => Message::Metadata {
                transfer_id,
                file_name,
                file_size,
                content_type,
                total_chunks,
                sender: s,
                to,
            },
            Message::Complete { transfer_id, to, .. } => Message::Complete {
                transfer_id,
                sender: s,
                to,
            },
            other => other,
        }
    }

    fn relay_frames(data: &[u8], chunk_size: usize, from: &str) -> Vec<Message> {
        let file = OutgoingFile::new("a.txt", "text/plain", data.to_vec());
        let plan = TransferPlan::new(&file, "t1", chunk_size, None);
        plan.steps()
            .map(|step| match step {
                TransferStep::Metadata(m) | TransferStep::Complete(m) => stamp(m, from),
                TransferStep::Chunk { index, bytes } => Message::Chunk {
                    transfer_id: "t1".into(),
                    chunk_index: index,
                    chunk_data: encode_chunk(bytes),
                    sender: Some(PeerId::from(from)),
                    to: None,
                },
            })
            .collect()
    }

    fn received(actions: &[Action]) -> Option<&ReceivedFile> {
        actions.iter().find_map(|a| match a {
            Action::Emit(RoomEvent::FileReceived(f)) => Some(f),
            _ => None,
        })
    }

    #[test]
    fn relay_transfer_reassembles() {
        let mut c = core();
        let now = Instant::now();
        let data: Vec<u8> = (0..10u8).collect();
        let mut last = Vec::new();
        for msg in relay_frames(&data, 4, "p1") {
            last = c.on_relay_message(msg, now);
        }
        let file = received(&last).expect("file delivered");
        assert_eq!(file.bytes, data);
        assert_eq!(file.sender.as_str(), "p1");
        assert_eq!(file.data_url(), format!("data:text/plain;base64,{}", encode_chunk(&data)));
    }

    #[test]
    fn inbound_chunks_report_progress() {
        let mut c = core();
        let now = Instant::now();
        let mut fractions = Vec::new();
        for msg in relay_frames(&[3; 10], 4, "p1") {
            for action in c.on_relay_message(msg, now) {
                if let Action::Emit(RoomEvent::Receiving {
                    transfer_id,
                    sender,
                    via,
                    fraction,
                }) = action
                {
                    assert_eq!(transfer_id, "t1");
                    assert_eq!(sender.as_str(), "p1");
                    assert_eq!(via, ReceivedVia::Relay);
                    fractions.push(fraction);
                }
            }
        }
        assert_eq!(fractions.len(), 3);
        assert!((fractions[0] - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(fractions[2], 1.0);
    }

    #[test]
    fn dropped_chunk_fails_without_partial_file() {
        let mut c = core();
        let now = Instant::now();
        let mut actions = Vec::new();
        for msg in relay_frames(&[1; 12], 4, "p1") {
            if matches!(msg, Message::Chunk { chunk_index: 1, .. }) {
                continue;
            }
            actions.extend(c.on_relay_message(msg, now));
        }
        assert!(received(&actions).is_none());
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Emit(RoomEvent::TransferFailed {
                error: TransferError::MissingChunk { index: 1, total: 3, .. },
                ..
            })
        )));
    }

    #[test]
    fn own_frames_and_frames_for_others_ignored() {
        let mut c = core();
        let now = Instant::now();
        let mut actions = Vec::new();
        for msg in relay_frames(b"abc", 2, "me") {
            actions.extend(c.on_relay_message(msg, now));
        }
        assert!(actions.is_empty());
        let for_other = Message::Metadata {
            transfer_id: "x".into(),
            file_name: "f".into(),
            file_size: 1,
            content_type: String::new(),
            total_chunks: 1,
            sender: Some(PeerId::from("p1")),
            to: Some(PeerId::from("p9")),
        };
        assert!(c.on_relay_message(for_other, now).is_empty());
        assert_eq!(c.relay.in_flight(), 0);
    }

    #[test]
    fn own_chat_messages_filtered() {
        let mut c = core();
        let now = Instant::now();
        let mine = ChatMessage::text(PeerId::from("me"), "echo");
        assert!(c
            .on_relay_message(Message::Message { message: mine }, now)
            .is_empty());
        let theirs = ChatMessage::text(PeerId::from("p1"), "hello");
        let actions = c.on_relay_message(Message::Message { message: theirs }, now);
        assert!(matches!(&actions[..], [Action::Emit(RoomEvent::Message(m))] if m.content.as_deref() == Some("hello")));
    }

    #[test]
    fn roster_triggers_reconciliation() {
        let mut c = core();
        let peers = vec![PeerInfo {
            id: PeerId::from("p1"),
            name: "Device p1".into(),
            joined: 1,
        }];
        let actions = c.on_relay_message(Message::Peers { peers }, Instant::now());
        assert!(actions.contains(&Action::RosterChanged(vec![PeerId::from("p1")])));
    }

    #[test]
    fn signaling_only_when_addressed_to_us() {
        let mut c = core();
        let now = Instant::now();
        let offer = Message::Offer {
            sdp: "s".into(),
            from: PeerId::from("p1"),
            to: PeerId::from("me"),
        };
        assert_eq!(c.on_relay_message(offer.clone(), now), vec![Action::Signal(offer)]);
        let other = Message::Answer {
            sdp: "s".into(),
            from: PeerId::from("p1"),
            to: PeerId::from("p2"),
        };
        assert!(c.on_relay_message(other, now).is_empty());
    }

    #[test]
    fn peer_left_tears_down() {
        let mut c = core();
        let now = Instant::now();
        let frames = relay_frames(b"abcdef", 2, "p1");
        c.on_relay_message(frames[0].clone(), now);
        let actions = c.on_relay_message(
            Message::PeerLeft {
                peer_id: PeerId::from("p1"),
                timestamp: 1,
            },
            now,
        );
        assert!(actions.contains(&Action::PeerLeft(PeerId::from("p1"))));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Emit(RoomEvent::TransferFailed {
                error: TransferError::ConnectionLost,
                ..
            })
        )));
    }

    #[test]
    fn channel_frames_reassemble() {
        let mut c = core();
        let now = Instant::now();
        let peer = PeerId::from("p1");
        let file = OutgoingFile::new("b.bin", "application/octet-stream", vec![5; 9]);
        let plan = TransferPlan::new(&file, "t2", 4, None);
        let mut last = Vec::new();
        let mut seen_progress = Vec::new();
        for step in plan.steps() {
            let frames = match step {
                TransferStep::Metadata(m) | TransferStep::Complete(m) => {
                    vec![ChannelFrame::Text(wire::encode_text(&m).unwrap())]
                }
                TransferStep::Chunk { index, bytes } => vec![
                    ChannelFrame::Text(
                        wire::encode_text(&Message::ChunkHeader {
                            transfer_id: "t2".into(),
                            chunk_index: index,
                            chunk_size: bytes.len() as u32,
                        })
                        .unwrap(),
                    ),
                    ChannelFrame::Binary(bytes.to_vec()),
                ],
            };
            for f in frames {
                last = c.on_channel_frame(&peer, f, now);
                seen_progress.extend(last.iter().filter_map(|a| match a {
                    Action::Emit(RoomEvent::Receiving { via, .. }) => Some(*via),
                    _ => None,
                }));
            }
        }
        let got = received(&last).expect("file delivered");
        assert_eq!(got.bytes, vec![5; 9]);
        assert!(seen_progress.iter().all(|v| *v == ReceivedVia::PeerChannel));
        assert_eq!(seen_progress.len(), 3);
        assert_eq!(got.via, ReceivedVia::PeerChannel);
    }

    #[test]
    fn closed_channel_abandons_transfers() {
        let mut c = core();
        let now = Instant::now();
        let peer = PeerId::from("p1");
        let meta = Message::Metadata {
            transfer_id: "t3".into(),
            file_name: "f".into(),
            file_size: 4,
            content_type: String::new(),
            total_chunks: 1,
            sender: None,
            to: None,
        };
        c.on_channel_frame(&peer, ChannelFrame::Text(wire::encode_text(&meta).unwrap()), now);
        let actions = c.on_channel_closed(&peer);
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn tick_evicts_stalled_sessions() {
        let mut c = core();
        c.set_stall_timeout(Duration::from_secs(1));
        let start = Instant::now();
        let frames = relay_frames(b"abcdef", 2, "p1");
        c.on_relay_message(frames[0].clone(), start);
        assert!(c.tick(start).is_empty());
        let actions = c.tick(start + Duration::from_secs(2));
        assert!(matches!(
            &actions[..],
            [Action::Emit(RoomEvent::TransferFailed { error: TransferError::Stalled(_), .. })]
        ));
    }
}
