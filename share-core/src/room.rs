//! Relay-side room state: sessions, roster, fan-out.
//!
//! Pure state; the relay's room actor owns one `Room` and turns `Delivery` values into socket writes.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::identity::{PeerId, RoomCode};
use crate::protocol::{Message, PeerInfo};

/// One connected peer inside a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub peer_id: PeerId,
    /// Join time, ms since epoch.
    pub joined: u64,
}

/// A message addressed to one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: PeerId,
    pub message: Message,
}

impl Delivery {
    fn new(to: PeerId, message: Message) -> Self {
        Self { to, message }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("peer {0} is already in the room")]
    DuplicatePeer(PeerId),
    #[error("peer {0} is not in the room")]
    UnknownPeer(PeerId),
}

pub struct Room {
    code: RoomCode,
    sessions: BTreeMap<PeerId, Session>,
}

impl Room {
    pub fn new(code: RoomCode) -> Self {
        Self {
            code,
            sessions: BTreeMap::new(),
        }
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.sessions.contains_key(peer)
    }

    /// Register a session. The joiner gets `welcome` + roster; everyone else `peer-joined` + roster.
    pub fn join(&mut self, peer: PeerId, now_ms: u64) -> Result<Vec<Delivery>, RoomError> {
        if self.sessions.contains_key(&peer) {
            return Err(RoomError::DuplicatePeer(peer));
        }
        self.sessions.insert(
            peer.clone(),
            Session {
                peer_id: peer.clone(),
                joined: now_ms,
            },
        );
        debug!(room = %self.code, peer = %peer, size = self.len(), "session joined");

        let mut out = vec![
            Delivery::new(
                peer.clone(),
                Message::Welcome {
                    peer_id: peer.clone(),
                    room_size: self.len(),
                },
            ),
            Delivery::new(
                peer.clone(),
                Message::Peers {
                    peers: self.roster_for(&peer),
                },
            ),
        ];
        for other in self.others(&peer) {
            out.push(Delivery::new(
                other.clone(),
                Message::PeerJoined {
                    peer_id: peer.clone(),
                    timestamp: now_ms,
                },
            ));
            out.push(Delivery::new(
                other.clone(),
                Message::Peers {
                    peers: self.roster_for(&other),
                },
            ));
        }
        Ok(out)
    }

    /// Remove a session. Every remaining session gets `peer-left` + roster.
    pub fn leave(&mut self, peer: &PeerId, now_ms: u64) -> Result<Vec<Delivery>, RoomError> {
        if self.sessions.remove(peer).is_none() {
            return Err(RoomError::UnknownPeer(peer.clone()));
        }
        debug!(room = %self.code, peer = %peer, size = self.len(), "session left");
        let mut out = Vec::with_capacity(self.len() * 2);
        for other in self.others(peer) {
            out.push(Delivery::new(
                other.clone(),
                Message::PeerLeft {
                    peer_id: peer.clone(),
                    timestamp: now_ms,
                },
            ));
            out.push(Delivery::new(
                other.clone(),
                Message::Peers {
                    peers: self.roster_for(&other),
                },
            ));
        }
        Ok(out)
    }

    /// Every other session, as roster entries.
    pub fn roster_for(&self, peer: &PeerId) -> Vec<PeerInfo> {
        self.sessions
            .values()
            .filter(|s| &s.peer_id != peer)
            .map(|s| PeerInfo {
                id: s.peer_id.clone(),
                name: s.peer_id.display_name(),
                joined: s.joined,
            })
            .collect()
    }

    pub fn relay_to_all(&self, sender: &PeerId, message: Message) -> Vec<Delivery> {
        self.others(sender)
            .into_iter()
            .map(|to| Delivery::new(to, message.clone()))
            .collect()
    }

    /// Addressed delivery. An absent target drops the message (logged).
    pub fn relay_to_one(
        &self,
        sender: &PeerId,
        target: &PeerId,
        message: Message,
    ) -> Option<Delivery> {
        if !self.sessions.contains_key(target) || target == sender {
            warn!(
                room = %self.code,
                from = %sender,
                to = %target,
                kind = message.kind(),
                "relay target not in room; dropped"
            );
            return None;
        }
        Some(Delivery::new(target.clone(), message))
    }

    /// Route one message from an authenticated session. Sender identity is stamped here;
    /// payloads are never inspected.
    pub fn handle_inbound(&mut self, sender: &PeerId, message: Message, now_ms: u64) -> Vec<Delivery> {
        if !self.contains(sender) {
            warn!(room = %self.code, peer = %sender, kind = message.kind(), "message from unknown session dropped");
            return Vec::new();
        }
        match message {
            Message::Join { .. } | Message::GetPeers => vec![Delivery::new(
                sender.clone(),
                Message::Peers {
                    peers: self.roster_for(sender),
                },
            )],
            Message::Leave { .. } => self.leave(sender, now_ms).unwrap_or_default(),
            Message::Message { mut message } => {
                message.sender = sender.clone();
                self.relay_to_all(sender, Message::Message { message })
            }
            Message::Offer { sdp, to, .. } => {
                let forwarded = Message::Offer {
                    sdp,
                    from: sender.clone(),
                    to: to.clone(),
                };
                self.addressed(sender, &to, forwarded)
            }
            Message::Answer { sdp, to, .. } => {
                let forwarded = Message::Answer {
                    sdp,
                    from: sender.clone(),
                    to: to.clone(),
                };
                self.addressed(sender, &to, forwarded)
            }
            Message::IceCandidate { candidate, to, .. } => {
                let forwarded = Message::IceCandidate {
                    candidate,
                    from: sender.clone(),
                    to: to.clone(),
                };
                self.addressed(sender, &to, forwarded)
            }
            Message::Metadata {
                transfer_id,
                file_name,
                file_size,
                content_type,
                total_chunks,
                to,
                ..
            } => self.fan_out(
                sender,
                to.clone(),
                Message::Metadata {
                    transfer_id,
                    file_name,
                    file_size,
                    content_type,
                    total_chunks,
                    sender: Some(sender.clone()),
                    to,
                },
            ),
            Message::Chunk {
                transfer_id,
                chunk_index,
                chunk_data,
                to,
                ..
            } => self.fan_out(
                sender,
                to.clone(),
                Message::Chunk {
                    transfer_id,
                    chunk_index,
                    chunk_data,
                    sender: Some(sender.clone()),
                    to,
                },
            ),
            Message::Complete { transfer_id, to, .. } => self.fan_out(
                sender,
                to.clone(),
                Message::Complete {
                    transfer_id,
                    sender: Some(sender.clone()),
                    to,
                },
            ),
            other => {
                debug!(room = %self.code, peer = %sender, kind = other.kind(), "client sent server-only message; ignored");
                Vec::new()
            }
        }
    }

    fn addressed(&self, sender: &PeerId, target: &PeerId, message: Message) -> Vec<Delivery> {
        self.relay_to_one(sender, target, message)
            .into_iter()
            .collect()
    }

    fn fan_out(&self, sender: &PeerId, to: Option<PeerId>, message: Message) -> Vec<Delivery> {
        match to {
            Some(target) => self.addressed(sender, &target, message),
            None => self.relay_to_all(sender, message),
        }
    }

    fn others(&self, peer: &PeerId) -> Vec<PeerId> {
        self.sessions
            .keys()
            .filter(|p| *p != peer)
            .cloned()
            .collect()
    }
}
