//! One actor task per room. Owns the room state and every session's outbound queue.

use std::collections::HashMap;

use share_core::protocol::now_millis;
use share_core::{Delivery, Message, PeerId, Room, RoomCode, RoomError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::directory::DirectoryCommand;

/// Per-session outbound queue; the connection's writer task drains it.
pub type Outbound = mpsc::UnboundedSender<Message>;

/// Commands a room actor accepts.
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        peer_id: PeerId,
        outbound: Outbound,
        reply: oneshot::Sender<Result<RoomHandle, RoomError>>,
    },
    Leave {
        peer_id: PeerId,
    },
    Inbound {
        peer_id: PeerId,
        message: Message,
    },
    /// Directory asks an empty room to exit. Reply is false if someone joined meanwhile.
    Retire {
        reply: oneshot::Sender<bool>,
    },
}

/// Mailbox address of a room actor. `generation` tells apart successive rooms with the same code.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    code: RoomCode,
    generation: u64,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Forward a message from an authenticated session.
    pub fn inbound(&self, peer_id: PeerId, message: Message) {
        let _ = self.tx.send(RoomCommand::Inbound { peer_id, message });
    }

    pub fn leave(&self, peer_id: PeerId) {
        let _ = self.tx.send(RoomCommand::Leave { peer_id });
    }

    /// Hand a command to the actor. Returns it back if the actor is gone.
    pub(crate) fn send(&self, cmd: RoomCommand) -> Result<(), RoomCommand> {
        self.tx.send(cmd).map_err(|e| e.0)
    }

    /// Ask the room to exit. A room that already exited counts as retired.
    pub(crate) async fn retire(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RoomCommand::Retire { reply }).is_err() {
            return true;
        }
        rx.await.unwrap_or(true)
    }
}

/// Spawn a room actor. It reports `Vacated` to the directory whenever it becomes empty.
pub(crate) fn spawn(
    code: RoomCode,
    generation: u64,
    directory: mpsc::UnboundedSender<DirectoryCommand>,
) -> RoomHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = RoomHandle {
        code: code.clone(),
        generation,
        tx,
    };
    let actor = RoomActor {
        room: Room::new(code),
        handle: handle.clone(),
        outbound: HashMap::new(),
        directory,
    };
    tokio::spawn(actor.run(rx));
    handle
}

struct RoomActor {
    room: Room,
    handle: RoomHandle,
    outbound: HashMap<PeerId, Outbound>,
    directory: mpsc::UnboundedSender<DirectoryCommand>,
}

impl RoomActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
        info!(room = %self.room.code(), generation = self.handle.generation, "room opened");
        while let Some(cmd) = rx.recv().await {
            let was_empty = self.room.is_empty();
            match cmd {
                RoomCommand::Join {
                    peer_id,
                    outbound,
                    reply,
                } => match self.room.join(peer_id.clone(), now_millis()) {
                    Ok(deliveries) => {
                        self.outbound.insert(peer_id, outbound);
                        self.deliver(deliveries);
                        let _ = reply.send(Ok(self.handle.clone()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                },
                RoomCommand::Leave { peer_id } => {
                    if let Ok(deliveries) = self.room.leave(&peer_id, now_millis()) {
                        self.deliver(deliveries);
                    }
                    self.outbound.remove(&peer_id);
                }
                RoomCommand::Inbound { peer_id, message } => {
                    let deliveries = self.room.handle_inbound(&peer_id, message, now_millis());
                    self.deliver(deliveries);
                    if !self.room.contains(&peer_id) {
                        self.outbound.remove(&peer_id);
                    }
                }
                RoomCommand::Retire { reply } => {
                    let empty = self.room.is_empty();
                    let _ = reply.send(empty);
                    if empty {
                        break;
                    }
                    continue;
                }
            }
            if !was_empty && self.room.is_empty() {
                let _ = self.directory.send(DirectoryCommand::Vacated {
                    code: self.room.code().clone(),
                    generation: self.handle.generation,
                });
            }
        }
        info!(room = %self.room.code(), generation = self.handle.generation, "room closed");
    }

    fn deliver(&mut self, deliveries: Vec<Delivery>) {
        for Delivery { to, message } in deliveries {
            match self.outbound.get(&to) {
                Some(tx) => {
                    if tx.send(message).is_err() {
                        debug!(room = %self.room.code(), peer = %to, "outbound queue closed");
                    }
                }
                None => debug!(room = %self.room.code(), peer = %to, "no outbound queue for session"),
            }
        }
    }
}
