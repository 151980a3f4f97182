//! Room directory actor: maps room codes to room actors, spawns on first join,
//! retires rooms once they confirm they are still empty.

use std::collections::HashMap;

use share_core::{PeerId, RoomCode, RoomError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::room_actor::{self, Outbound, RoomCommand, RoomHandle};

#[derive(Debug)]
pub enum DirectoryCommand {
    Join {
        code: RoomCode,
        peer_id: PeerId,
        outbound: Outbound,
        reply: oneshot::Sender<Result<RoomHandle, RoomError>>,
    },
    /// Sent by a room actor when its last session left.
    Vacated { code: RoomCode, generation: u64 },
    RoomCount { reply: oneshot::Sender<usize> },
}

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error("relay is shutting down")]
    Unavailable,
}

/// Cloneable address of the directory actor.
#[derive(Debug, Clone)]
pub struct Directory {
    tx: mpsc::UnboundedSender<DirectoryCommand>,
}

impl Directory {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, tx.clone()));
        Self { tx }
    }

    /// Join a room, creating it if needed. Duplicate peer ids are rejected.
    pub async fn join(
        &self,
        code: RoomCode,
        peer_id: PeerId,
        outbound: Outbound,
    ) -> Result<RoomHandle, JoinError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DirectoryCommand::Join {
                code,
                peer_id,
                outbound,
                reply,
            })
            .map_err(|_| JoinError::Unavailable)?;
        Ok(rx.await.map_err(|_| JoinError::Unavailable)??)
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DirectoryCommand::RoomCount { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<DirectoryCommand>,
    self_tx: mpsc::UnboundedSender<DirectoryCommand>,
) {
    let mut rooms: HashMap<RoomCode, RoomHandle> = HashMap::new();
    let mut next_generation = 0u64;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            DirectoryCommand::Join {
                code,
                peer_id,
                outbound,
                reply,
            } => {
                let mut cmd = RoomCommand::Join {
                    peer_id,
                    outbound,
                    reply,
                };
                // A room that exited on its own is replaced once.
                for _ in 0..2 {
                    let handle = rooms.entry(code.clone()).or_insert_with(|| {
                        next_generation += 1;
                        room_actor::spawn(code.clone(), next_generation, self_tx.clone())
                    });
                    match handle.send(cmd) {
                        Ok(()) => break,
                        Err(returned) => {
                            debug!(room = %code, "room actor gone; respawning");
                            rooms.remove(&code);
                            cmd = returned;
                        }
                    }
                }
            }
            DirectoryCommand::Vacated { code, generation } => {
                let Some(handle) = rooms.get(&code) else {
                    continue;
                };
                if handle.generation() != generation {
                    continue;
                }
                if handle.retire().await {
                    rooms.remove(&code);
                    info!(room = %code, rooms = rooms.len(), "room retired");
                } else {
                    debug!(room = %code, "room repopulated before retirement");
                }
            }
            DirectoryCommand::RoomCount { reply } => {
                let _ = reply.send(rooms.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use share_core::Message;
    use std::time::Duration;

    fn code() -> RoomCode {
        RoomCode::parse("ABC123").unwrap()
    }

    #[tokio::test]
    async fn join_creates_room_and_welcomes() {
        let dir = Directory::spawn();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = dir.join(code(), PeerId::from("p1"), tx).await.unwrap();
        assert_eq!(handle.code().as_str(), "ABC123");
        assert!(matches!(rx.recv().await, Some(Message::Welcome { room_size: 1, .. })));
        assert_eq!(dir.room_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_peer_rejected() {
        let dir = Directory::spawn();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        dir.join(code(), PeerId::from("p1"), tx1).await.unwrap();
        let err = dir.join(code(), PeerId::from("p1"), tx2).await.unwrap_err();
        assert!(matches!(err, JoinError::Room(RoomError::DuplicatePeer(_))));
    }

    #[tokio::test]
    async fn empty_room_is_retired_and_recreated() {
        let dir = Directory::spawn();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = dir.join(code(), PeerId::from("p1"), tx).await.unwrap();
        first.leave(PeerId::from("p1"));
        let mut retired = false;
        for _ in 0..50 {
            if dir.room_count().await == 0 {
                retired = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(retired, "room should be retired once empty");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let second = dir.join(code(), PeerId::from("p1"), tx).await.unwrap();
        assert!(second.generation() > first.generation());
        assert!(matches!(rx.recv().await, Some(Message::Welcome { room_size: 1, .. })));
    }

    #[tokio::test]
    async fn rooms_are_independent() {
        let dir = Directory::spawn();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        dir.join(code(), PeerId::from("p1"), tx1).await.unwrap();
        dir.join(RoomCode::parse("XYZ789").unwrap(), PeerId::from("p1"), tx2)
            .await
            .unwrap();
        assert!(matches!(rx2.recv().await, Some(Message::Welcome { room_size: 1, .. })));
        assert_eq!(dir.room_count().await, 2);
    }
}
