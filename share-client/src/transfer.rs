//! Outbound chunk loops: peer channel (header + raw binary frame) and relay (base64 per chunk).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use share_core::{
    encode_chunk, ChannelFrame, Message, OutgoingFile, PeerId, TransferError, TransferPlan,
    TransferStep,
};
use tracing::debug;

use crate::channel::{ChannelError, PeerChannel};
use crate::config::ClientConfig;
use crate::transport::RelaySink;

/// Fraction in 0.0..=1.0, reported after each chunk is handed to the channel.
pub type Progress<'a> = &'a (dyn Fn(f32) + Send + Sync);

/// Chunking and pacing for one channel kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub chunk_size: usize,
    /// Wait before the next payload while more than this many bytes are buffered.
    pub buffer_threshold: usize,
    pub chunk_delay: Duration,
}

impl SendOptions {
    pub fn peer_channel(config: &ClientConfig) -> Self {
        Self {
            chunk_size: config.channel_chunk_size,
            buffer_threshold: config.buffer_threshold(),
            chunk_delay: config.channel_chunk_delay(),
        }
    }

    pub fn relay(config: &ClientConfig) -> Self {
        Self {
            chunk_size: config.relay_chunk_size,
            buffer_threshold: usize::MAX,
            chunk_delay: config.relay_chunk_delay(),
        }
    }
}

/// Direct path to a specific peer.
#[async_trait]
pub trait PeerTransfer: Send + Sync {
    async fn is_connected(&self, peer: &PeerId) -> bool;

    async fn send_file(
        &self,
        peer: &PeerId,
        file: &OutgoingFile,
        transfer_id: &str,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<(), TransferError>;
}

/// Last-resort path: chunks through the relay. `target` None means every peer in the room.
#[async_trait]
pub trait InlineTransfer: Send + Sync {
    async fn send_inline(
        &self,
        file: &OutgoingFile,
        target: Option<&PeerId>,
        transfer_id: &str,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<(), TransferError>;
}

fn channel_lost(e: ChannelError) -> TransferError {
    TransferError::NegotiationFailed(e.to_string())
}

/// Send `file` over an open peer channel.
pub async fn send_via_channel(
    channel: &PeerChannel,
    file: &OutgoingFile,
    transfer_id: &str,
    options: SendOptions,
    progress: Progress<'_>,
) -> Result<(), TransferError> {
    let plan = TransferPlan::new(file, transfer_id, options.chunk_size, None);
    let total = plan.total_chunks();
    let mut sent = 0u32;
    for step in plan.steps() {
        match step {
            TransferStep::Metadata(msg) | TransferStep::Complete(msg) => {
                channel.send_message(&msg).map_err(channel_lost)?;
            }
            TransferStep::Chunk { index, bytes } => {
                channel
                    .wait_for_drain(options.buffer_threshold)
                    .await
                    .map_err(channel_lost)?;
                let header = Message::ChunkHeader {
                    transfer_id: transfer_id.to_string(),
                    chunk_index: index,
                    chunk_size: bytes.len() as u32,
                };
                channel.send_message(&header).map_err(channel_lost)?;
                channel
                    .send(ChannelFrame::Binary(bytes.to_vec()))
                    .map_err(channel_lost)?;
                sent += 1;
                progress(sent as f32 / total as f32);
                pace(options.chunk_delay).await;
            }
        }
    }
    // Queued is not sent: fail if the channel dies before the last frame is written.
    channel.wait_for_drain(0).await.map_err(channel_lost)?;
    if total == 0 {
        progress(1.0);
    }
    debug!(peer = %channel.peer(), transfer = %transfer_id, chunks = total, "sent over peer channel");
    Ok(())
}

/// Send `file` through the relay, each chunk encoded on its own just before it is sent.
pub async fn send_via_relay(
    relay: &dyn RelaySink,
    file: &OutgoingFile,
    target: Option<&PeerId>,
    transfer_id: &str,
    options: SendOptions,
    progress: Progress<'_>,
) -> Result<(), TransferError> {
    let plan = TransferPlan::new(file, transfer_id, options.chunk_size, target.cloned());
    let total = plan.total_chunks();
    let mut sent = 0u32;
    for step in plan.steps() {
        match step {
            TransferStep::Metadata(msg) | TransferStep::Complete(msg) => relay.send(msg)?,
            TransferStep::Chunk { index, bytes } => {
                relay.send(Message::Chunk {
                    transfer_id: transfer_id.to_string(),
                    chunk_index: index,
                    chunk_data: encode_chunk(bytes),
                    sender: None,
                    to: target.cloned(),
                })?;
                sent += 1;
                progress(sent as f32 / total as f32);
                pace(options.chunk_delay).await;
            }
        }
    }
    if total == 0 {
        progress(1.0);
    }
    debug!(transfer = %transfer_id, chunks = total, "sent through relay");
    Ok(())
}

async fn pace(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}

/// Inline transfer over the room's relay transport.
pub struct RelayInline {
    relay: Arc<dyn RelaySink>,
    options: SendOptions,
}

impl RelayInline {
    pub fn new(relay: Arc<dyn RelaySink>, options: SendOptions) -> Self {
        Self { relay, options }
    }
}

#[async_trait]
impl InlineTransfer for RelayInline {
    async fn send_inline(
        &self,
        file: &OutgoingFile,
        target: Option<&PeerId>,
        transfer_id: &str,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<(), TransferError> {
        send_via_relay(
            self.relay.as_ref(),
            file,
            target,
            transfer_id,
            self.options,
            progress,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use share_core::{Action, ReceivedVia, RoomCore, RoomEvent};
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Message>>,
        fail: bool,
    }

    impl RelaySink for RecordingSink {
        fn send(&self, msg: Message) -> Result<(), TransferError> {
            if self.fail {
                return Err(TransferError::ConnectionLost);
            }
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
    }

    /// What the relay does before delivery.
    fn stamp(msg: Message, from: &PeerId) -> Message {
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
                sender: Some(from.clone()),
                to,
            },
            Message::Chunk {
                transfer_id,
                chunk_index,
                chunk_data,
                to,
                ..
            } => Message::Chunk {
                transfer_id,
                chunk_index,
                chunk_data,
                sender: Some(from.clone()),
                to,
            },
            Message::Complete { transfer_id, to, .. } => Message::Complete {
                transfer_id,
                sender: Some(from.clone()),
                to,
            },
            other => other,
        }
    }

    fn received(actions: Vec<Action>) -> Option<share_core::ReceivedFile> {
        actions.into_iter().find_map(|a| match a {
            Action::Emit(RoomEvent::FileReceived(f)) => Some(f),
            _ => None,
        })
    }

    fn fast(chunk_size: usize) -> SendOptions {
        SendOptions {
            chunk_size,
            buffer_threshold: 4 * chunk_size,
            chunk_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn ten_bytes_in_three_relay_chunks() {
        let sink = RecordingSink::default();
        let file = OutgoingFile::new("f.txt", "text/plain", b"0123456789".to_vec());
        let progress = Mutex::new(Vec::new());
        let report = |f: f32| progress.lock().unwrap().push(f);
        let to = PeerId::from("p2");
        send_via_relay(&sink, &file, Some(&to), "t1", fast(4), &report)
            .await
            .unwrap();

        let sent = sink.sent.into_inner().unwrap();
        let kinds: Vec<_> = sent.iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, ["metadata", "chunk", "chunk", "chunk", "complete"]);
        assert_eq!(progress.into_inner().unwrap().last(), Some(&1.0));

        let mut core = RoomCore::new(to);
        let from = PeerId::from("p1");
        let mut file_out = None;
        for msg in sent {
            file_out = file_out.or(received(core.on_relay_message(stamp(msg, &from), Instant::now())));
        }
        let got = file_out.expect("file reassembled");
        assert_eq!(got.bytes, b"0123456789");
        assert_eq!(got.sender, from);
        assert_eq!(got.via, ReceivedVia::Relay);
    }

    #[tokio::test]
    async fn relay_send_stops_on_lost_connection() {
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let file = OutgoingFile::new("f", "application/octet-stream", vec![1; 10]);
        let err = send_via_relay(&sink, &file, None, "t", fast(4), &|_| {})
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::ConnectionLost);
    }

    #[tokio::test]
    async fn file_crosses_peer_channel_byte_exact() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (sender, _) = PeerChannel::spawn(PeerId::from("p2"), a);
        let (_receiver, mut frames) = PeerChannel::spawn(PeerId::from("p1"), b);

        let mut data = vec![0u8; 150_000];
        rand::thread_rng().fill_bytes(&mut data);
        let file = OutgoingFile::new("blob.bin", "application/octet-stream", data.clone());
        let send = tokio::spawn(async move {
            send_via_channel(&sender, &file, "t2", fast(16 * 1024), &|_| {}).await
        });

        let mut core = RoomCore::new(PeerId::from("p2"));
        let from = PeerId::from("p1");
        let got = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(frame) = frames.recv().await {
                if let Some(f) = received(core.on_channel_frame(&from, frame, Instant::now())) {
                    return Some(f);
                }
            }
            None
        })
        .await
        .unwrap()
        .expect("file reassembled");
        send.await.unwrap().unwrap();
        assert_eq!(got.bytes, data);
        assert_eq!(got.via, ReceivedVia::PeerChannel);
    }

    #[tokio::test]
    async fn channel_send_waits_for_frames_to_be_written() {
        let (local, remote) = tokio::io::duplex(64);
        let (channel, _) = PeerChannel::spawn(PeerId::from("p2"), local);
        let file = OutgoingFile::new("f.bin", "application/octet-stream", vec![1; 100_000]);
        let options = SendOptions {
            chunk_size: 4096,
            buffer_threshold: 1 << 20,
            chunk_delay: Duration::ZERO,
        };
        let send =
            tokio::spawn(async move { send_via_channel(&channel, &file, "t", options, &|_| {}).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!send.is_finished(), "everything is still buffered");

        drop(remote);
        let err = tokio::time::timeout(Duration::from_secs(2), send)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TransferError::NegotiationFailed(_)));
    }

    #[tokio::test]
    async fn closed_channel_fails_as_negotiation_error() {
        let (a, _b) = tokio::io::duplex(1024);
        let (channel, _) = PeerChannel::spawn(PeerId::from("p2"), a);
        channel.close();
        let file = OutgoingFile::new("f", "text/plain", vec![1; 10]);
        let err = send_via_channel(&channel, &file, "t", fast(4), &|_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NegotiationFailed(_)));
    }
}
