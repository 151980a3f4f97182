//! Chunk protocol: split outbound files, track inbound transfers, reassemble byte-exact.
//!
//! One transfer is always `metadata`, then every chunk, then `complete`. The same plan
//! drives both channel kinds: the relay carries each chunk as independent base64 text,
//! the peer channel carries a JSON header followed by a raw binary frame.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, warn};

use crate::error::TransferError;
use crate::identity::PeerId;
use crate::protocol::Message;

/// Default raw chunk size on the peer channel.
pub const DEFAULT_CHANNEL_CHUNK_SIZE: usize = 64 * 1024; // 64 KiB

/// Default raw chunk size on the relay (before base64 expansion).
pub const DEFAULT_RELAY_CHUNK_SIZE: usize = 32_000;

/// Default inactivity bound after which an unfinished inbound transfer is evicted.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(120);

/// One chunk of a transfer: index and byte range [start, end).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub index: u32,
    pub start: usize,
    pub end: usize,
}

impl ChunkRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Split `total_len` bytes into fixed-size chunks. A zero chunk size falls back to the relay default.
pub fn split_into_chunks(total_len: usize, chunk_size: usize) -> Vec<ChunkRange> {
    let size = if chunk_size == 0 {
        DEFAULT_RELAY_CHUNK_SIZE
    } else {
        chunk_size
    };
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut index = 0u32;
    while start < total_len {
        let end = (start + size).min(total_len);
        out.push(ChunkRange { index, start, end });
        start = end;
        index += 1;
    }
    out
}

/// Encode one chunk for the relay. Self-contained: no state carries over between chunks.
pub fn encode_chunk(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode one relay chunk back to raw bytes. A leading `data:<mime>;base64,` prefix is stripped.
pub fn decode_chunk(data: &str) -> Result<Vec<u8>, TransferError> {
    let payload = strip_data_url_prefix(data);
    STANDARD
        .decode(payload.trim())
        .map_err(|e| TransferError::Decode(e.to_string()))
}

fn strip_data_url_prefix(data: &str) -> &str {
    if data.starts_with("data:") {
        if let Some(comma) = data.find(',') {
            return &data[comma + 1..];
        }
    }
    data
}

/// Encode a whole byte stream once as a `data:` URL.
pub fn data_url(content_type: &str, bytes: &[u8]) -> String {
    let mime = if content_type.is_empty() {
        "application/octet-stream"
    } else {
        content_type
    };
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

/// A file handed to the stack for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data,
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// One step of an outbound transfer, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferStep<'a> {
    Metadata(Message),
    Chunk { index: u32, bytes: &'a [u8] },
    Complete(Message),
}

/// Outbound transfer plan. `steps()` yields metadata exactly once, every chunk, then complete exactly once.
pub struct TransferPlan<'a> {
    file: &'a OutgoingFile,
    transfer_id: String,
    to: Option<PeerId>,
    ranges: Vec<ChunkRange>,
}

impl<'a> TransferPlan<'a> {
    pub fn new(
        file: &'a OutgoingFile,
        transfer_id: impl Into<String>,
        chunk_size: usize,
        to: Option<PeerId>,
    ) -> Self {
        Self {
            file,
            transfer_id: transfer_id.into(),
            to,
            ranges: split_into_chunks(file.data.len(), chunk_size),
        }
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn total_chunks(&self) -> u32 {
        self.ranges.len() as u32
    }

    pub fn steps(&self) -> impl Iterator<Item = TransferStep<'a>> + '_ {
        let metadata = Message::Metadata {
            transfer_id: self.transfer_id.clone(),
            file_name: self.file.name.clone(),
            file_size: self.file.size(),
            content_type: self.file.content_type.clone(),
            total_chunks: self.total_chunks(),
            sender: None,
            to: self.to.clone(),
        };
        let complete = Message::Complete {
            transfer_id: self.transfer_id.clone(),
            sender: None,
            to: self.to.clone(),
        };
        let data: &'a [u8] = &self.file.data;
        std::iter::once(TransferStep::Metadata(metadata))
            .chain(self.ranges.iter().map(move |r| TransferStep::Chunk {
                index: r.index,
                bytes: &data[r.start..r.end],
            }))
            .chain(std::iter::once(TransferStep::Complete(complete)))
    }
}

/// Declared attributes of an inbound transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMeta {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    pub total_chunks: u32,
}

/// Which channel delivered a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivedVia {
    PeerChannel,
    Relay,
}

/// A fully reassembled inbound file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub transfer_id: String,
    pub sender: PeerId,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub via: ReceivedVia,
}

impl ReceivedFile {
    /// Display form, re-encoded once from the raw bytes.
    pub fn data_url(&self) -> String {
        data_url(&self.content_type, &self.bytes)
    }
}

/// Where an inbound transfer stands after a chunk landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkProgress {
    pub transfer_id: String,
    pub received: usize,
    pub total: u32,
}

impl ChunkProgress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 1.0;
        }
        (self.received as f32 / self.total as f32).min(1.0)
    }
}

/// Receiver-side accumulator for one file.
pub struct TransferSession {
    meta: TransferMeta,
    sender: PeerId,
    chunks: HashMap<u32, Vec<u8>>,
    last_activity: Instant,
}

impl TransferSession {
    pub fn new(meta: TransferMeta, sender: PeerId, now: Instant) -> Self {
        Self {
            meta,
            sender,
            chunks: HashMap::new(),
            last_activity: now,
        }
    }

    pub fn meta(&self) -> &TransferMeta {
        &self.meta
    }

    /// Store a chunk. Indices outside [0, total_chunks) are rejected; a repeated index replaces the payload.
    pub fn insert(&mut self, index: u32, payload: Vec<u8>, now: Instant) -> Result<(), TransferError> {
        if index >= self.meta.total_chunks {
            return Err(TransferError::ChunkOutOfRange {
                transfer_id: self.meta.transfer_id.clone(),
                index,
                total: self.meta.total_chunks,
            });
        }
        self.chunks.insert(index, payload);
        self.last_activity = now;
        Ok(())
    }

    pub fn received_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_complete(&self) -> bool {
        (0..self.meta.total_chunks).all(|i| self.chunks.contains_key(&i))
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Concatenate raw chunk bytes in index order. Any gap is a `MissingChunk` error.
    pub fn finish(mut self, via: ReceivedVia) -> Result<ReceivedFile, TransferError> {
        // Sized from what arrived; the declared size is remote input.
        let received: usize = self.chunks.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(received);
        for index in 0..self.meta.total_chunks {
            match self.chunks.remove(&index) {
                Some(payload) => out.extend_from_slice(&payload),
                None => {
                    return Err(TransferError::MissingChunk {
                        transfer_id: self.meta.transfer_id,
                        index,
                        total: self.meta.total_chunks,
                    })
                }
            }
        }
        if out.len() as u64 != self.meta.file_size {
            warn!(
                transfer = %self.meta.transfer_id,
                declared = self.meta.file_size,
                actual = out.len(),
                "reassembled size differs from declared size"
            );
        }
        Ok(ReceivedFile {
            transfer_id: self.meta.transfer_id,
            sender: self.sender,
            file_name: self.meta.file_name,
            content_type: self.meta.content_type,
            bytes: out,
            via,
        })
    }
}

/// All in-flight inbound transfers for one channel kind, keyed by (sender, transfer id).
pub struct Reassembler {
    via: ReceivedVia,
    sessions: HashMap<(PeerId, String), TransferSession>,
}

impl Reassembler {
    pub fn new(via: ReceivedVia) -> Self {
        Self {
            via,
            sessions: HashMap::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.sessions.len()
    }

    /// Start (or restart) a transfer.
    pub fn on_metadata(&mut self, sender: PeerId, meta: TransferMeta, now: Instant) {
        debug!(
            transfer = %meta.transfer_id,
            peer = %sender,
            chunks = meta.total_chunks,
            size = meta.file_size,
            "inbound transfer started"
        );
        let key = (sender.clone(), meta.transfer_id.clone());
        if self
            .sessions
            .insert(key, TransferSession::new(meta, sender, now))
            .is_some()
        {
            warn!("metadata repeated for an in-flight transfer; restarting it");
        }
    }

    pub fn on_chunk(
        &mut self,
        sender: &PeerId,
        transfer_id: &str,
        index: u32,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<ChunkProgress, TransferError> {
        let session = self
            .sessions
            .get_mut(&(sender.clone(), transfer_id.to_string()))
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        session.insert(index, payload, now)?;
        Ok(ChunkProgress {
            transfer_id: transfer_id.to_string(),
            received: session.received_count(),
            total: session.meta.total_chunks,
        })
    }

    /// Finish a transfer. The session is removed whether or not reassembly succeeds.
    pub fn on_complete(
        &mut self,
        sender: &PeerId,
        transfer_id: &str,
    ) -> Result<ReceivedFile, TransferError> {
        let session = self
            .sessions
            .remove(&(sender.clone(), transfer_id.to_string()))
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        session.finish(self.via)
    }

    /// Remove sessions idle for longer than `max_idle`. Returns (sender, transfer id) of each.
    pub fn evict_stalled(&mut self, now: Instant, max_idle: Duration) -> Vec<(PeerId, String)> {
        let stale: Vec<(PeerId, String)> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.idle_for(now) > max_idle)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            self.sessions.remove(key);
        }
        stale
    }

    /// Abandon every transfer from a peer (peer left or its channel closed).
    pub fn abandon_from(&mut self, sender: &PeerId) -> Vec<String> {
        let ids: Vec<String> = self
            .sessions
            .keys()
            .filter(|(p, _)| p == sender)
            .map(|(_, t)| t.clone())
            .collect();
        for id in &ids {
            self.sessions.remove(&(sender.clone(), id.clone()));
        }
        ids
    }
}

struct PendingHeader {
    transfer_id: String,
    index: u32,
    size: u32,
}

/// Peer-channel receiver: pairs each `chunk-header` with the next binary frame from the same peer.
pub struct ChannelReceiver {
    reassembler: Reassembler,
    pending: HashMap<PeerId, PendingHeader>,
}

impl Default for ChannelReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelReceiver {
    pub fn new() -> Self {
        Self {
            reassembler: Reassembler::new(ReceivedVia::PeerChannel),
            pending: HashMap::new(),
        }
    }

    pub fn reassembler_mut(&mut self) -> &mut Reassembler {
        &mut self.reassembler
    }

    /// Handle a decoded control message. Returns the file when `complete` finishes a transfer.
    pub fn on_control(
        &mut self,
        peer: &PeerId,
        msg: Message,
        now: Instant,
    ) -> Result<Option<ReceivedFile>, TransferError> {
        match msg {
            Message::Metadata {
                transfer_id,
                file_name,
                file_size,
                content_type,
                total_chunks,
                ..
            } => {
                self.reassembler.on_metadata(
                    peer.clone(),
                    TransferMeta {
                        transfer_id,
                        file_name,
                        file_size,
                        content_type,
                        total_chunks,
                    },
                    now,
                );
                Ok(None)
            }
            Message::ChunkHeader {
                transfer_id,
                chunk_index,
                chunk_size,
            } => {
                if self
                    .pending
                    .insert(
                        peer.clone(),
                        PendingHeader {
                            transfer_id,
                            index: chunk_index,
                            size: chunk_size,
                        },
                    )
                    .is_some()
                {
                    warn!(peer = %peer, "chunk header replaced before its payload arrived");
                }
                Ok(None)
            }
            Message::Complete { transfer_id, .. } => {
                self.pending.remove(peer);
                self.reassembler.on_complete(peer, &transfer_id).map(Some)
            }
            other => {
                debug!(peer = %peer, kind = other.kind(), "ignoring non-transfer message on peer channel");
                Ok(None)
            }
        }
    }

    /// Handle a binary frame: the payload for the most recent header from this peer.
    /// `None` when the frame was dropped.
    pub fn on_binary(
        &mut self,
        peer: &PeerId,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<Option<ChunkProgress>, TransferError> {
        let Some(header) = self.pending.remove(peer) else {
            warn!(peer = %peer, len = payload.len(), "binary frame without chunk header dropped");
            return Ok(None);
        };
        if header.size as usize != payload.len() {
            warn!(
                peer = %peer,
                transfer = %header.transfer_id,
                index = header.index,
                expected = header.size,
                actual = payload.len(),
                "chunk size mismatch; chunk dropped"
            );
            return Ok(None);
        }
        self.reassembler
            .on_chunk(peer, &header.transfer_id, header.index, payload, now)
            .map(Some)
    }

    /// Forget everything from a peer whose channel closed.
    pub fn abandon_from(&mut self, peer: &PeerId) -> Vec<String> {
        self.pending.remove(peer);
        self.reassembler.abandon_from(peer)
    }
}
