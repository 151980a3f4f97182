//! WebShare protocol reference implementation.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod chunk;
pub mod core;
pub mod error;
pub mod identity;
pub mod peer;
pub mod protocol;
pub mod room;
pub mod strategy;
pub mod wire;

pub use chunk::{
    data_url, decode_chunk, encode_chunk, split_into_chunks, ChunkProgress, ChunkRange, OutgoingFile,
    ReceivedFile, ReceivedVia, TransferPlan, TransferStep, DEFAULT_CHANNEL_CHUNK_SIZE,
    DEFAULT_RELAY_CHUNK_SIZE, DEFAULT_STALL_TIMEOUT,
};
pub use core::{Action, ConnectivityState, RoomCore, RoomEvent};
pub use error::TransferError;
pub use identity::{PeerId, RoomCode, RoomCodeError};
pub use peer::{NegotiationError, NegotiationState, PeerConnection};
pub use protocol::{ChatMessage, Message, MessageKind, PeerInfo, PROTOCOL_VERSION};
pub use room::{Delivery, Room, RoomError};
pub use strategy::{Attempt, StrategyContext, TransferMethod, TransferResult};
pub use wire::{
    decode_frame, decode_text, encode_frame, encode_text, ChannelFrame, FrameDecodeError,
    FrameEncodeError,
};
