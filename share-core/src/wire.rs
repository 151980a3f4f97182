//! Framing. Relay: one JSON text frame per message. Peer channel: kind byte + 4-byte LE length + payload.

use crate::protocol::Message;

const HEADER_SIZE: usize = 5; // kind + len
const KIND_TEXT: u8 = 0;
const KIND_BINARY: u8 = 1;
/// Upper bound for any single frame, text or binary.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message as a JSON text frame.
pub fn encode_text(msg: &Message) -> Result<String, FrameEncodeError> {
    let text = serde_json::to_string(msg)?;
    if text.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    Ok(text)
}

/// Decode a JSON text frame.
pub fn decode_text(text: &str) -> Result<Message, FrameDecodeError> {
    if text.len() > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(serde_json::from_str(text)?)
}

/// Error encoding a message into a frame (serialization or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// A peer-channel frame. Framing is preserved by the channel; text carries JSON control messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl ChannelFrame {
    /// Payload length in bytes (what counts against the channel's buffered amount).
    pub fn len(&self) -> usize {
        match self {
            ChannelFrame::Text(t) => t.len(),
            ChannelFrame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a channel frame: 1 byte kind, 4 bytes LE length, payload.
pub fn encode_frame(frame: &ChannelFrame) -> Result<Vec<u8>, FrameEncodeError> {
    let (kind, payload) = match frame {
        ChannelFrame::Text(t) => (KIND_TEXT, t.as_bytes()),
        ChannelFrame::Binary(b) => (KIND_BINARY, b.as_slice()),
    };
    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.push(kind);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(ChannelFrame, usize), FrameDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let kind = bytes[0];
    let len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < HEADER_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let payload = &bytes[HEADER_SIZE..HEADER_SIZE + len];
    let frame = match kind {
        KIND_TEXT => ChannelFrame::Text(
            String::from_utf8(payload.to_vec()).map_err(|_| FrameDecodeError::Utf8)?,
        ),
        KIND_BINARY => ChannelFrame::Binary(payload.to_vec()),
        other => return Err(FrameDecodeError::UnknownKind(other)),
    };
    Ok((frame, HEADER_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, bad kind, or JSON failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("text frame is not valid UTF-8")]
    Utf8,
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}
