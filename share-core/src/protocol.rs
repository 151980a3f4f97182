//! WebShare wire protocol: message types and version.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Current protocol version. Used in the direct-channel handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// All wire message types. Encoding is JSON with a kebab-case `type` tag (see wire module).
///
/// The relay and the peer channel share this enum; `chunk-header` only travels on peer
/// channels, the others only through the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Message {
    /// Sent by a client after every (re)connect; the relay answers with the roster.
    Join { room_id: String, peer_id: PeerId },
    /// Graceful leave before closing the socket.
    Leave { peer_id: PeerId },
    /// Roster query, answered to the requester only.
    GetPeers,
    /// Greeting sent to a session right after it joined.
    Welcome { peer_id: PeerId, room_size: usize },
    /// Current roster, excluding the recipient.
    Peers { peers: Vec<PeerInfo> },
    /// Chat or shared-file message.
    Message { message: ChatMessage },
    Offer { sdp: String, from: PeerId, to: PeerId },
    Answer { sdp: String, from: PeerId, to: PeerId },
    IceCandidate { candidate: String, from: PeerId, to: PeerId },
    /// Transfer start: declared size, type and chunk count.
    Metadata {
        transfer_id: String,
        file_name: String,
        file_size: u64,
        content_type: String,
        total_chunks: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
    },
    /// Relay chunk: base64 payload, independently decodable.
    Chunk {
        transfer_id: String,
        chunk_index: u32,
        chunk_data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
    },
    /// Peer-channel chunk header; the raw bytes follow as the next binary frame.
    ChunkHeader {
        transfer_id: String,
        chunk_index: u32,
        chunk_size: u32,
    },
    /// Transfer end: receiver verifies completeness.
    Complete {
        transfer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<PeerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
    },
    PeerJoined { peer_id: PeerId, timestamp: u64 },
    PeerLeft { peer_id: PeerId, timestamp: u64 },
    Error { message: String },
}

impl Message {
    /// Tag name as it appears on the wire (for logs).
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join { .. } => "join",
            Message::Leave { .. } => "leave",
            Message::GetPeers => "get-peers",
            Message::Welcome { .. } => "welcome",
            Message::Peers { .. } => "peers",
            Message::Message { .. } => "message",
            Message::Offer { .. } => "offer",
            Message::Answer { .. } => "answer",
            Message::IceCandidate { .. } => "ice-candidate",
            Message::Metadata { .. } => "metadata",
            Message::Chunk { .. } => "chunk",
            Message::ChunkHeader { .. } => "chunk-header",
            Message::Complete { .. } => "complete",
            Message::PeerJoined { .. } => "peer-joined",
            Message::PeerLeft { .. } => "peer-left",
            Message::Error { .. } => "error",
        }
    }
}

/// Roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub name: String,
    /// Join time, ms since epoch.
    pub joined: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
    Image,
}

/// Displayable room message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sender: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// URL (storage upload) or data URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn text(sender: PeerId, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: MessageKind::Text,
            sender,
            content: Some(content.into()),
            file_name: None,
            file_size: None,
            file_data: None,
            timestamp: now_millis(),
        }
    }

    /// File shared by reference. Image when the content type is `image/*`.
    pub fn file_link(
        sender: PeerId,
        file_name: impl Into<String>,
        file_size: u64,
        content_type: &str,
        url: impl Into<String>,
    ) -> Self {
        let kind = if content_type.starts_with("image/") {
            MessageKind::Image
        } else {
            MessageKind::File
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            sender,
            content: None,
            file_name: Some(file_name.into()),
            file_size: Some(file_size),
            file_data: Some(url.into()),
            timestamp: now_millis(),
        }
    }
}

/// Fresh transfer identifier, unique per file per direction.
pub fn new_transfer_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Milliseconds since the Unix epoch (0 if the clock is before it).
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tags_and_field_names_match_wire_format() {
        let msg = Message::IceCandidate {
            candidate: "tcp 10.0.0.2 45680".into(),
            from: PeerId::from("a"),
            to: PeerId::from("b"),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({"type": "ice-candidate", "candidate": "tcp 10.0.0.2 45680", "from": "a", "to": "b"})
        );

        let meta = Message::Metadata {
            transfer_id: "t1".into(),
            file_name: "a.txt".into(),
            file_size: 10,
            content_type: "text/plain".into(),
            total_chunks: 3,
            sender: None,
            to: None,
        };
        let v = serde_json::to_value(&meta).unwrap();
        assert_eq!(v["type"], "metadata");
        assert_eq!(v["transferId"], "t1");
        assert_eq!(v["totalChunks"], 3);
        assert!(v.get("sender").is_none());
    }

    #[test]
    fn parses_client_join_and_peer_events() {
        let join: Message =
            serde_json::from_value(json!({"type": "join", "roomId": "ABC123", "peerId": "p1"}))
                .unwrap();
        assert_eq!(
            join,
            Message::Join {
                room_id: "ABC123".into(),
                peer_id: PeerId::from("p1")
            }
        );
        let left: Message =
            serde_json::from_value(json!({"type": "peer-left", "peerId": "p1", "timestamp": 5}))
                .unwrap();
        assert_eq!(left.kind(), "peer-left");
        let get: Message = serde_json::from_value(json!({"type": "get-peers"})).unwrap();
        assert_eq!(get, Message::GetPeers);
    }

    #[test]
    fn chat_message_uses_type_field() {
        let msg = ChatMessage::text(PeerId::from("p1"), "hello");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "text");
        assert_eq!(v["content"], "hello");
        assert!(v.get("fileData").is_none());
    }

    #[test]
    fn file_link_detects_images() {
        let img = ChatMessage::file_link(PeerId::from("p"), "a.png", 3, "image/png", "https://x/a");
        assert_eq!(img.kind, MessageKind::Image);
        let doc = ChatMessage::file_link(PeerId::from("p"), "a.pdf", 3, "application/pdf", "u");
        assert_eq!(doc.kind, MessageKind::File);
    }
}
