//! Transfer error taxonomy shared by the relay path, the peer path and the strategy selector.

/// Why a transfer step failed. Everything except `AllMethodsExhausted` is a fallback trigger.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// Relay transport dropped (or was never up) while sending.
    #[error("connection to the relay lost")]
    ConnectionLost,
    /// Peer channel unusable: negotiation failed, timed out, or the channel closed mid-transfer.
    #[error("peer channel unavailable: {0}")]
    NegotiationFailed(String),
    /// Reassembly integrity failure; the partial data was discarded.
    #[error("transfer {transfer_id}: chunk {index} of {total} missing")]
    MissingChunk {
        transfer_id: String,
        index: u32,
        total: u32,
    },
    /// A storage collaborator refused or failed the upload.
    #[error("{provider} rejected upload: {reason}")]
    UploadRejected { provider: String, reason: String },
    /// Terminal: every method was tried and failed.
    #[error("all transfer methods failed")]
    AllMethodsExhausted,
    #[error("unknown transfer {0}")]
    UnknownTransfer(String),
    #[error("transfer {transfer_id}: chunk index {index} outside 0..{total}")]
    ChunkOutOfRange {
        transfer_id: String,
        index: u32,
        total: u32,
    },
    #[error("chunk payload could not be decoded: {0}")]
    Decode(String),
    /// Receiver gave up on a transfer that stopped making progress.
    #[error("transfer {0} abandoned after inactivity")]
    Stalled(String),
}

impl TransferError {
    /// Short label for logs and attempt lists.
    pub fn label(&self) -> &'static str {
        match self {
            TransferError::ConnectionLost => "connection-lost",
            TransferError::NegotiationFailed(_) => "negotiation-failed",
            TransferError::MissingChunk { .. } => "missing-chunk",
            TransferError::UploadRejected { .. } => "upload-rejected",
            TransferError::AllMethodsExhausted => "all-methods-exhausted",
            TransferError::UnknownTransfer(_) => "unknown-transfer",
            TransferError::ChunkOutOfRange { .. } => "chunk-out-of-range",
            TransferError::Decode(_) => "decode",
            TransferError::Stalled(_) => "stalled",
        }
    }
}
