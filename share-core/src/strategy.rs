//! Transfer method ordering and the transfer result type.
//!
//! The client's selector executes the plan; this module only decides which methods are
//! eligible and in which order.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// Default durable storage size limit.
pub const DEFAULT_DURABLE_LIMIT: u64 = 100 * 1024 * 1024; // 100 MiB

/// Inline transfers above this size still run but are logged as degraded.
pub const INLINE_SOFT_LIMIT: u64 = 2 * 1024 * 1024; // 2 MiB

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferMethod {
    PeerChannel,
    DurableStorage,
    ExternalStorage,
    Inline,
}

impl TransferMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMethod::PeerChannel => "peer-channel",
            TransferMethod::DurableStorage => "durable-storage",
            TransferMethod::ExternalStorage => "external-storage",
            TransferMethod::Inline => "inline",
        }
    }
}

impl fmt::Display for TransferMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the selector knows when it plans one outbound file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyContext {
    pub file_size: u64,
    pub durable_configured: bool,
    pub durable_limit: u64,
    /// A target peer was chosen and its connection is `connected`.
    pub peer_connected: bool,
    pub external_providers: usize,
}

/// Eligible methods in priority order. Inline is always last and always present.
pub fn plan(ctx: &StrategyContext) -> Vec<TransferMethod> {
    let mut out = Vec::with_capacity(4);
    if ctx.durable_configured && ctx.file_size < ctx.durable_limit {
        out.push(TransferMethod::DurableStorage);
    }
    if ctx.peer_connected {
        out.push(TransferMethod::PeerChannel);
    }
    if ctx.external_providers > 0 {
        out.push(TransferMethod::ExternalStorage);
    }
    out.push(TransferMethod::Inline);
    out
}

pub fn is_degraded(method: TransferMethod, file_size: u64) -> bool {
    method == TransferMethod::Inline && file_size > INLINE_SOFT_LIMIT
}

/// One failed attempt, kept in the final result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub method: TransferMethod,
    pub error: TransferError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResult {
    /// `reference` is a fetchable URL, or none when the bytes moved as message payload.
    Delivered {
        method: TransferMethod,
        reference: Option<String>,
        attempts: Vec<Attempt>,
    },
    Failed {
        error: TransferError,
        attempts: Vec<Attempt>,
    },
}

impl TransferResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferResult::Delivered { .. })
    }

    pub fn method(&self) -> Option<TransferMethod> {
        match self {
            TransferResult::Delivered { method, .. } => Some(*method),
            TransferResult::Failed { .. } => None,
        }
    }

    pub fn reference(&self) -> Option<&str> {
        match self {
            TransferResult::Delivered { reference, .. } => reference.as_deref(),
            TransferResult::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&TransferError> {
        match self {
            TransferResult::Delivered { .. } => None,
            TransferResult::Failed { error, .. } => Some(error),
        }
    }

    /// Failed attempts made before the final outcome.
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            TransferResult::Delivered { attempts, .. } | TransferResult::Failed { attempts, .. } => {
                attempts
            }
        }
    }
}
