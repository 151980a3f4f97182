//! Peer and room identity: opaque peer IDs, room codes, initiator tie-break.

use std::cmp::Ordering;
use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Room code length (fixed).
pub const ROOM_CODE_LEN: usize = 6;

/// Length of relay/client generated peer IDs.
const GENERATED_PEER_ID_LEN: usize = 11;

/// Peer ID: opaque client-generated string, unique within a room while the session lives.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Random lowercase alphanumeric ID, used when a client does not bring its own.
    pub fn generate() -> Self {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(GENERATED_PEER_ID_LEN)
            .map(|b| (b as char).to_ascii_lowercase())
            .collect();
        PeerId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Display name used in rosters: "Device " + first 6 chars.
    pub fn display_name(&self) -> String {
        let short: String = self.0.chars().take(6).collect();
        format!("Device {}", short)
    }

    /// Deterministic initiator choice: the lexicographically greater ID sends the offer.
    /// Both sides evaluate this independently and agree, so only one offer is made per pair.
    pub fn should_initiate(&self, remote: &PeerId) -> bool {
        self.0.cmp(&remote.0) == Ordering::Greater
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// Room code: fixed-length uppercase alphanumeric.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    /// Parse a user-typed code. Input is upper-cased; length and charset are enforced.
    pub fn parse(input: &str) -> Result<Self, RoomCodeError> {
        let code = input.trim().to_ascii_uppercase();
        if code.len() != ROOM_CODE_LEN {
            return Err(RoomCodeError::Length(code.len()));
        }
        if let Some(c) = code.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(RoomCodeError::Character(c));
        }
        Ok(RoomCode(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = RoomCodeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        RoomCode::parse(&s)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomCodeError {
    #[error("room code must be {ROOM_CODE_LEN} characters, got {0}")]
    Length(usize),
    #[error("room code contains invalid character {0:?}")]
    Character(char),
}
