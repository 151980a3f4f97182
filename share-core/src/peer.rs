//! Per-remote-peer negotiation state machine.
//!
//! Local-initiated: idle → offering → awaiting-answer → connected.
//! Remote-initiated: idle → answering → connected. `closed` is reachable from anywhere and is terminal.

use std::fmt;

use crate::identity::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingAnswer,
    Answering,
    Connected,
    Closed,
}

impl NegotiationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::AwaitingAnswer => "awaiting-answer",
            NegotiationState::Answering => "answering",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("cannot {action} while {from}")]
    InvalidTransition {
        from: NegotiationState,
        action: &'static str,
    },
    #[error("negotiation timed out")]
    Timeout,
    #[error("negotiation failed: {0}")]
    Failed(String),
    #[error("description could not be parsed: {0}")]
    BadDescription(String),
    #[error("connection closed")]
    Closed,
}

/// What to do with an incoming offer given any existing connection to that peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    /// Answer it, replacing whatever attempt existed.
    Accept,
    /// Glare: our own attempt is live and we are the initiator.
    Ignore,
}

/// Client-side view of one remote peer.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    peer: PeerId,
    connection_id: String,
    state: NegotiationState,
    initiated_locally: bool,
}

impl PeerConnection {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            connection_id: uuid::Uuid::new_v4().simple().to_string(),
            state: NegotiationState::Idle,
            initiated_locally: false,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn initiated_locally(&self) -> bool {
        self.initiated_locally
    }

    pub fn is_connected(&self) -> bool {
        self.state == NegotiationState::Connected
    }

    /// A local-initiated attempt that has not yet connected or closed.
    pub fn is_live_local_attempt(&self) -> bool {
        matches!(
            self.state,
            NegotiationState::Offering | NegotiationState::AwaitingAnswer
        )
    }

    pub fn begin_offer(&mut self) -> Result<(), NegotiationError> {
        self.transition(NegotiationState::Idle, NegotiationState::Offering, "offer")?;
        self.initiated_locally = true;
        Ok(())
    }

    pub fn offer_sent(&mut self) -> Result<(), NegotiationError> {
        self.transition(
            NegotiationState::Offering,
            NegotiationState::AwaitingAnswer,
            "await answer",
        )
    }

    pub fn begin_answer(&mut self) -> Result<(), NegotiationError> {
        self.transition(NegotiationState::Idle, NegotiationState::Answering, "answer")
    }

    pub fn mark_connected(&mut self) -> Result<(), NegotiationError> {
        match self.state {
            NegotiationState::AwaitingAnswer | NegotiationState::Answering => {
                self.state = NegotiationState::Connected;
                Ok(())
            }
            from => Err(NegotiationError::InvalidTransition {
                from,
                action: "connect",
            }),
        }
    }

    /// Move to `closed`. Returns false if it already was.
    pub fn close(&mut self) -> bool {
        if self.state == NegotiationState::Closed {
            return false;
        }
        self.state = NegotiationState::Closed;
        true
    }

    fn transition(
        &mut self,
        from: NegotiationState,
        to: NegotiationState,
        action: &'static str,
    ) -> Result<(), NegotiationError> {
        if self.state != from {
            return Err(NegotiationError::InvalidTransition {
                from: self.state,
                action,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// Glare rule: the greater ID keeps its own live attempt and ignores the crossing offer.
pub fn decide_offer(
    local: &PeerId,
    remote: &PeerId,
    existing: Option<&PeerConnection>,
) -> OfferDecision {
    match existing {
        Some(conn) if conn.is_live_local_attempt() && local.should_initiate(remote) => {
            OfferDecision::Ignore
        }
        _ => OfferDecision::Accept,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_initiated_path() {
        let mut c = PeerConnection::new(PeerId::from("p1"));
        c.begin_offer().unwrap();
        assert_eq!(c.state(), NegotiationState::Offering);
        c.offer_sent().unwrap();
        assert!(c.is_live_local_attempt());
        c.mark_connected().unwrap();
        assert!(c.is_connected());
        assert!(c.initiated_locally());
    }

    #[test]
    fn remote_initiated_path() {
        let mut c = PeerConnection::new(PeerId::from("p2"));
        c.begin_answer().unwrap();
        assert_eq!(c.state(), NegotiationState::Answering);
        c.mark_connected().unwrap();
        assert!(!c.initiated_locally());
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut c = PeerConnection::new(PeerId::from("p"));
        assert!(matches!(
            c.mark_connected(),
            Err(NegotiationError::InvalidTransition {
                from: NegotiationState::Idle,
                ..
            })
        ));
        c.begin_offer().unwrap();
        assert!(c.begin_answer().is_err());
    }

    #[test]
    fn closed_is_terminal() {
        let mut c = PeerConnection::new(PeerId::from("p"));
        c.begin_offer().unwrap();
        assert!(c.close());
        assert!(!c.close());
        assert!(c.offer_sent().is_err());
        assert!(c.mark_connected().is_err());
        assert_eq!(c.state().to_string(), "closed");
    }

    #[test]
    fn glare_greater_side_ignores_crossing_offer() {
        let big = PeerId::from("p2");
        let small = PeerId::from("p1");
        let mut attempt = PeerConnection::new(small.clone());
        attempt.begin_offer().unwrap();
        attempt.offer_sent().unwrap();
        assert_eq!(decide_offer(&big, &small, Some(&attempt)), OfferDecision::Ignore);
        // The smaller side yields its own attempt.
        let mut theirs = PeerConnection::new(big.clone());
        theirs.begin_offer().unwrap();
        assert_eq!(decide_offer(&small, &big, Some(&theirs)), OfferDecision::Accept);
        assert_eq!(decide_offer(&big, &small, None), OfferDecision::Accept);
    }
}
