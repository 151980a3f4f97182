//! Connectors turn offer/answer descriptions and trickled candidates into an open peer channel.
//!
//! `TcpConnector`: the offerer listens on an ephemeral port and advertises `tcp <ip> <port>`
//! candidates; the answerer dials each candidate and presents the token from the offer.
//! Handshake: `[version:u8][len:u8][token]`, answered by one byte (1 = accepted).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use share_core::{ChannelFrame, NegotiationError, PeerId, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::PeerChannel;

const DESCRIPTION_PREFIX: &str = "webshare-tcp/1";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPTED: u8 = 1;
const REFUSED: u8 = 0;

pub type OpenedChannel = (PeerChannel, mpsc::UnboundedReceiver<ChannelFrame>);

/// One side of a negotiation in progress.
pub struct Negotiation {
    /// Local description to send as the offer or answer.
    pub description: String,
    /// Local candidates, forwarded one message each as they are gathered.
    pub candidates: mpsc::UnboundedReceiver<String>,
    /// Resolves once the channel is open (or the attempt failed).
    pub opened: oneshot::Receiver<Result<OpenedChannel, NegotiationError>>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn create_offer(
        &self,
        remote: &PeerId,
        connection_id: &str,
    ) -> Result<Negotiation, NegotiationError>;

    async fn accept_offer(
        &self,
        remote: &PeerId,
        connection_id: &str,
        offer: &str,
    ) -> Result<Negotiation, NegotiationError>;

    async fn apply_answer(&self, connection_id: &str, answer: &str) -> Result<(), NegotiationError>;

    async fn add_candidate(&self, connection_id: &str, candidate: &str)
        -> Result<(), NegotiationError>;

    /// Drop whatever is left of an attempt (listeners, dials). Idempotent.
    fn release(&self, connection_id: &str);
}

type OpenedSlot = Arc<Mutex<Option<oneshot::Sender<Result<OpenedChannel, NegotiationError>>>>>;

enum Pending {
    Offer {
        token: String,
        listener: JoinHandle<()>,
    },
    Answer {
        remote: PeerId,
        token: String,
        opened: OpenedSlot,
        dials: Vec<JoinHandle<()>>,
    },
}

impl Pending {
    fn abort(self) {
        match self {
            Pending::Offer { listener, .. } => listener.abort(),
            Pending::Answer { dials, .. } => dials.into_iter().for_each(|d| d.abort()),
        }
    }
}

/// Direct TCP connector.
pub struct TcpConnector {
    host: String,
    pending: Mutex<HashMap<String, Pending>>,
}

impl TcpConnector {
    /// `host` is both the listen address and the advertised candidate address.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn with_pending<T>(&self, f: impl FnOnce(&mut HashMap<String, Pending>) -> T) -> T {
        let mut guard = match self.pending.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn create_offer(
        &self,
        remote: &PeerId,
        connection_id: &str,
    ) -> Result<Negotiation, NegotiationError> {
        let listener = TcpListener::bind((self.host.as_str(), 0))
            .await
            .map_err(|e| NegotiationError::Failed(format!("listen: {}", e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| NegotiationError::Failed(format!("listen: {}", e)))?;
        let token = connection_id.to_string();

        let (candidates_tx, candidates) = mpsc::unbounded_channel();
        let _ = candidates_tx.send(candidate_for(addr));
        let (opened_tx, opened) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, remote.clone(), token.clone(), opened_tx));
        self.with_pending(|p| {
            if let Some(old) = p.insert(
                connection_id.to_string(),
                Pending::Offer {
                    token: token.clone(),
                    listener: task,
                },
            ) {
                old.abort();
            }
        });
        debug!(peer = %remote, %addr, "offering direct channel");
        Ok(Negotiation {
            description: format!("{} {}", DESCRIPTION_PREFIX, token),
            candidates,
            opened,
        })
    }

    async fn accept_offer(
        &self,
        remote: &PeerId,
        connection_id: &str,
        offer: &str,
    ) -> Result<Negotiation, NegotiationError> {
        let token = parse_description(offer)?;
        // Answerer gathers no candidates: it dials the offerer's.
        let (_, candidates) = mpsc::unbounded_channel();
        let (opened_tx, opened) = oneshot::channel();
        self.with_pending(|p| {
            if let Some(old) = p.insert(
                connection_id.to_string(),
                Pending::Answer {
                    remote: remote.clone(),
                    token: token.clone(),
                    opened: Arc::new(Mutex::new(Some(opened_tx))),
                    dials: Vec::new(),
                },
            ) {
                old.abort();
            }
        });
        Ok(Negotiation {
            description: format!("{} {}", DESCRIPTION_PREFIX, token),
            candidates,
            opened,
        })
    }

    async fn apply_answer(&self, connection_id: &str, answer: &str) -> Result<(), NegotiationError> {
        let token = parse_description(answer)?;
        self.with_pending(|p| match p.get(connection_id) {
            Some(Pending::Offer { token: expected, .. }) if *expected == token => Ok(()),
            Some(Pending::Offer { .. }) => Err(NegotiationError::BadDescription(
                "answer does not match offer".into(),
            )),
            _ => Err(NegotiationError::Closed),
        })
    }

    async fn add_candidate(
        &self,
        connection_id: &str,
        candidate: &str,
    ) -> Result<(), NegotiationError> {
        let addr = parse_candidate(candidate)?;
        self.with_pending(|p| match p.get_mut(connection_id) {
            Some(Pending::Answer {
                remote,
                token,
                opened,
                dials,
            }) => {
                dials.push(tokio::spawn(dial(
                    addr,
                    remote.clone(),
                    token.clone(),
                    opened.clone(),
                )));
                Ok(())
            }
            Some(Pending::Offer { .. }) => {
                debug!(%addr, "offerer ignores remote candidate");
                Ok(())
            }
            None => Err(NegotiationError::Closed),
        })
    }

    fn release(&self, connection_id: &str) {
        if let Some(p) = self.with_pending(|p| p.remove(connection_id)) {
            p.abort();
        }
    }
}

fn candidate_for(addr: SocketAddr) -> String {
    format!("tcp {} {}", addr.ip(), addr.port())
}

fn parse_description(description: &str) -> Result<String, NegotiationError> {
    match description.split_once(' ') {
        Some((DESCRIPTION_PREFIX, token)) if !token.is_empty() && token.len() <= u8::MAX as usize => {
            Ok(token.to_string())
        }
        _ => Err(NegotiationError::BadDescription(description.to_string())),
    }
}

fn parse_candidate(candidate: &str) -> Result<SocketAddr, NegotiationError> {
    let mut parts = candidate.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("tcp"), Some(ip), Some(port), None) => format!("{}:{}", ip, port)
            .parse()
            .map_err(|_| NegotiationError::BadDescription(candidate.to_string())),
        _ => Err(NegotiationError::BadDescription(candidate.to_string())),
    }
}

async fn accept_loop(
    listener: TcpListener,
    remote: PeerId,
    token: String,
    mut opened: oneshot::Sender<Result<OpenedChannel, NegotiationError>>,
) {
    loop {
        let (mut stream, addr) = tokio::select! {
            r = listener.accept() => match r {
                Ok(s) => s,
                Err(e) => {
                    let _ = opened.send(Err(NegotiationError::Failed(format!("accept: {}", e))));
                    return;
                }
            },
            _ = opened.closed() => return,
        };
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake_accept(&mut stream, &token)).await {
            Ok(Ok(())) => {
                let _ = stream.set_nodelay(true);
                info!(peer = %remote, %addr, "direct channel accepted");
                let _ = opened.send(Ok(PeerChannel::spawn(remote, stream)));
                return;
            }
            Ok(Err(e)) => warn!(peer = %remote, %addr, error = %e, "direct handshake refused"),
            Err(_) => warn!(peer = %remote, %addr, "direct handshake timed out"),
        }
    }
}

async fn dial(addr: SocketAddr, remote: PeerId, token: String, opened: OpenedSlot) {
    let attempt = async {
        let mut stream = TcpStream::connect(addr).await?;
        handshake_connect(&mut stream, &token).await?;
        std::io::Result::Ok(stream)
    };
    let stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, attempt).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!(peer = %remote, %addr, error = %e, "candidate dial failed");
            return;
        }
        Err(_) => {
            debug!(peer = %remote, %addr, "candidate dial timed out");
            return;
        }
    };
    let slot = match opened.lock() {
        Ok(mut g) => g.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    match slot {
        Some(tx) => {
            let _ = stream.set_nodelay(true);
            info!(peer = %remote, %addr, "direct channel connected");
            let _ = tx.send(Ok(PeerChannel::spawn(remote, stream)));
        }
        None => debug!(peer = %remote, %addr, "another candidate already won"),
    }
}

async fn handshake_accept(stream: &mut TcpStream, token: &str) -> std::io::Result<()> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut presented = vec![0u8; head[1] as usize];
    stream.read_exact(&mut presented).await?;
    if head[0] != PROTOCOL_VERSION || presented != token.as_bytes() {
        let _ = stream.write_all(&[REFUSED]).await;
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "version or token mismatch",
        ));
    }
    stream.write_all(&[ACCEPTED]).await?;
    stream.flush().await
}

async fn handshake_connect(stream: &mut TcpStream, token: &str) -> std::io::Result<()> {
    stream.write_all(&handshake_bytes(token)).await?;
    stream.flush().await?;
    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack).await?;
    if ack[0] != ACCEPTED {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "handshake refused",
        ));
    }
    Ok(())
}

fn handshake_bytes(token: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + token.len());
    out.push(PROTOCOL_VERSION);
    out.push(token.len() as u8);
    out.extend_from_slice(token.as_bytes());
    out
}
