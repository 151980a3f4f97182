//! WebSocket front end: one task per connection, upgraded at `/room/<CODE>?peerId=<id>`.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use share_core::{wire, Message, PeerId, RoomCode};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{Message as WsMessage, Result as WsResult};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::directory::Directory;

/// Grace period for the writer to flush queued messages and the close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Keep-alive for client sockets: ping on an interval, drop a socket that stays silent
/// (not even a pong) for `idle_timeout`. A dropped socket leaves its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("expected /room/<code>, got {0}")]
    NotARoom(String),
    #[error(transparent)]
    Code(#[from] share_core::RoomCodeError),
}

/// Bind and serve until the listener fails.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.bind_addr()).await?;
    info!(addr = %listener.local_addr()?, "relay listening");
    serve_with(listener, config.liveness()).await?;
    Ok(())
}

/// Accept loop on an already bound listener, with default keep-alive.
pub async fn serve(listener: TcpListener) -> std::io::Result<()> {
    serve_with(listener, Liveness::default()).await
}

pub async fn serve_with(listener: TcpListener, liveness: Liveness) -> std::io::Result<()> {
    let directory = Directory::spawn();
    loop {
        let (stream, addr) = listener.accept().await?;
        let directory = directory.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, directory, liveness).await {
                debug!(%addr, error = %e, "connection ended with error");
            }
        });
    }
}

/// Parse the upgrade target into a room code and the optional client-chosen peer id.
pub fn parse_room_path(target: &str) -> Result<(RoomCode, Option<PeerId>), PathError> {
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (target, None),
    };
    let code = path
        .trim_end_matches('/')
        .strip_prefix("/room/")
        .filter(|c| !c.contains('/'))
        .ok_or_else(|| PathError::NotARoom(path.to_string()))?;
    let code = RoomCode::parse(code)?;
    let peer = query.and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == "peerId")
            .map(|(_, v)| v)
            .filter(|v| !v.is_empty())
            .map(PeerId::from)
    });
    Ok((code, peer))
}

async fn handle_connection(
    stream: TcpStream,
    directory: Directory,
    liveness: Liveness,
) -> WsResult<()> {
    let mut target = None;
    let mut ws = accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            target = Some(req.uri().to_string());
            Ok(resp)
        },
    )
    .await?;

    let (code, peer_id) = match target.as_deref().map(parse_room_path) {
        Some(Ok((code, peer))) => (code, peer.unwrap_or_else(PeerId::generate)),
        Some(Err(e)) => {
            warn!(error = %e, "rejecting connection");
            return reject(&mut ws, e.to_string()).await;
        }
        None => return reject(&mut ws, "missing request target".into()).await,
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let room = match directory
        .join(code.clone(), peer_id.clone(), out_tx.clone())
        .await
    {
        Ok(room) => room,
        Err(e) => {
            warn!(room = %code, peer = %peer_id, error = %e, "join rejected");
            return reject(&mut ws, e.to_string()).await;
        }
    };
    info!(room = %code, peer = %peer_id, "peer connected");

    let (mut sink, mut source) = ws.split();
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + liveness.ping_interval,
            liveness.ping_interval,
        );
        loop {
            let frame = tokio::select! {
                msg = out_rx.recv() => {
                    let Some(msg) = msg else { break };
                    match wire::encode_text(&msg) {
                        Ok(text) => WsMessage::Text(text),
                        Err(e) => {
                            warn!(kind = msg.kind(), error = %e, "dropping unencodable message");
                            continue;
                        }
                    }
                }
                _ = ping.tick() => WsMessage::Ping(Vec::new()),
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let frame = match tokio::time::timeout(liveness.idle_timeout, source.next()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(_) => {
                info!(room = %code, peer = %peer_id, "peer went silent; dropping it");
                break;
            }
        };
        match frame {
            Ok(WsMessage::Text(text)) => match wire::decode_text(&text) {
                Ok(msg) => {
                    let leaving = matches!(msg, Message::Leave { .. });
                    room.inbound(peer_id.clone(), msg);
                    if leaving {
                        break;
                    }
                }
                Err(e) => {
                    debug!(room = %code, peer = %peer_id, error = %e, "undecodable frame");
                    let _ = out_tx.send(Message::Error {
                        message: format!("invalid message: {}", e),
                    });
                }
            },
            Ok(WsMessage::Binary(_)) => {
                debug!(room = %code, peer = %peer_id, "binary frame ignored");
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(room = %code, peer = %peer_id, error = %e, "read error");
                break;
            }
        }
    }

    room.leave(peer_id.clone());
    drop(out_tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(room = %code, peer = %peer_id, "writer did not drain in time");
    }
    info!(room = %code, peer = %peer_id, "peer disconnected");
    Ok(())
}

async fn reject(ws: &mut WebSocketStream<TcpStream>, reason: String) -> WsResult<()> {
    let text = wire::encode_text(&Message::Error { message: reason })
        .unwrap_or_else(|_| r#"{"type":"error","message":"rejected"}"#.to_string());
    ws.send(WsMessage::Text(text)).await?;
    ws.close(None).await
}
