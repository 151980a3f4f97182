//! Peer channel: framed duplex over any byte stream (TCP in production, `duplex` in tests).
//! Frames are `[kind:u8][len:u32 LE][payload]`; the writer tracks how many bytes are queued
//! but not yet written so senders can wait for the buffer to drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use share_core::{wire, ChannelFrame, FrameDecodeError, FrameEncodeError, Message, PeerId};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, warn};

const READ_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("peer channel closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}

/// Sending half of a peer channel. Cheap to clone; all clones share one writer, which stops
/// once every clone is gone.
#[derive(Debug, Clone)]
pub struct PeerChannel {
    peer: PeerId,
    frames: mpsc::UnboundedSender<ChannelFrame>,
    shared: Arc<Shared>,
}

/// State the reader and writer tasks share with the handles.
#[derive(Debug)]
struct Shared {
    buffered: AtomicUsize,
    drained: Notify,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Returns true if this call closed it.
    fn close(&self) -> bool {
        let was_closed = self.closed.send_replace(true);
        self.drained.notify_waiters();
        !was_closed
    }
}

impl PeerChannel {
    /// Start reader and writer tasks over `stream`. Inbound frames arrive on the returned
    /// receiver; it ends when the channel closes from either side.
    pub fn spawn<S>(peer: PeerId, stream: S) -> (Self, mpsc::UnboundedReceiver<ChannelFrame>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            buffered: AtomicUsize::new(0),
            drained: Notify::new(),
            closed,
        });
        tokio::spawn(write_loop(peer.clone(), shared.clone(), writer, frames_rx));
        tokio::spawn(read_loop(peer.clone(), shared.clone(), reader, inbound_tx));
        (
            Self {
                peer,
                frames: frames_tx,
                shared,
            },
            inbound_rx,
        )
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Bytes handed to `send` that the writer has not flushed yet.
    pub fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    pub fn send(&self, frame: ChannelFrame) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        let len = frame.len();
        self.shared.buffered.fetch_add(len, Ordering::AcqRel);
        self.frames.send(frame).map_err(|_| {
            self.shared.buffered.fetch_sub(len, Ordering::AcqRel);
            ChannelError::Closed
        })
    }

    /// Send a control message as a text frame.
    pub fn send_message(&self, msg: &Message) -> Result<(), ChannelError> {
        let text = wire::encode_text(msg)?;
        self.send(ChannelFrame::Text(text))
    }

    /// Wait until at most `threshold` bytes are buffered. Woken by the writer, not polled.
    /// Fails if the channel closes with more than `threshold` bytes still unwritten.
    pub async fn wait_for_drain(&self, threshold: usize) -> Result<(), ChannelError> {
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.buffered_amount() <= threshold {
                return Ok(());
            }
            if !self.is_open() {
                return Err(ChannelError::Closed);
            }
            notified.await;
        }
    }

    /// Close both directions. Idempotent.
    pub fn close(&self) {
        if self.shared.close() {
            debug!(peer = %self.peer, "peer channel closed locally");
        }
    }
}

async fn write_loop<W>(
    peer: PeerId,
    shared: Arc<Shared>,
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<ChannelFrame>,
) where
    W: AsyncWrite + Unpin,
{
    let mut closed = shared.closed.subscribe();
    loop {
        let frame = tokio::select! {
            f = frames.recv() => match f {
                Some(f) => f,
                None => break,
            },
            _ = closed.wait_for(|c| *c) => break,
        };
        let len = frame.len();
        let written = match wire::encode_frame(&frame) {
            Ok(bytes) => match writer.write_all(&bytes).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            },
            Err(e) => {
                warn!(peer = %peer, error = %e, "dropping unencodable frame");
                Ok(())
            }
        };
        if let Err(e) = written {
            // The failed frame stays counted so drain waiters see unwritten bytes.
            debug!(peer = %peer, error = %e, "peer channel write failed");
            break;
        }
        shared.buffered.fetch_sub(len, Ordering::AcqRel);
        shared.drained.notify_waiters();
    }
    let _ = writer.shutdown().await;
    shared.close();
}

async fn read_loop<R>(
    peer: PeerId,
    shared: Arc<Shared>,
    mut reader: R,
    inbound: mpsc::UnboundedSender<ChannelFrame>,
) where
    R: AsyncRead + Unpin,
{
    let mut closed = shared.closed.subscribe();
    let mut buf: Vec<u8> = Vec::with_capacity(READ_BUF_SIZE);
    let mut chunk = vec![0u8; READ_BUF_SIZE];
    'read: loop {
        let n = tokio::select! {
            r = reader.read(&mut chunk) => match r {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "peer channel read failed");
                    break;
                }
            },
            _ = closed.wait_for(|c| *c) => break,
        };
        buf.extend_from_slice(&chunk[..n]);
        loop {
            match wire::decode_frame(&buf) {
                Ok((frame, used)) => {
                    buf.drain(..used);
                    if inbound.send(frame).is_err() {
                        break 'read;
                    }
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "corrupt peer channel stream");
                    break 'read;
                }
            }
        }
    }
    shared.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pair() -> (
        (PeerChannel, mpsc::UnboundedReceiver<ChannelFrame>),
        (PeerChannel, mpsc::UnboundedReceiver<ChannelFrame>),
    ) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            PeerChannel::spawn(PeerId::from("b"), a),
            PeerChannel::spawn(PeerId::from("a"), b),
        )
    }

    #[tokio::test]
    async fn frames_keep_boundaries_and_order() {
        let ((a, _a_rx), (_b, mut b_rx)) = pair();
        a.send_message(&Message::GetPeers).unwrap();
        a.send(ChannelFrame::Binary(vec![7; 100_000])).unwrap();
        a.send(ChannelFrame::Binary(Vec::new())).unwrap();

        let first = b_rx.recv().await.unwrap();
        assert_eq!(first, ChannelFrame::Text(r#"{"type":"get-peers"}"#.into()));
        assert_eq!(b_rx.recv().await.unwrap(), ChannelFrame::Binary(vec![7; 100_000]));
        assert_eq!(b_rx.recv().await.unwrap(), ChannelFrame::Binary(Vec::new()));
    }

    #[tokio::test]
    async fn closing_one_side_ends_the_other() {
        let ((a, _a_rx), (b, mut b_rx)) = pair();
        a.close();
        let end = tokio::time::timeout(Duration::from_secs(2), b_rx.recv()).await;
        assert_eq!(end.unwrap(), None);
        assert!(!a.is_open());
        assert!(matches!(a.send(ChannelFrame::Binary(vec![1])), Err(ChannelError::Closed)));
        tokio::time::timeout(Duration::from_secs(2), async {
            while b.is_open() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn drain_wait_blocks_until_writer_catches_up() {
        let (local, mut remote) = tokio::io::duplex(64);
        let (channel, _rx) = PeerChannel::spawn(PeerId::from("r"), local);
        channel.send(ChannelFrame::Binary(vec![1; 1000])).unwrap();
        assert!(channel.buffered_amount() > 100);

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), channel.wait_for_drain(100)).await;
        assert!(blocked.is_err(), "nothing was read yet");

        let mut sink = vec![0u8; 1005];
        remote.read_exact(&mut sink).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), channel.wait_for_drain(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn drain_wait_fails_when_the_remote_goes_away() {
        let (local, remote) = tokio::io::duplex(64);
        let (channel, _rx) = PeerChannel::spawn(PeerId::from("r"), local);
        channel.send(ChannelFrame::Binary(vec![1; 1000])).unwrap();
        drop(remote);
        let result = tokio::time::timeout(Duration::from_secs(2), channel.wait_for_drain(0))
            .await
            .unwrap();
        assert!(matches!(result, Err(ChannelError::Closed)));
        assert!(channel.buffered_amount() > 0);
    }

    #[tokio::test]
    async fn drain_wait_fails_once_closed() {
        let (local, _remote) = tokio::io::duplex(64);
        let (channel, _rx) = PeerChannel::spawn(PeerId::from("r"), local);
        channel.send(ChannelFrame::Binary(vec![1; 1000])).unwrap();
        let waiter = {
            let c = channel.clone();
            tokio::spawn(async move { c.wait_for_drain(0).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.close();
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ChannelError::Closed)));
    }
}
