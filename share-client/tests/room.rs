use std::net::SocketAddr;
use std::time::Duration;

use share_client::{ClientConfig, RoomSession};
use share_core::{
    ConnectivityState, NegotiationState, OutgoingFile, PeerId, ReceivedVia, RoomCode, RoomEvent,
    TransferMethod,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);
const QUIET: Duration = Duration::from_millis(500);

type Events = UnboundedReceiver<RoomEvent>;

async fn start_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(share_relay::serve(listener));
    addr
}

fn config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        relay_url: format!("ws://{}", addr),
        storage_url: None,
        external_storage: false,
        channel_chunk_delay_ms: 0,
        relay_chunk_delay_ms: 0,
        relay_chunk_size: 1000,
        channel_chunk_size: 4096,
        ..ClientConfig::default()
    }
}

fn room() -> RoomCode {
    RoomCode::parse("ABC123").unwrap()
}

async fn wait_for(events: &mut Events, mut pred: impl FnMut(&RoomEvent) -> bool) -> RoomEvent {
    timeout(WAIT, async {
        loop {
            let ev = events.recv().await.expect("event stream ended");
            if pred(&ev) {
                return ev;
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

/// Everything that arrives until the stream goes quiet.
async fn drain(events: &mut Events) -> Vec<RoomEvent> {
    let mut out = Vec::new();
    while let Ok(Some(ev)) = timeout(QUIET, events.recv()).await {
        out.push(ev);
    }
    out
}

async fn join(addr: SocketAddr, id: &str) -> (RoomSession, Events) {
    let (session, mut events) = RoomSession::join(&config(addr), room(), PeerId::from(id));
    wait_for(&mut events, |e| matches!(e, RoomEvent::Welcome { .. })).await;
    (session, events)
}

async fn wait_connected(a: &RoomSession, b: &RoomSession) {
    timeout(WAIT, async {
        loop {
            let ab = a.peer_state(b.local()).await;
            let ba = b.peer_state(a.local()).await;
            if ab == Some(NegotiationState::Connected) && ba == Some(NegotiationState::Connected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer channel did not connect");
}

#[tokio::test]
async fn text_reaches_other_peer_without_echo() {
    let addr = start_relay().await;
    let (p1, mut e1) = join(addr, "p1").await;
    let (p2, mut e2) = join(addr, "p2").await;
    wait_for(&mut e1, |e| matches!(e, RoomEvent::PeerJoined(p) if p.as_str() == "p2")).await;
    assert_eq!(p1.connectivity(), ConnectivityState::Connected);

    p1.send_text("hello").unwrap();

    let got: Vec<_> = drain(&mut e2)
        .await
        .into_iter()
        .filter_map(|e| match e {
            RoomEvent::Message(m) => Some(m),
            _ => None,
        })
        .collect();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].sender, PeerId::from("p1"));
    assert_eq!(got[0].content.as_deref(), Some("hello"));
    assert!(!drain(&mut e1)
        .await
        .iter()
        .any(|e| matches!(e, RoomEvent::Message(_))));

    p1.leave().await;
    p2.leave().await;
}

#[tokio::test]
async fn one_direct_channel_per_pair() {
    let addr = start_relay().await;
    let (a, _ea) = join(addr, "aaa").await;
    let (b, _eb) = join(addr, "bbb").await;
    wait_connected(&a, &b).await;

    let from_b = b.peer_state(a.local()).await;
    assert_eq!(from_b, Some(NegotiationState::Connected));
    assert_eq!(a.peer_state(b.local()).await, Some(NegotiationState::Connected));

    a.leave().await;
    b.leave().await;
}

#[tokio::test]
async fn file_goes_over_the_direct_channel() {
    let addr = start_relay().await;
    let (a, mut ea) = join(addr, "aaa").await;
    let (b, _eb) = join(addr, "bbb").await;
    wait_connected(&a, &b).await;

    let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let file = OutgoingFile::new("data.bin", "application/octet-stream", data.clone());
    let result = b.send_file(&file, Some(a.local())).await.unwrap();
    assert_eq!(result.method(), Some(TransferMethod::PeerChannel));
    assert!(result.reference().is_none());

    let RoomEvent::FileReceived(got) =
        wait_for(&mut ea, |e| matches!(e, RoomEvent::FileReceived(_))).await
    else {
        unreachable!()
    };
    assert_eq!(got.bytes, data);
    assert_eq!(got.sender, PeerId::from("bbb"));
    assert_eq!(got.via, ReceivedVia::PeerChannel);

    a.leave().await;
    b.leave().await;
}

#[tokio::test]
async fn file_without_target_goes_inline_to_everyone() {
    let addr = start_relay().await;
    let (p1, _e1) = join(addr, "p1").await;
    let (p2, mut e2) = join(addr, "p2").await;
    let (p3, mut e3) = join(addr, "p3").await;

    let data = b"0123456789".repeat(250);
    let file = OutgoingFile::new("notes.txt", "text/plain", data.clone());
    let result = p1.send_file(&file, None).await.unwrap();
    assert_eq!(result.method(), Some(TransferMethod::Inline));
    assert!(result.attempts().is_empty());

    for events in [&mut e2, &mut e3] {
        let RoomEvent::FileReceived(got) =
            wait_for(events, |e| matches!(e, RoomEvent::FileReceived(_))).await
        else {
            unreachable!()
        };
        assert_eq!(got.bytes, data);
        assert_eq!(got.via, ReceivedVia::Relay);
        assert!(got.data_url().starts_with("data:text/plain;base64,"));
    }

    for s in [p1, p2, p3] {
        s.leave().await;
    }
}

#[tokio::test]
async fn leaving_notifies_once_and_closes_the_connection() {
    let addr = start_relay().await;
    let (p1, mut e1) = join(addr, "bbb").await;
    let (p2, mut e2) = join(addr, "aaa").await;
    wait_connected(&p1, &p2).await;
    drain(&mut e2).await;

    p1.leave().await;
    p1.leave().await;

    let events = drain(&mut e2).await;
    let left = events
        .iter()
        .filter(|e| matches!(e, RoomEvent::PeerLeft(p) if p.as_str() == "bbb"))
        .count();
    assert_eq!(left, 1);
    assert!(events.iter().any(
        |e| matches!(e, RoomEvent::Roster(peers) if peers.iter().all(|p| p.id.as_str() != "bbb"))
    ));
    assert_eq!(
        p1.peer_state(&PeerId::from("aaa")).await,
        Some(NegotiationState::Closed)
    );
    assert_eq!(
        p2.peer_state(&PeerId::from("bbb")).await,
        Some(NegotiationState::Closed)
    );
    assert_eq!(p1.connectivity(), ConnectivityState::Closed);
    assert!(drain(&mut e1)
        .await
        .iter()
        .any(|e| matches!(e, RoomEvent::Connectivity(ConnectivityState::Closed))));
    assert!(p1.send_text("late").is_err());

    p2.leave().await;
}
