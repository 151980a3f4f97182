// WebShare room client: join a room from the terminal, chat on stdin, send files with /send.

use share_client::{config, load_file, RoomSession};
use share_core::{PeerId, RoomCode, RoomEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "usage: share-client <ROOM> [peer-id]";

fn main() -> anyhow::Result<()> {
    let mut positional = Vec::new();
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("share-client {}", VERSION);
            return Ok(());
        }
        positional.push(arg);
    }
    let Some(room) = positional.first() else {
        anyhow::bail!(USAGE);
    };
    let room = RoomCode::parse(room)?;
    let local = positional
        .get(1)
        .map(|p| PeerId::from(p.as_str()))
        .unwrap_or_else(PeerId::generate);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, room, local))
}

async fn run(cfg: share_client::ClientConfig, room: RoomCode, local: PeerId) -> anyhow::Result<()> {
    let (session, mut events) = RoomSession::join(&cfg, room, local);
    println!("joined {} as {}", session.room(), session.local());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&session, line.trim()).await {
                    break;
                }
            }
            Some(event) = events.recv() => print_event(event),
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    session.leave().await;
    while let Ok(event) = events.try_recv() {
        print_event(event);
    }
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_line(session: &RoomSession, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    if line == "/quit" {
        return false;
    }
    if let Some(rest) = line.strip_prefix("/send ") {
        let mut parts = rest.split_whitespace();
        let Some(path) = parts.next() else {
            println!("usage: /send <path> [peer]");
            return true;
        };
        let target = parts.next().map(PeerId::from);
        match load_file(path).await {
            Ok(file) => match session.send_file(&file, target.as_ref()).await {
                Ok(result) => match result.method() {
                    Some(method) => println!(
                        "sent {} via {}{}",
                        file.name,
                        method,
                        result.reference().map(|r| format!(" ({})", r)).unwrap_or_default()
                    ),
                    None => println!("could not send {}: all methods failed", file.name),
                },
                Err(e) => println!("could not send {}: {}", file.name, e),
            },
            Err(e) => println!("could not read {}: {}", path, e),
        }
        return true;
    }
    if let Err(e) = session.send_text(line) {
        println!("not sent: {}", e);
    }
    true
}

fn print_event(event: RoomEvent) {
    match event {
        RoomEvent::Welcome { room_size, .. } => println!("* {} in the room", room_size),
        RoomEvent::Message(m) => match (m.content, m.file_name, m.file_data) {
            (Some(text), _, _) => println!("<{}> {}", m.sender.display_name(), text),
            (None, Some(name), Some(url)) => {
                println!("<{}> shared {} {}", m.sender.display_name(), name, url)
            }
            _ => {}
        },
        RoomEvent::Roster(peers) => {
            let names: Vec<_> = peers.iter().map(|p| p.name.as_str()).collect();
            println!("* peers: {}", names.join(", "));
        }
        RoomEvent::PeerJoined(p) => println!("* {} joined", p.display_name()),
        RoomEvent::PeerLeft(p) => println!("* {} left", p.display_name()),
        RoomEvent::FileReceived(f) => {
            let name = std::path::Path::new(&f.file_name)
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "download".into());
            let path = std::env::temp_dir().join(name);
            match std::fs::write(&path, &f.bytes) {
                Ok(()) => println!(
                    "* received {} ({} bytes) from {}, saved to {}",
                    f.file_name,
                    f.bytes.len(),
                    f.sender.display_name(),
                    path.display()
                ),
                Err(e) => println!("* received {} but could not save it: {}", f.file_name, e),
            }
        }
        RoomEvent::TransferFailed { transfer_id, error, .. } => {
            println!("* incoming transfer {} failed: {}", transfer_id, error)
        }
        RoomEvent::Connectivity(state) => println!("* relay: {:?}", state),
        RoomEvent::PeerChannel { peer, state } => {
            println!("* direct channel to {}: {}", peer.display_name(), state)
        }
        RoomEvent::Progress { .. } | RoomEvent::Receiving { .. } => {}
        RoomEvent::RelayError(e) => println!("* relay error: {}", e),
    }
}
