//! WebShare relay: per-room presence and message fan-out over WebSocket.

pub mod config;
pub mod directory;
pub mod room_actor;
pub mod server;

pub use config::RelayConfig;
pub use directory::{Directory, JoinError};
pub use room_actor::RoomHandle;
pub use server::{parse_room_path, run, serve, serve_with, Liveness};
