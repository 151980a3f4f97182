//! WebShare room client: relay transport, direct peer channels, transfer strategy.

pub mod channel;
pub mod config;
pub mod connector;
pub mod file;
pub mod room;
pub mod signaling;
pub mod storage;
pub mod strategy;
pub mod transfer;
pub mod transport;

pub use channel::{ChannelError, PeerChannel};
pub use config::ClientConfig;
pub use connector::{Connector, TcpConnector};
pub use file::load_file;
pub use room::{ClientError, RoomSession};
pub use signaling::{SignalingCoordinator, SignalingEvent};
pub use storage::{DurableStorage, ExternalStorage, UploadError, WorkerStorage};
pub use strategy::TransferStrategySelector;
pub use transport::{ReconnectPolicy, ReconnectingTransport, RelaySink, TransportEvent};
