// Peer-to-peer session layer: framed TCP connections, per-peer handshake
// state machines, and the network manager task tree.

pub mod config;
pub mod connection;
pub mod network;
pub mod registry;
pub mod session;

pub use config::NetworkConfig;
pub use connection::{spawn_writer, ConnectionError, FrameReader, FrameWriter};
pub use network::{
    spawn_network, NetworkCommand, NetworkError, NetworkEvent, NetworkHandle, PeerCommand,
};
pub use registry::{PeerRecord, PeerRegistry, SessionInfo};
pub use session::{FailureKind, PeerInfo, Session, SessionError, SessionEvent};
