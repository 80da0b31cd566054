use std::net::SocketAddr;
use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_HEARTBEAT_SECS, DEFAULT_LISTEN_PORT,
    DEFAULT_PROBE_TIMEOUT_SECS, DEFAULT_STALE_AFTER_SECS, WRITE_BUFFER_FRAMES,
};

/// Configuration for the network manager.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address to bind the inbound listener to. Port 0 picks a free port.
    pub listen_addr: SocketAddr,
    /// A handshake exceeding this window fails with `HandshakeTimeout`.
    pub handshake_timeout: Duration,
    /// Heartbeat interval on established sessions.
    pub heartbeat_interval: Duration,
    /// A session with no inbound activity for this long is considered
    /// stale and may be superseded by a new handshake from the same peer.
    pub stale_after: Duration,
    /// Connect timeout for liveness probes.
    pub probe_timeout: Duration,
    /// Outbound write buffer capacity per connection, in frames.
    /// Exceeding it is a fatal connection error, never a silent drop.
    pub write_buffer_frames: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            write_buffer_frames: WRITE_BUFFER_FRAMES,
        }
    }
}

impl NetworkConfig {
    /// Loopback listener on an ephemeral port, as used by tests.
    pub fn loopback() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }
}
