//! # parley-engine
//!
//! The top of the stack: ties the persisted identity to the session
//! layer and exposes the operations a front end needs. One [`Engine`]
//! per running node; it owns the network handle and hands out the event
//! stream for the UI to consume.

use std::net::SocketAddr;

use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tracing::info;

use parley_net::{
    spawn_network, NetworkConfig, NetworkError, NetworkEvent, NetworkHandle, SessionInfo,
};
use parley_shared::identity::Identity;
use parley_shared::types::{PeerStatus, UserId};
use parley_store::{IdentityStore, StoreError, StoredIdentity};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Cannot resolve peer address {0:?}")]
    BadAddress(String),
}

/// A running chat node: identity, listener, and live sessions.
pub struct Engine {
    identity: Identity,
    display_name: String,
    store: IdentityStore,
    network: NetworkHandle,
    events: Option<mpsc::Receiver<NetworkEvent>>,
}

impl Engine {
    /// First run: generate an identity, persist it, and start listening.
    pub async fn setup(
        store: IdentityStore,
        display_name: &str,
        config: NetworkConfig,
    ) -> Result<Self, EngineError> {
        let stored = store.create(display_name, false)?;
        Self::start(store, stored, config).await
    }

    /// Subsequent runs: load the persisted identity and start listening.
    pub async fn load(store: IdentityStore, config: NetworkConfig) -> Result<Self, EngineError> {
        let stored = store.load()?;
        Self::start(store, stored, config).await
    }

    /// Load when a record exists, set up otherwise.
    pub async fn open_or_setup(
        store: IdentityStore,
        display_name: &str,
        config: NetworkConfig,
    ) -> Result<Self, EngineError> {
        if store.exists() {
            Self::load(store, config).await
        } else {
            Self::setup(store, display_name, config).await
        }
    }

    async fn start(
        store: IdentityStore,
        stored: StoredIdentity,
        config: NetworkConfig,
    ) -> Result<Self, EngineError> {
        let StoredIdentity {
            identity,
            display_name,
            ..
        } = stored;

        let (network, events) =
            spawn_network(identity.clone(), display_name.clone(), config).await?;
        info!(
            user = %network.local_id(),
            addr = %network.local_addr(),
            name = %display_name,
            "Engine started"
        );

        Ok(Self {
            identity,
            display_name,
            store,
            network,
            events: Some(events),
        })
    }

    pub fn local_id(&self) -> UserId {
        self.network.local_id()
    }

    /// Address peers should dial. Final even when configured with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.network.local_addr()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Take ownership of the event stream. Yields `None` after the first
    /// call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<NetworkEvent>> {
        self.events.take()
    }

    /// Dial a peer given as `host:port`. Resolution failures surface
    /// immediately; connection and handshake failures arrive as events.
    pub async fn connect_to_peer(&self, addr: &str) -> Result<(), EngineError> {
        let resolved = match addr.parse::<SocketAddr>() {
            Ok(sa) => sa,
            Err(_) => lookup_host(addr)
                .await
                .ok()
                .and_then(|mut hosts| hosts.next())
                .ok_or_else(|| EngineError::BadAddress(addr.to_string()))?,
        };
        self.network.connect(resolved).await?;
        Ok(())
    }

    /// Encrypt and send a text message to an established peer.
    pub async fn send_chat_message(
        &self,
        peer_id: UserId,
        content: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.network.send_message(peer_id, content.into()).await?;
        Ok(())
    }

    pub async fn list_active_sessions(&self) -> Result<Vec<SessionInfo>, EngineError> {
        Ok(self.network.list_sessions().await?)
    }

    /// Best-effort liveness check for a known peer.
    pub async fn peer_status(&self, peer_id: UserId) -> Result<PeerStatus, EngineError> {
        Ok(self.network.probe_status(peer_id).await?)
    }

    pub async fn disconnect_peer(&self, peer_id: UserId) -> Result<(), EngineError> {
        Ok(self.network.disconnect(peer_id).await?)
    }

    /// Persist a new display name and advertise it in future handshakes.
    /// Established sessions keep the name the peer already learned.
    pub async fn set_display_name(&mut self, name: &str) -> Result<(), EngineError> {
        self.store.rotate_display_name(name)?;
        let name = name.trim().to_string();
        self.network.set_display_name(name.clone()).await?;
        self.display_name = name;
        Ok(())
    }

    /// Stop the listener and close every session.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        Ok(self.network.shutdown().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_setup_persists_and_load_restores() {
        let tmp = TempDir::new().unwrap();

        let engine = Engine::setup(
            IdentityStore::open_at(tmp.path()),
            "alice",
            NetworkConfig::loopback(),
        )
        .await
        .unwrap();
        let id = engine.local_id();
        engine.shutdown().await.unwrap();

        let reloaded = Engine::load(IdentityStore::open_at(tmp.path()), NetworkConfig::loopback())
            .await
            .unwrap();
        assert_eq!(reloaded.local_id(), id);
        assert_eq!(reloaded.display_name(), "alice");
    }

    #[tokio::test]
    async fn test_setup_twice_fails() {
        let tmp = TempDir::new().unwrap();

        Engine::setup(
            IdentityStore::open_at(tmp.path()),
            "alice",
            NetworkConfig::loopback(),
        )
        .await
        .unwrap();

        let second = Engine::setup(
            IdentityStore::open_at(tmp.path()),
            "alice",
            NetworkConfig::loopback(),
        )
        .await;
        assert!(matches!(
            second,
            Err(EngineError::Store(StoreError::AlreadyExists))
        ));
    }

    #[tokio::test]
    async fn test_set_display_name_persists() {
        let tmp = TempDir::new().unwrap();

        let mut engine = Engine::setup(
            IdentityStore::open_at(tmp.path()),
            "alice",
            NetworkConfig::loopback(),
        )
        .await
        .unwrap();
        engine.set_display_name("alicia").await.unwrap();
        assert_eq!(engine.display_name(), "alicia");
        engine.shutdown().await.unwrap();

        let reloaded = Engine::load(IdentityStore::open_at(tmp.path()), NetworkConfig::loopback())
            .await
            .unwrap();
        assert_eq!(reloaded.display_name(), "alicia");
    }

    #[tokio::test]
    async fn test_bad_address_rejected() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::setup(
            IdentityStore::open_at(tmp.path()),
            "alice",
            NetworkConfig::loopback(),
        )
        .await
        .unwrap();

        assert!(matches!(
            engine.connect_to_peer("not an address").await,
            Err(EngineError::BadAddress(_))
        ));
    }
}
