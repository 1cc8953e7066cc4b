//! Multi-peer listener — accepts TCP connections and keeps a table of the
//! live ones.
//!
//! Every accepted peer gets its own connection task and engine; nothing is
//! shared between them except the handler and this table.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::connection::{self, ConnectionHandle, ConnectionId};
use crate::engine::EngineConfig;
use crate::handler::EnvelopeHandler;

/// Live connections, keyed by their engine-assigned id. Entries are removed
/// when the connection ends.
pub type PeerTable = Arc<DashMap<ConnectionId, ConnectionHandle>>;

pub fn new_peer_table() -> PeerTable {
    Arc::new(DashMap::new())
}

pub struct Listener {
    listener: TcpListener,
    config: EngineConfig,
    handler: Arc<dyn EnvelopeHandler>,
    peers: PeerTable,
    shutdown: broadcast::Receiver<()>,
}

impl Listener {
    pub async fn bind(
        addr: &str,
        port: u16,
        config: EngineConfig,
        handler: Arc<dyn EnvelopeHandler>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((addr, port))
            .await
            .with_context(|| format!("failed to bind {addr}:{port}"))?;
        Ok(Self {
            listener,
            config,
            handler,
            peers: new_peer_table(),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("listener has no local address")
    }

    pub fn peers(&self) -> PeerTable {
        self.peers.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "listening");
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(peers = self.peers.len(), "listener shutting down");
                    for peer in self.peers.iter() {
                        peer.value().close();
                    }
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%addr, error = %e, "failed to set TCP_NODELAY");
                    }
                    self.admit(stream, addr);
                }
            }
        }
    }

    fn admit(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let (handle, task) = connection::spawn(stream, self.config.clone(), self.handler.clone());
        let id = handle.id();
        self.peers.insert(id, handle);
        tracing::info!(conn = %id, %addr, peers = self.peers.len(), "peer accepted");

        let peers = self.peers.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                tracing::warn!(conn = %id, error = %e, "connection task failed");
            }
            peers.remove(&id);
            tracing::debug!(conn = %id, peers = peers.len(), "peer removed");
        });
    }
}
