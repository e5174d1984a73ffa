//! The set of configured job-server connections.
//!
//! Selection policy is deliberately simple: round-robin with
//! skip-on-failure for one-shot sends, broadcast for worker capability
//! registration. Anything smarter is a caller concern.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::connection::{ConnectionHandle, ServerEvent, ServerId};
use crate::error::{Error, Result};
use crate::packet::Packet;

/// One connection handle per configured `host:port`, in configuration
/// order.
pub(crate) struct JobServerPool {
    connections: Vec<ConnectionHandle>,
    next: usize,
}

impl JobServerPool {
    /// Spawn one connection task per address. Sockets dial lazily on
    /// first send.
    pub fn spawn(
        addrs: &[String],
        event_tx: mpsc::UnboundedSender<ServerEvent>,
        shutdown: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Self {
        let connections = addrs
            .iter()
            .enumerate()
            .map(|(index, addr)| {
                ConnectionHandle::spawn(
                    ServerId::new(index),
                    addr.clone(),
                    event_tx.clone(),
                    shutdown.clone(),
                    tracker,
                )
            })
            .collect();
        JobServerPool {
            connections,
            next: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn get(&self, server: ServerId) -> Option<&ConnectionHandle> {
        self.connections.get(server.index())
    }

    pub fn servers(&self) -> impl Iterator<Item = ServerId> + '_ {
        self.connections.iter().map(ConnectionHandle::server)
    }

    /// Send to the next server by round-robin, skipping servers that
    /// fail, and report which one took the packet.
    ///
    /// Errors with [`Error::NoAvailableServer`] only once every server
    /// has refused.
    pub async fn send_any(&mut self, packet: Packet) -> Result<ServerId> {
        if self.connections.is_empty() {
            return Err(Error::NoAvailableServer);
        }
        for attempt in 0..self.connections.len() {
            let index = (self.next + attempt) % self.connections.len();
            let conn = &self.connections[index];
            match conn.send(packet.clone()).await {
                Ok(()) => {
                    self.next = (index + 1) % self.connections.len();
                    return Ok(conn.server());
                }
                Err(error) => {
                    debug!(server = %conn.server(), addr = %conn.addr(), error = %error,
                        "server unavailable, trying next");
                }
            }
        }
        Err(Error::NoAvailableServer)
    }

    /// Send to one specific server.
    pub async fn send_to(&self, server: ServerId, packet: Packet) -> Result<()> {
        let conn = self.get(server).ok_or(Error::NoAvailableServer)?;
        conn.send(packet).await
    }

    /// Best-effort send to every server (capability registration, worker
    /// identity). Succeeds if at least one server took the packet.
    pub async fn broadcast(&self, packet: Packet) -> Result<usize> {
        let mut delivered = 0;
        for conn in &self.connections {
            match conn.send(packet.clone()).await {
                Ok(()) => delivered += 1,
                Err(error) => {
                    debug!(server = %conn.server(), addr = %conn.addr(), error = %error,
                        "broadcast skipped unavailable server");
                }
            }
        }
        if delivered == 0 {
            return Err(Error::NoAvailableServer);
        }
        Ok(delivered)
    }
}
