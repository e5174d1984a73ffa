//! Per-server connection management.
//!
//! Each configured job server gets one connection task that owns the TCP
//! stream, wrapped in a [`Framed`] packet codec. Outbound packets arrive as
//! commands on an mpsc channel and are acknowledged once written; inbound
//! packets and lifecycle changes flow upward on a shared event channel,
//! tagged with the originating server, in strict arrival order.
//!
//! Connections dial lazily: the first send after construction (or after a
//! loss) triggers the dial, so "never connected" and "was connected, now
//! lost" are distinct, observable transitions rather than hidden retries.

use std::fmt;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use crate::codec::PacketCodec;
use crate::error::{ConnectionError, Error, Result};
use crate::packet::Packet;

/// Index of a server in the configured address list.
///
/// Job handles are only unique per server, so every inbound packet is
/// attributed to the connection it arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(usize);

impl ServerId {
    pub(crate) fn new(index: usize) -> Self {
        ServerId(index)
    }

    /// Position in the configured server list.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server#{}", self.0)
    }
}

/// Socket lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// Traffic and lifecycle notifications from connection tasks to their
/// owning client or worker.
#[derive(Debug)]
pub(crate) enum ServerEvent {
    /// A decoded packet, in arrival order for its connection
    Packet { server: ServerId, packet: Packet },
    /// The connection (re-)established its socket
    Connected { server: ServerId },
    /// The connection dropped; pending state for this server must be
    /// failed by the owner
    Lost { server: ServerId, reason: String },
}

enum Command {
    Send {
        packet: Packet,
        ack: oneshot::Sender<Result<()>>,
    },
    /// Drop the socket without shutting the task down; the next send
    /// reconnects. Used when a protocol error poisons the stream.
    Reset,
}

/// Cheap handle for submitting packets to one connection task.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    server: ServerId,
    addr: String,
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnState>,
}

impl ConnectionHandle {
    /// Spawn the connection task for `addr` onto `tracker`.
    pub fn spawn(
        server: ServerId,
        addr: String,
        event_tx: mpsc::UnboundedSender<ServerEvent>,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnState::Disconnected);
        let conn = Connection {
            server,
            addr: addr.clone(),
            framed: None,
            event_tx,
            state_tx,
            shutdown,
        };
        tracker.spawn(conn.run(cmd_rx));
        ConnectionHandle {
            server,
            addr,
            cmd_tx,
            state_rx,
        }
    }

    /// Write one packet, lazily connecting first if needed.
    ///
    /// Resolves once the packet hit the socket (or failed to). Packets
    /// from one handle are written in submission order.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send { packet, ack })
            .await
            .map_err(|_| Error::Connection(ConnectionError::Closed))?;
        ack_rx
            .await
            .map_err(|_| Error::Connection(ConnectionError::Closed))?
    }

    /// Drop the socket; the next send reconnects.
    pub async fn reset(&self) {
        let _ = self.cmd_tx.send(Command::Reset).await;
    }

    pub fn server(&self) -> ServerId {
        self.server
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("server", &self.server)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

/// The connection task: owns the socket, never shared.
struct Connection {
    server: ServerId,
    addr: String,
    framed: Option<Framed<TcpStream, PacketCodec>>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    state_tx: watch::Sender<ConnState>,
    shutdown: CancellationToken,
}

/// One iteration's outcome for [`Connection::run`]; resolved outside the
/// select so the handler can borrow `self` mutably.
enum Step {
    Command(Option<Command>),
    Inbound(Option<Result<Packet>>),
    Shutdown,
}

impl Connection {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let shutdown = self.shutdown.clone();
        loop {
            let step = match self.framed.as_mut() {
                Some(framed) => {
                    tokio::select! {
                        cmd = cmd_rx.recv() => Step::Command(cmd),
                        frame = framed.next() => Step::Inbound(frame),
                        _ = shutdown.cancelled() => Step::Shutdown,
                    }
                }
                None => {
                    tokio::select! {
                        cmd = cmd_rx.recv() => Step::Command(cmd),
                        _ = shutdown.cancelled() => Step::Shutdown,
                    }
                }
            };

            match step {
                Step::Command(Some(Command::Send { packet, ack })) => {
                    let result = self.write(packet).await;
                    let _ = ack.send(result);
                }
                Step::Command(Some(Command::Reset)) => {
                    if self.framed.take().is_some() {
                        debug!(server = %self.server, addr = %self.addr, "connection reset");
                        self.state_tx.send_replace(ConnState::Disconnected);
                    }
                }
                Step::Command(None) => break,
                Step::Inbound(Some(Ok(packet))) => {
                    trace!(server = %self.server, kind = ?packet.kind, "received packet");
                    if self
                        .event_tx
                        .send(ServerEvent::Packet {
                            server: self.server,
                            packet,
                        })
                        .is_err()
                    {
                        // Owner gone; nothing left to deliver to
                        break;
                    }
                }
                Step::Inbound(Some(Err(error))) => {
                    self.lose(format!("{error}")).await;
                }
                Step::Inbound(None) => {
                    self.lose("closed by server".to_owned()).await;
                }
                Step::Shutdown => break,
            }
        }
        self.state_tx.send_replace(ConnState::Disconnected);
    }

    /// Write one packet, dialing first if there is no socket.
    async fn write(&mut self, packet: Packet) -> Result<()> {
        self.ensure_connected().await?;
        let framed = self.framed.as_mut().expect("connected above");
        match framed.send(packet).await {
            Ok(()) => Ok(()),
            Err(error @ Error::Protocol(_)) => {
                // Encode-side rejection: nothing reached the wire, the
                // stream is still usable
                Err(error)
            }
            Err(error) => {
                let reason = format!("{error}");
                self.lose(reason.clone()).await;
                Err(ConnectionError::Lost {
                    addr: self.addr.clone(),
                    reason,
                }
                .into())
            }
        }
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.framed.is_some() {
            return Ok(());
        }
        self.state_tx.send_replace(ConnState::Connecting);
        debug!(server = %self.server, addr = %self.addr, "dialing job server");
        match TcpStream::connect(&self.addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                self.framed = Some(Framed::new(stream, PacketCodec));
                self.state_tx.send_replace(ConnState::Connected);
                debug!(server = %self.server, addr = %self.addr, "connected");
                let _ = self.event_tx.send(ServerEvent::Connected {
                    server: self.server,
                });
                Ok(())
            }
            Err(source) => {
                self.state_tx.send_replace(ConnState::Disconnected);
                debug!(server = %self.server, addr = %self.addr, error = %source, "dial failed");
                Err(ConnectionError::Dial {
                    addr: self.addr.clone(),
                    source,
                }
                .into())
            }
        }
    }

    /// Tear down a broken socket and notify the owner.
    async fn lose(&mut self, reason: String) {
        if self.framed.take().is_none() {
            return;
        }
        warn!(server = %self.server, addr = %self.addr, reason = %reason, "connection lost");
        self.state_tx.send_replace(ConnState::Disconnected);
        let _ = self.event_tx.send(ServerEvent::Lost {
            server: self.server,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    fn spawn_handle(
        addr: String,
    ) -> (
        ConnectionHandle,
        mpsc::UnboundedReceiver<ServerEvent>,
        CancellationToken,
        TaskTracker,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let handle =
            ConnectionHandle::spawn(ServerId::new(0), addr, event_tx, shutdown.clone(), &tracker);
        tracker.close();
        (handle, event_rx, shutdown, tracker)
    }

    #[tokio::test]
    async fn lazy_connect_then_echo_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Echo server: reflect every request back as a response
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, PacketCodec);
            while let Some(Ok(packet)) = framed.next().await {
                let reply = Packet::response(PacketType::EchoRes, packet.args);
                framed.send(reply).await.unwrap();
            }
        });

        let (handle, mut event_rx, _shutdown, _tracker) = spawn_handle(addr.to_string());
        assert_eq!(handle.state(), ConnState::Disconnected);

        handle
            .send(Packet::request(
                PacketType::EchoReq,
                [Bytes::from_static(b"ping")],
            ))
            .await
            .unwrap();

        // Lifecycle event first, then the echoed packet, in order
        match event_rx.recv().await.unwrap() {
            ServerEvent::Connected { server } => assert_eq!(server.index(), 0),
            other => panic!("expected Connected, got {other:?}"),
        }
        match event_rx.recv().await.unwrap() {
            ServerEvent::Packet { packet, .. } => {
                assert_eq!(packet.kind, PacketType::EchoRes);
                assert_eq!(packet.args[0], Bytes::from_static(b"ping"));
            }
            other => panic!("expected Packet, got {other:?}"),
        }
        assert_eq!(handle.state(), ConnState::Connected);
    }

    #[tokio::test]
    async fn dial_failure_surfaces_without_retry() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (handle, _event_rx, _shutdown, _tracker) = spawn_handle(addr.to_string());
        let err = handle
            .send(Packet::request(PacketType::GrabJob, std::iter::empty()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Dial { .. })
        ));
        assert_eq!(handle.state(), ConnState::Disconnected);
    }

    #[tokio::test]
    async fn server_close_emits_lost_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            // Accept then hang up immediately
            drop(socket);
        });

        let (handle, mut event_rx, _shutdown, _tracker) = spawn_handle(addr.to_string());
        handle
            .send(Packet::request(PacketType::PreSleep, std::iter::empty()))
            .await
            .unwrap();

        match event_rx.recv().await.unwrap() {
            ServerEvent::Connected { .. } => {}
            other => panic!("expected Connected, got {other:?}"),
        }
        match event_rx.recv().await.unwrap() {
            ServerEvent::Lost { server, .. } => assert_eq!(server.index(), 0),
            other => panic!("expected Lost, got {other:?}"),
        }
        assert_eq!(handle.state(), ConnState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_stops_the_task() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (handle, _event_rx, shutdown, tracker) = spawn_handle(addr.to_string());
        shutdown.cancel();
        tracker.wait().await;
        let err = handle
            .send(Packet::request(PacketType::GrabJob, std::iter::empty()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Closed)
        ));
    }
}
