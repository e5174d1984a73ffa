//! Job submission client.
//!
//! The [`Client`] is a cheap handle; the real work happens in a router
//! task that exclusively owns the connection pool, the job registry and
//! the waiter lists. Submissions are serialized through the router so the
//! order submissions are registered for `JOB_CREATED` correlation is
//! exactly the order their packets hit the socket, even when callers
//! submit concurrently.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::connection::{ServerEvent, ServerId};
use crate::error::{ConnectionError, Error, Result};
use crate::job::{FailureReason, JobHandle, JobStatus, Priority, SubmittedJob};
use crate::packet::{Encoding, Packet, PacketType, Payload};
use crate::pool::JobServerPool;
use crate::registry::{JobRegistry, PendingJob};

/// Client construction options.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Job server addresses as `host:port`, tried in round-robin order
    pub servers: Vec<String>,

    /// Default representation for received results; overridable per
    /// submission
    pub response_encoding: Encoding,

    /// Negotiate the `exceptions` server option on every connection so
    /// `WORK_EXCEPTION` packets are delivered
    pub exceptions: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            servers: vec!["127.0.0.1:4730".to_owned()],
            response_encoding: Encoding::Raw,
            exceptions: false,
        }
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Fire-and-forget: only `JOB_CREATED` comes back, no further events
    pub background: bool,

    /// Queue priority, selecting the `SUBMIT_JOB*` variant
    pub priority: Priority,

    /// Deduplication/correlation token forwarded to workers that request
    /// uniques
    pub unique: Option<String>,

    /// Override the client-level response encoding for this submission
    pub response_encoding: Option<Encoding>,
}

enum ClientCommand {
    Submit {
        function: String,
        payload: Payload,
        options: SubmitOptions,
        reply: oneshot::Sender<Result<SubmittedJob>>,
    },
    Status {
        handle: JobHandle,
        reply: oneshot::Sender<Result<JobStatus>>,
    },
    Echo {
        payload: Payload,
        reply: oneshot::Sender<Result<Payload>>,
    },
}

/// Handle for submitting jobs to the configured server pool.
///
/// Dropping the client (or calling [`close`](Client::close)) tears down
/// its connections; jobs still in flight fail with a connection-loss
/// reason rather than hanging.
#[derive(Debug)]
pub struct Client {
    cmd_tx: mpsc::Sender<ClientCommand>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Client {
    /// Construct a client and spawn its connection and router tasks.
    ///
    /// Sockets are dialed lazily on first use. Must be called within a
    /// tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Client> {
        if config.servers.is_empty() {
            return Err(Error::Config("no job servers configured".to_owned()));
        }
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let pool = JobServerPool::spawn(&config.servers, event_tx, &shutdown, &tracker);
        let router = ClientRouter {
            pool,
            registry: JobRegistry::new(),
            exceptions: config.exceptions,
            default_encoding: config.response_encoding,
            status_waiters: HashMap::new(),
            echo_waiters: HashMap::new(),
            shutdown: shutdown.clone(),
        };
        tracker.spawn(router.run(cmd_rx, event_rx));
        tracker.close();
        Ok(Client {
            cmd_tx,
            shutdown,
            tracker,
        })
    }

    /// Submit one job and return its observation handle immediately.
    ///
    /// The returned [`SubmittedJob`] resolves events as the server reports
    /// them; this call itself only waits for the packet to be written.
    /// There is no built-in timeout — bound waits with
    /// `tokio::time::timeout` where needed.
    pub async fn submit_job(
        &self,
        function: impl Into<String>,
        payload: impl Into<Payload>,
        options: SubmitOptions,
    ) -> Result<SubmittedJob> {
        self.command(|reply| ClientCommand::Submit {
            function: function.into(),
            payload: payload.into(),
            options,
            reply,
        })
        .await
    }

    /// Query the server that owns `handle` for the job's status.
    ///
    /// This is the only way to observe a background job after its
    /// `JOB_CREATED`.
    pub async fn job_status(&self, handle: &JobHandle) -> Result<JobStatus> {
        self.command(|reply| ClientCommand::Status {
            handle: handle.clone(),
            reply,
        })
        .await
    }

    /// Round-trip arbitrary bytes through a server (`ECHO_REQ`), as a
    /// connectivity probe. The reply keeps the representation of the
    /// request payload.
    pub async fn echo(&self, payload: impl Into<Payload>) -> Result<Payload> {
        self.command(|reply| ClientCommand::Echo {
            payload: payload.into(),
            reply,
        })
        .await
    }

    /// Tear down all connections and wait for the tasks to finish.
    pub async fn close(self) {
        self.shutdown.cancel();
        self.tracker.wait().await;
    }

    async fn command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> ClientCommand,
    ) -> Result<T> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .await
            .map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::Closed)?
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Select the submission packet type for the background/priority pair.
fn submit_kind(background: bool, priority: Priority) -> PacketType {
    match (background, priority) {
        (false, Priority::Normal) => PacketType::SubmitJob,
        (false, Priority::High) => PacketType::SubmitJobHigh,
        (false, Priority::Low) => PacketType::SubmitJobLow,
        (true, Priority::Normal) => PacketType::SubmitJobBg,
        (true, Priority::High) => PacketType::SubmitJobHighBg,
        (true, Priority::Low) => PacketType::SubmitJobLowBg,
    }
}

/// The router task: owns the pool, the registry, and all waiter state.
struct ClientRouter {
    pool: JobServerPool,
    registry: JobRegistry,
    exceptions: bool,
    default_encoding: Encoding,
    /// `GET_STATUS` requests awaiting their `STATUS_RES`, per server
    status_waiters: HashMap<ServerId, Vec<(String, oneshot::Sender<Result<JobStatus>>)>>,
    /// `ECHO_REQ` requests awaiting their `ECHO_RES`, per server, FIFO
    echo_waiters: HashMap<ServerId, VecDeque<(Encoding, oneshot::Sender<Result<Payload>>)>>,
    shutdown: CancellationToken,
}

impl ClientRouter {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<ClientCommand>,
        mut event_rx: mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        let shutdown = self.shutdown.clone();
        // Negotiate the exceptions option before any submission can be
        // processed; reconnects re-negotiate via Connected events
        if self.exceptions {
            let packet =
                Packet::request(PacketType::OptionReq, [Bytes::from_static(b"exceptions")]);
            if let Err(error) = self.pool.broadcast(packet).await {
                warn!(error = %error, "failed to negotiate exceptions option");
            }
        }
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // All client handles dropped
                    None => break,
                },
                event = event_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
        self.registry.fail_all(&FailureReason::ConnectionLost);
        debug!("client router stopped");
    }

    async fn handle_command(&mut self, cmd: ClientCommand) {
        match cmd {
            ClientCommand::Submit {
                function,
                payload,
                options,
                reply,
            } => {
                let _ = reply.send(self.submit(function, payload, options).await);
            }
            ClientCommand::Status { handle, reply } => {
                let packet = Packet::request(PacketType::GetStatus, [handle.to_bytes()]);
                match self.pool.send_to(handle.server(), packet).await {
                    Ok(()) => self
                        .status_waiters
                        .entry(handle.server())
                        .or_default()
                        .push((handle.as_str().to_owned(), reply)),
                    Err(error) => {
                        let _ = reply.send(Err(error));
                    }
                }
            }
            ClientCommand::Echo { payload, reply } => {
                let encoding = match &payload {
                    Payload::Text(_) => Encoding::Utf8,
                    Payload::Bytes(_) => Encoding::Raw,
                };
                let packet = Packet::request(PacketType::EchoReq, [payload.into_bytes()]);
                match self.pool.send_any(packet).await {
                    Ok(server) => self
                        .echo_waiters
                        .entry(server)
                        .or_default()
                        .push_back((encoding, reply)),
                    Err(error) => {
                        let _ = reply.send(Err(error));
                    }
                }
            }
        }
    }

    /// Build and write one submission, then register it for correlation.
    ///
    /// Registration happens in the same task turn as the write, so the
    /// per-connection pending order always matches socket write order.
    async fn submit(
        &mut self,
        function: String,
        payload: Payload,
        options: SubmitOptions,
    ) -> Result<SubmittedJob> {
        if function.is_empty() || function.bytes().any(|b| b == 0) {
            return Err(Error::Config(format!(
                "invalid function name {function:?}"
            )));
        }
        if let Some(unique) = &options.unique {
            if unique.bytes().any(|b| b == 0) {
                return Err(Error::Config(format!("invalid unique token {unique:?}")));
            }
        }

        let encoding = options.response_encoding.unwrap_or(self.default_encoding);
        let unique = options.unique.clone().unwrap_or_default();
        let packet = Packet::request(
            submit_kind(options.background, options.priority),
            [
                Bytes::from(function.clone().into_bytes()),
                Bytes::from(unique.into_bytes()),
                payload.into_bytes(),
            ],
        );

        let server = self.pool.send_any(packet).await?;
        debug!(function = %function, server = %server, background = options.background,
            "submitted job");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.registry.push_pending(
            server,
            PendingJob {
                events: events_tx,
                response_encoding: encoding,
                background: options.background,
            },
        );
        Ok(SubmittedJob::new(
            function,
            options.unique,
            options.background,
            events_rx,
        ))
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { server } => {
                if self.exceptions {
                    let packet = Packet::request(
                        PacketType::OptionReq,
                        [Bytes::from_static(b"exceptions")],
                    );
                    if let Err(error) = self.pool.send_to(server, packet).await {
                        warn!(server = %server, error = %error,
                            "failed to negotiate exceptions option");
                    }
                }
            }
            ServerEvent::Lost { server, reason } => {
                let failed = self
                    .registry
                    .fail_server(server, &FailureReason::ConnectionLost);
                if failed > 0 {
                    warn!(server = %server, reason = %reason, failed,
                        "failed in-flight jobs after connection loss");
                }
                self.drop_waiters(server, &reason);
            }
            ServerEvent::Packet { server, packet } => self.handle_packet(server, packet).await,
        }
    }

    async fn handle_packet(&mut self, server: ServerId, packet: Packet) {
        match packet.kind {
            PacketType::JobCreated
            | PacketType::WorkData
            | PacketType::WorkWarning
            | PacketType::WorkStatus
            | PacketType::WorkComplete
            | PacketType::WorkFail
            | PacketType::WorkException => {
                if let Err(protocol_error) = self.registry.route(server, &packet) {
                    // Routing violations poison the connection: reset it
                    // and fail everything bound to it
                    error!(server = %server, error = %protocol_error,
                        "protocol error, resetting connection");
                    self.registry
                        .fail_server(server, &FailureReason::ConnectionLost);
                    self.drop_waiters(server, &protocol_error.to_string());
                    if let Some(conn) = self.pool.get(server) {
                        conn.reset().await;
                    }
                }
            }
            PacketType::StatusRes => self.on_status_res(server, &packet),
            PacketType::EchoRes => self.on_echo_res(server, &packet),
            PacketType::OptionRes => {
                debug!(server = %server, "server acknowledged option");
            }
            PacketType::Error => {
                let code = packet.arg_utf8(0).unwrap_or("?").to_owned();
                let message = packet.arg_utf8(1).unwrap_or("?").to_owned();
                error!(server = %server, code = %code, message = %message,
                    "server reported an error");
                self.registry
                    .fail_server(server, &FailureReason::ServerError { code, message });
            }
            PacketType::Noop => {}
            other => {
                warn!(server = %server, kind = ?other,
                    "unexpected packet on a client connection");
            }
        }
    }

    fn on_status_res(&mut self, server: ServerId, packet: &Packet) {
        let parsed = (|| -> std::result::Result<(String, JobStatus), crate::error::ProtocolError> {
            let handle = packet.arg_utf8(0)?.to_owned();
            let status = JobStatus {
                known: packet.arg_utf8(1)? == "1",
                running: packet.arg_utf8(2)? == "1",
                numerator: packet.arg_u64(3)?,
                denominator: packet.arg_u64(4)?,
            };
            Ok((handle, status))
        })();
        let (handle, status) = match parsed {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(server = %server, error = %error, "malformed STATUS_RES");
                return;
            }
        };
        let waiters = self.status_waiters.entry(server).or_default();
        match waiters.iter().position(|(h, _)| *h == handle) {
            Some(index) => {
                let (_, reply) = waiters.remove(index);
                let _ = reply.send(Ok(status));
            }
            None => warn!(server = %server, handle = %handle, "STATUS_RES with no waiter"),
        }
    }

    fn on_echo_res(&mut self, server: ServerId, packet: &Packet) {
        let Some((encoding, reply)) = self
            .echo_waiters
            .get_mut(&server)
            .and_then(VecDeque::pop_front)
        else {
            warn!(server = %server, "ECHO_RES with no waiter");
            return;
        };
        let raw = packet.arg(0).cloned().unwrap_or_default();
        let result = Payload::decode(raw, encoding).map_err(Error::from);
        let _ = reply.send(result);
    }

    /// Fail every waiter bound to a lost or poisoned connection.
    fn drop_waiters(&mut self, server: ServerId, reason: &str) {
        let addr = self
            .pool
            .get(server)
            .map(|conn| conn.addr().to_owned())
            .unwrap_or_default();
        let lost = || {
            Error::Connection(ConnectionError::Lost {
                addr: addr.clone(),
                reason: reason.to_owned(),
            })
        };
        for (_, reply) in self.status_waiters.remove(&server).unwrap_or_default() {
            let _ = reply.send(Err(lost()));
        }
        for (_, reply) in self.echo_waiters.remove(&server).unwrap_or_default() {
            let _ = reply.send(Err(lost()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_kind_covers_background_and_priority() {
        assert_eq!(
            submit_kind(false, Priority::Normal),
            PacketType::SubmitJob
        );
        assert_eq!(submit_kind(false, Priority::High), PacketType::SubmitJobHigh);
        assert_eq!(submit_kind(false, Priority::Low), PacketType::SubmitJobLow);
        assert_eq!(submit_kind(true, Priority::Normal), PacketType::SubmitJobBg);
        assert_eq!(
            submit_kind(true, Priority::High),
            PacketType::SubmitJobHighBg
        );
        assert_eq!(submit_kind(true, Priority::Low), PacketType::SubmitJobLowBg);
    }

    #[test]
    fn empty_server_list_is_a_config_error() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let err = Client::new(ClientConfig {
            servers: Vec::new(),
            ..ClientConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn invalid_function_name_is_rejected_before_sending() {
        // Dead address: validation must fire before any dial attempt
        let client = Client::new(ClientConfig {
            servers: vec!["127.0.0.1:1".to_owned()],
            ..ClientConfig::default()
        })
        .unwrap();
        let err = client
            .submit_job("bad\0name", "x", SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        client.close().await;
    }

    #[tokio::test]
    async fn all_servers_down_surfaces_no_available_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = Client::new(ClientConfig {
            servers: vec![addr],
            ..ClientConfig::default()
        })
        .unwrap();
        let err = client
            .submit_job("reverse", "x", SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAvailableServer));
        client.close().await;
    }
}
