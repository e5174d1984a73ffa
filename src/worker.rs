//! Job execution worker.
//!
//! A worker advertises capability names to every configured server
//! (`CAN_DO` broadcast), then runs a cooperative polling cycle: grab a
//! job, execute the registered handler, report the result, repeat. When
//! every server answers `NO_JOB` the worker parks itself with `PRE_SLEEP`
//! and waits for a `NOOP` wake-up instead of busy-polling.
//!
//! Handler failures never crash the cycle: an `Err` return is reported to
//! the server as `WORK_EXCEPTION` (when configured) or `WORK_FAIL`, a
//! panic as `WORK_FAIL`, and a job dropped without a terminal report as
//! `WORK_FAIL` via its drop guard.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};

use crate::connection::{ServerEvent, ServerId};
use crate::error::{Error, Result};
use crate::job::{
    AssignedJob, CompletionKind, HandlerOutcome, JobHandle, JobSignal,
};
use crate::packet::{Encoding, Packet, PacketType, Payload};
use crate::pool::JobServerPool;

/// Error type handlers may return; reported to the server as the job's
/// failure.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<(), HandlerError>> + Send>>;
type Handler = Arc<dyn Fn(AssignedJob) -> HandlerFuture + Send + Sync>;

/// Worker construction options.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Job server addresses as `host:port`; abilities are broadcast to
    /// all of them
    pub servers: Vec<String>,

    /// Identity announced with `SET_CLIENT_ID` for server-side
    /// introspection
    pub worker_id: Option<String>,

    /// Grab with `GRAB_JOB_UNIQ` so assignments carry the client's unique
    /// token
    pub request_uniques: bool,

    /// Report handler errors as `WORK_EXCEPTION` instead of `WORK_FAIL`
    pub report_exceptions: bool,

    /// How long to wait before resuming the grab cycle after a
    /// connection loss
    pub reconnect_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            servers: vec!["127.0.0.1:4730".to_owned()],
            worker_id: None,
            request_uniques: false,
            report_exceptions: false,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Per-function registration options.
#[derive(Debug, Clone, Default)]
pub struct FunctionOptions {
    /// Advertise with `CAN_DO_TIMEOUT`: the server may abort jobs that
    /// run longer than this
    pub timeout: Option<Duration>,

    /// How assigned payloads are surfaced to the handler
    pub payload_encoding: Encoding,
}

enum WorkerCommand {
    Register {
        name: String,
        options: FunctionOptions,
        handler: Handler,
        reply: oneshot::Sender<Result<()>>,
    },
    Unregister {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ResetAbilities {
        reply: oneshot::Sender<Result<()>>,
    },
    GrabJob {
        concurrency: usize,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle for registering functions and running the grab cycle.
pub struct Worker {
    cmd_tx: mpsc::Sender<WorkerCommand>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Worker {
    /// Construct a worker and spawn its connection and actor tasks.
    ///
    /// Sockets are dialed lazily on the first broadcast or grab. Must be
    /// called within a tokio runtime.
    pub fn new(config: WorkerConfig) -> Result<Worker> {
        if config.servers.is_empty() {
            return Err(Error::Config("no job servers configured".to_owned()));
        }
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let pool = JobServerPool::spawn(&config.servers, event_tx, &shutdown, &tracker);
        let actor = WorkerActor {
            config,
            pool,
            functions: HashMap::new(),
            concurrency: 0,
            in_flight: 0,
            outstanding: HashMap::new(),
            exhausted: HashSet::new(),
            sleeping: false,
            next_grab: 0,
            retry_at: None,
            running: HashMap::new(),
            signal_tx,
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        };
        tracker.spawn(actor.run(cmd_rx, event_rx, signal_rx));
        tracker.close();
        Ok(Worker {
            cmd_tx,
            shutdown,
            tracker,
        })
    }

    /// Register `handler` under `name` and advertise the capability to
    /// every server. Re-registering a name replaces its handler.
    pub async fn register_function<F, Fut>(
        &self,
        name: impl Into<String>,
        options: FunctionOptions,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(AssignedJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |job| Box::pin(handler(job)));
        self.command(|reply| WorkerCommand::Register {
            name: name.into(),
            options,
            handler,
            reply,
        })
        .await
    }

    /// Withdraw one capability (`CANT_DO`) and drop its handler.
    pub async fn unregister_function(&self, name: impl Into<String>) -> Result<()> {
        self.command(|reply| WorkerCommand::Unregister {
            name: name.into(),
            reply,
        })
        .await
    }

    /// Withdraw every advertised capability and clear the local registry,
    /// returning the worker to a clean state.
    pub async fn reset_abilities(&self) -> Result<()> {
        self.command(|reply| WorkerCommand::ResetAbilities { reply })
            .await
    }

    /// Start (or resize) the grab cycle with up to `concurrency` jobs in
    /// flight at once.
    pub async fn grab_job(&self, concurrency: usize) -> Result<()> {
        self.command(|reply| WorkerCommand::GrabJob { concurrency, reply })
            .await
    }

    /// Tear down all connections and wait for tasks — including running
    /// handlers — to finish.
    pub async fn close(self) {
        self.shutdown.cancel();
        self.tracker.wait().await;
    }

    async fn command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> WorkerCommand,
    ) -> Result<T> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .await
            .map_err(|_| Error::Closed)?;
        reply_rx.await.map_err(|_| Error::Closed)?
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Registration {
    options: FunctionOptions,
    handler: Handler,
}

/// Bookkeeping for one job currently held by this worker.
///
/// A job is finalized once both its completion signal (terminal packet
/// sent, or dropped without one) and its handler outcome have arrived;
/// only then is the concurrency slot released.
#[derive(Default)]
struct RunningJob {
    completion: Option<CompletionKind>,
    handler: Option<HandlerOutcome>,
}

struct WorkerActor {
    config: WorkerConfig,
    pool: JobServerPool,
    functions: HashMap<String, Registration>,
    /// Maximum jobs in flight; zero until `grab_job` is called
    concurrency: usize,
    in_flight: usize,
    /// `GRAB_JOB`s awaiting `JOB_ASSIGN`/`NO_JOB`, per server
    outstanding: HashMap<ServerId, usize>,
    /// Servers that answered `NO_JOB` since the last wake-up
    exhausted: HashSet<ServerId>,
    sleeping: bool,
    next_grab: usize,
    /// Deadline for resuming the cycle after a connection loss
    retry_at: Option<Instant>,
    running: HashMap<(ServerId, String), RunningJob>,
    signal_tx: mpsc::UnboundedSender<JobSignal>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<WorkerCommand>,
        mut event_rx: mpsc::UnboundedReceiver<ServerEvent>,
        mut signal_rx: mpsc::UnboundedReceiver<JobSignal>,
    ) {
        let shutdown = self.shutdown.clone();
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                event = event_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                signal = signal_rx.recv() => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => break,
                },
                _ = deadline(retry_at) => {
                    self.retry_at = None;
                    self.resume("retry after connection loss").await;
                },
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("worker actor stopped");
    }

    async fn handle_command(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Register {
                name,
                options,
                handler,
                reply,
            } => {
                let _ = reply.send(self.register(name, options, handler).await);
            }
            WorkerCommand::Unregister { name, reply } => {
                self.functions.remove(&name);
                let result = self
                    .pool
                    .broadcast(Packet::request(
                        PacketType::CantDo,
                        [Bytes::from(name.into_bytes())],
                    ))
                    .await
                    .map(|_| ());
                let _ = reply.send(result);
            }
            WorkerCommand::ResetAbilities { reply } => {
                let mut result = Ok(());
                for name in self.functions.keys().cloned().collect::<Vec<_>>() {
                    let broadcast = self
                        .pool
                        .broadcast(Packet::request(
                            PacketType::CantDo,
                            [Bytes::from(name.into_bytes())],
                        ))
                        .await;
                    if let (Ok(()), Err(error)) = (&result, broadcast) {
                        result = Err(error);
                    }
                }
                // The local registry clears regardless of server
                // reachability
                self.functions.clear();
                let _ = reply.send(result);
            }
            WorkerCommand::GrabJob { concurrency, reply } => {
                if concurrency == 0 {
                    let _ = reply.send(Err(Error::Config(
                        "grab_job concurrency must be at least 1".to_owned(),
                    )));
                    return;
                }
                debug!(concurrency, "starting grab cycle");
                self.concurrency = concurrency;
                let _ = reply.send(Ok(()));
                self.resume("grab cycle started").await;
            }
        }
    }

    async fn register(
        &mut self,
        name: String,
        options: FunctionOptions,
        handler: Handler,
    ) -> Result<()> {
        if name.is_empty() || name.bytes().any(|b| b == 0) {
            return Err(Error::Config(format!("invalid function name {name:?}")));
        }
        let packet = ability_packet(&name, &options);
        self.functions
            .insert(name.clone(), Registration { options, handler });
        self.pool.broadcast(packet).await?;
        debug!(function = %name, "registered function");
        // A fresh ability may match work that queued while we slept
        if self.concurrency > 0 {
            self.resume("ability added").await;
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { server } => self.announce(server).await,
            ServerEvent::Lost { server, reason } => {
                debug!(server = %server, reason = %reason, "worker connection lost");
                self.outstanding.remove(&server);
                self.exhausted.remove(&server);
                // The cycle resumes after a delay; the send path redials
                // lazily
                self.schedule_retry();
            }
            ServerEvent::Packet { server, packet } => self.handle_packet(server, packet).await,
        }
    }

    /// (Re-)announce identity and abilities to a freshly connected
    /// server. Job servers forget worker state on disconnect, so this
    /// runs on every dial.
    async fn announce(&mut self, server: ServerId) {
        if let Some(worker_id) = &self.config.worker_id {
            let packet = Packet::request(
                PacketType::SetClientId,
                [Bytes::from(worker_id.clone().into_bytes())],
            );
            if let Err(error) = self.pool.send_to(server, packet).await {
                warn!(server = %server, error = %error, "failed to announce worker id");
                return;
            }
        }
        for (name, registration) in &self.functions {
            let packet = ability_packet(name, &registration.options);
            if let Err(error) = self.pool.send_to(server, packet).await {
                warn!(server = %server, function = %name, error = %error,
                    "failed to re-register ability");
                return;
            }
        }
    }

    async fn handle_packet(&mut self, server: ServerId, packet: Packet) {
        match packet.kind {
            PacketType::JobAssign => self.on_assign(server, packet, false).await,
            PacketType::JobAssignUniq => self.on_assign(server, packet, true).await,
            PacketType::NoJob => {
                self.dec_outstanding(server);
                self.exhausted.insert(server);
                trace!(server = %server, "no job available");
                self.maybe_pre_sleep().await;
            }
            PacketType::Noop => {
                self.resume("woken by server").await;
            }
            PacketType::Error => {
                let code = packet.arg_utf8(0).unwrap_or("?");
                let message = packet.arg_utf8(1).unwrap_or("?");
                error!(server = %server, code = %code, message = %message,
                    "server reported an error");
            }
            other => {
                warn!(server = %server, kind = ?other,
                    "unexpected packet on a worker connection");
            }
        }
    }

    async fn on_assign(&mut self, server: ServerId, packet: Packet, with_unique: bool) {
        self.dec_outstanding(server);

        type Assignment = (String, String, Option<String>, Bytes);
        let parsed = (|| -> std::result::Result<Assignment, crate::error::ProtocolError> {
            let handle = packet.arg_utf8(0)?.to_owned();
            let function = packet.arg_utf8(1)?.to_owned();
            let (unique, payload_index) = if with_unique {
                (Some(packet.arg_utf8(2)?.to_owned()), 3)
            } else {
                (None, 2)
            };
            let raw = packet.arg(payload_index).cloned().ok_or(
                crate::error::ProtocolError::MalformedArgument {
                    kind: packet.kind,
                    index: payload_index,
                },
            )?;
            Ok((handle, function, unique, raw))
        })();
        let (handle, function, unique, raw) = match parsed {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(server = %server, error = %error, "malformed job assignment");
                self.pump().await;
                return;
            }
        };

        let (handler, payload_encoding) = match self.functions.get(&function) {
            Some(registration) => (
                registration.handler.clone(),
                registration.options.payload_encoding,
            ),
            None => {
                warn!(server = %server, function = %function,
                    "assigned a job for an unregistered function, failing it");
                self.send_fail(server, &handle).await;
                self.pump().await;
                return;
            }
        };

        let payload = match Payload::decode(raw, payload_encoding) {
            Ok(payload) => payload,
            Err(_) => {
                warn!(server = %server, function = %function, handle = %handle,
                    "assignment payload invalid under text encoding, failing it");
                self.send_fail(server, &handle).await;
                self.pump().await;
                return;
            }
        };

        let Some(conn) = self.pool.get(server).cloned() else {
            warn!(server = %server, "assignment from unknown server");
            return;
        };

        debug!(server = %server, function = %function, handle = %handle, "executing job");
        let job = AssignedJob::new(
            JobHandle::new(server, handle.clone()),
            function,
            payload,
            unique,
            conn,
            self.signal_tx.clone(),
        );
        self.in_flight += 1;
        self.running
            .insert((server, handle.clone()), RunningJob::default());

        let signal_tx = self.signal_tx.clone();
        self.tracker.spawn(async move {
            // Catch panics from both handler invocation and the produced
            // future; the poll cycle must survive bad user code
            let invocation = std::panic::AssertUnwindSafe(async move { handler(job).await });
            let outcome = match invocation.catch_unwind().await {
                Ok(Ok(())) => HandlerOutcome::Ok,
                Ok(Err(error)) => HandlerOutcome::Error(error.to_string()),
                Err(_) => HandlerOutcome::Panicked,
            };
            let _ = signal_tx.send(JobSignal::HandlerDone {
                server,
                handle,
                outcome,
            });
        });

        self.pump().await;
    }

    async fn handle_signal(&mut self, signal: JobSignal) {
        let key = match &signal {
            JobSignal::Completion { server, handle, .. }
            | JobSignal::HandlerDone { server, handle, .. } => (*server, handle.clone()),
        };
        let Some(running) = self.running.get_mut(&key) else {
            warn!(handle = %key.1, "signal for a job that is not running");
            return;
        };
        match signal {
            JobSignal::Completion { kind, .. } => running.completion = Some(kind),
            JobSignal::HandlerDone { outcome, .. } => running.handler = Some(outcome),
        }
        self.try_finalize(key).await;
    }

    /// Release the job's slot once both its completion signal and its
    /// handler outcome are in, reporting a fallback terminal if the
    /// handler never sent one.
    async fn try_finalize(&mut self, key: (ServerId, String)) {
        let ready = self
            .running
            .get(&key)
            .is_some_and(|r| r.completion.is_some() && r.handler.is_some());
        if !ready {
            return;
        }
        let running = self.running.remove(&key).expect("checked above");
        let (server, handle) = key;
        self.in_flight = self.in_flight.saturating_sub(1);

        match (running.completion, running.handler) {
            (Some(CompletionKind::Terminal), Some(HandlerOutcome::Ok)) => {
                trace!(handle = %handle, "job finished");
            }
            (Some(CompletionKind::Terminal), Some(outcome)) => {
                // Terminal already reported; nothing more to send
                warn!(handle = %handle, outcome = ?outcome,
                    "handler failed after reporting a terminal");
            }
            (Some(CompletionKind::Abandoned), Some(HandlerOutcome::Error(message))) => {
                if self.config.report_exceptions {
                    warn!(handle = %handle, error = %message,
                        "handler failed, reporting exception");
                    self.send_exception(server, &handle, &message).await;
                } else {
                    warn!(handle = %handle, error = %message, "handler failed, reporting failure");
                    self.send_fail(server, &handle).await;
                }
            }
            (Some(CompletionKind::Abandoned), Some(HandlerOutcome::Panicked)) => {
                error!(handle = %handle, "handler panicked, reporting failure");
                self.send_fail(server, &handle).await;
            }
            (Some(CompletionKind::Abandoned), Some(HandlerOutcome::Ok)) => {
                warn!(handle = %handle,
                    "handler finished without a terminal report, reporting failure");
                self.send_fail(server, &handle).await;
            }
            (completion, handler) => {
                // Unreachable given the readiness check
                warn!(handle = %handle, ?completion, ?handler, "inconsistent job bookkeeping");
            }
        }
        self.pump().await;
    }

    async fn send_fail(&self, server: ServerId, handle: &str) {
        let packet = Packet::request(
            PacketType::WorkFail,
            [Bytes::copy_from_slice(handle.as_bytes())],
        );
        if let Err(error) = self.pool.send_to(server, packet).await {
            debug!(server = %server, handle = %handle, error = %error,
                "could not report job failure");
        }
    }

    async fn send_exception(&self, server: ServerId, handle: &str, message: &str) {
        let packet = Packet::request(
            PacketType::WorkException,
            [
                Bytes::copy_from_slice(handle.as_bytes()),
                Bytes::copy_from_slice(message.as_bytes()),
            ],
        );
        if let Err(error) = self.pool.send_to(server, packet).await {
            debug!(server = %server, handle = %handle, error = %error,
                "could not report job exception");
        }
    }

    fn dec_outstanding(&mut self, server: ServerId) {
        if let Some(count) = self.outstanding.get_mut(&server) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.outstanding.remove(&server);
            }
        }
    }

    fn total_outstanding(&self) -> usize {
        self.outstanding.values().sum()
    }

    fn slots_free(&self) -> usize {
        self.concurrency
            .saturating_sub(self.in_flight + self.total_outstanding())
    }

    /// Issue grabs round-robin until every slot is covered or every
    /// server is exhausted.
    async fn pump(&mut self) {
        if self.concurrency == 0 || self.sleeping || self.functions.is_empty() {
            return;
        }
        let grab_kind = if self.config.request_uniques {
            PacketType::GrabJobUniq
        } else {
            PacketType::GrabJob
        };
        while self.slots_free() > 0 {
            let Some(server) = self.next_grabbable() else {
                break;
            };
            match self
                .pool
                .send_to(server, Packet::request(grab_kind, std::iter::empty()))
                .await
            {
                Ok(()) => {
                    *self.outstanding.entry(server).or_insert(0) += 1;
                    trace!(server = %server, "grabbing job");
                }
                Err(error) => {
                    debug!(server = %server, error = %error, "grab failed, server exhausted");
                    self.exhausted.insert(server);
                    self.schedule_retry();
                }
            }
        }
        self.maybe_pre_sleep().await;
    }

    fn next_grabbable(&mut self) -> Option<ServerId> {
        let count = self.pool.len();
        for offset in 0..count {
            let index = (self.next_grab + offset) % count;
            let server = ServerId::new(index);
            if !self.exhausted.contains(&server) {
                self.next_grab = (index + 1) % count;
                return Some(server);
            }
        }
        None
    }

    /// Park with `PRE_SLEEP` once every server is exhausted, there are
    /// free slots wanting work, and no grab is still unanswered.
    async fn maybe_pre_sleep(&mut self) {
        if self.concurrency == 0 || self.sleeping {
            return;
        }
        if self.slots_free() == 0 || self.total_outstanding() > 0 {
            return;
        }
        if self.exhausted.len() < self.pool.len() {
            return;
        }
        debug!("no work available anywhere, pre-sleeping");
        self.sleeping = true;
        if let Err(error) = self
            .pool
            .broadcast(Packet::request(PacketType::PreSleep, std::iter::empty()))
            .await
        {
            // No server heard the pre-sleep, so no NOOP will ever wake
            // us; fall back to the retry timer
            debug!(error = %error, "pre-sleep broadcast failed");
            self.schedule_retry();
        }
    }

    /// Arm the resume timer after a connectivity failure, if the grab
    /// cycle is active and no retry is already scheduled.
    fn schedule_retry(&mut self) {
        if self.concurrency > 0 && self.retry_at.is_none() {
            self.retry_at = Some(Instant::now() + self.config.reconnect_delay);
        }
    }

    /// Wake the cycle: forget exhaustion marks and grab again.
    async fn resume(&mut self, why: &str) {
        if self.concurrency == 0 {
            return;
        }
        trace!(reason = why, "resuming grab cycle");
        self.sleeping = false;
        self.exhausted.clear();
        self.pump().await;
    }
}

/// Build the `CAN_DO`/`CAN_DO_TIMEOUT` advertisement for one function.
fn ability_packet(name: &str, options: &FunctionOptions) -> Packet {
    match options.timeout {
        Some(timeout) => Packet::request(
            PacketType::CanDoTimeout,
            [
                Bytes::copy_from_slice(name.as_bytes()),
                Bytes::from(timeout.as_secs().to_string()),
            ],
        ),
        None => Packet::request(
            PacketType::CanDo,
            [Bytes::copy_from_slice(name.as_bytes())],
        ),
    }
}

/// Sleep until the retry deadline, or forever when none is set.
async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
