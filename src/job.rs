//! Job state and the two views of a job.
//!
//! A job is observed from the client side as a [`SubmittedJob`] — a typed
//! event stream with a single terminal event — and driven from the worker
//! side as an [`AssignedJob`], whose terminal operations consume it so the
//! type system enforces "exactly one terminal report". An assigned job
//! dropped without a terminal is reported as a failure by its drop guard
//! rather than left dangling on the server.

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::connection::{ConnectionHandle, ServerId};
use crate::error::{Error, Result};
use crate::packet::{Packet, PacketType, Payload};

/// Submission priority, selecting the `SUBMIT_JOB*` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Server-assigned job identifier plus the connection it is valid on.
///
/// Handles are opaque and only unique per server, so the originating
/// server travels with the handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    server: ServerId,
    handle: String,
}

impl JobHandle {
    pub(crate) fn new(server: ServerId, handle: String) -> Self {
        JobHandle { server, handle }
    }

    pub fn server(&self) -> ServerId {
        self.server
    }

    pub fn as_str(&self) -> &str {
        &self.handle
    }

    pub(crate) fn to_bytes(&self) -> Bytes {
        Bytes::from(self.handle.clone().into_bytes())
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.handle, self.server)
    }
}

/// Lifecycle of one job as observed through packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Submitted locally, no `JOB_CREATED` yet
    Created,
    /// Handle assigned, awaiting worker pickup
    Queued,
    /// A worker has taken the job (observed via progress traffic)
    Running,
    Completed,
    Failed,
    Exception,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Exception
        )
    }

    /// Advance the state for an observed event. Progress events imply a
    /// worker is running the job; they never terminate it.
    pub(crate) fn apply(&mut self, event: &JobEvent) {
        if self.is_terminal() {
            return;
        }
        match event {
            JobEvent::Created(_) => {
                if *self == JobState::Created {
                    *self = JobState::Queued;
                }
            }
            JobEvent::Data(_) | JobEvent::Warning(_) | JobEvent::Status(_) => {
                *self = JobState::Running;
            }
            JobEvent::Complete(_) => *self = JobState::Completed,
            JobEvent::Fail(_) => *self = JobState::Failed,
            JobEvent::Exception(_) => *self = JobState::Exception,
        }
    }
}

/// Snapshot from `STATUS_RES` / `WORK_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatus {
    /// The server knows this handle
    pub known: bool,
    /// A worker currently holds the job
    pub running: bool,
    pub numerator: u64,
    pub denominator: u64,
}

/// Why a job reached the `Failed` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The worker reported `WORK_FAIL`
    Reported,
    /// The connection carrying the job dropped
    ConnectionLost,
    /// Response bytes were invalid under the configured text encoding
    InvalidPayload,
    /// The server reported a protocol-level error on this connection
    ServerError { code: String, message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Reported => f.write_str("reported by worker"),
            FailureReason::ConnectionLost => f.write_str("connection lost"),
            FailureReason::InvalidPayload => f.write_str("invalid payload encoding"),
            FailureReason::ServerError { code, message } => {
                write!(f, "server error {code}: {message}")
            }
        }
    }
}

/// Typed events delivered to a [`SubmittedJob`].
///
/// `Data`, `Warning` and `Status` are progress side-channels; exactly one
/// of `Complete`, `Fail` or `Exception` ends the stream.
#[derive(Debug)]
pub enum JobEvent {
    /// The server acknowledged the submission and assigned a handle
    Created(JobHandle),
    /// Intermediate result chunk (`WORK_DATA`)
    Data(Payload),
    /// Non-fatal warning from the worker (`WORK_WARNING`)
    Warning(Payload),
    /// Progress fraction (`WORK_STATUS`)
    Status(JobStatus),
    /// Terminal success with the result payload
    Complete(Payload),
    /// Terminal failure
    Fail(FailureReason),
    /// Terminal exception with the worker's message
    Exception(Payload),
}

/// Final disposition of a job, as returned by [`SubmittedJob::wait`].
#[derive(Debug)]
pub enum JobOutcome {
    Complete(Payload),
    Fail(FailureReason),
    Exception(Payload),
    /// Background submission acknowledged; no further events follow
    Detached(JobHandle),
}

/// Client-side view of one submitted job.
///
/// Returned by `Client::submit_job` as soon as the submission is written;
/// events arrive as the server reports them. Drop it to stop observing —
/// the job itself keeps running on the server.
pub struct SubmittedJob {
    function: String,
    unique: Option<String>,
    background: bool,
    handle: Option<JobHandle>,
    state: JobState,
    events: mpsc::UnboundedReceiver<JobEvent>,
}

impl SubmittedJob {
    pub(crate) fn new(
        function: String,
        unique: Option<String>,
        background: bool,
        events: mpsc::UnboundedReceiver<JobEvent>,
    ) -> Self {
        SubmittedJob {
            function,
            unique,
            background,
            handle: None,
            state: JobState::Created,
            events,
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn unique(&self) -> Option<&str> {
        self.unique.as_deref()
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    /// The server handle, once `Created` has been observed.
    pub fn handle(&self) -> Option<&JobHandle> {
        self.handle.as_ref()
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Next event for this job, or `None` after the terminal event (for
    /// background jobs: after `Created`).
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        let event = self.events.recv().await?;
        self.observe(&event);
        Some(event)
    }

    /// Wait for the submission acknowledgement and return the handle.
    pub async fn created(&mut self) -> Result<JobHandle> {
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }
        while let Some(event) = self.next_event().await {
            match event {
                JobEvent::Created(handle) => return Ok(handle),
                JobEvent::Fail(reason) => return Err(Error::JobFailed(reason)),
                _ => {}
            }
        }
        Err(Error::Closed)
    }

    /// Drain events until the job ends and return its disposition.
    ///
    /// Progress events are discarded; use [`next_event`](Self::next_event)
    /// to observe them.
    pub async fn wait(mut self) -> JobOutcome {
        loop {
            match self.events.recv().await {
                Some(event) => {
                    self.observe(&event);
                    match event {
                        JobEvent::Complete(payload) => return JobOutcome::Complete(payload),
                        JobEvent::Fail(reason) => return JobOutcome::Fail(reason),
                        JobEvent::Exception(payload) => return JobOutcome::Exception(payload),
                        _ => {}
                    }
                }
                None => {
                    return match (&self.handle, self.background) {
                        (Some(handle), true) => JobOutcome::Detached(handle.clone()),
                        _ => JobOutcome::Fail(FailureReason::ConnectionLost),
                    }
                }
            }
        }
    }

    fn observe(&mut self, event: &JobEvent) {
        if let JobEvent::Created(handle) = event {
            self.handle = Some(handle.clone());
        }
        self.state.apply(event);
    }
}

impl fmt::Debug for SubmittedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmittedJob")
            .field("function", &self.function)
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("background", &self.background)
            .finish()
    }
}

/// Completion bookkeeping signals from an assigned job to its worker.
#[derive(Debug)]
pub(crate) enum JobSignal {
    /// The job sent a terminal packet, or was dropped without one
    Completion {
        server: ServerId,
        handle: String,
        kind: CompletionKind,
    },
    /// The registered handler returned or panicked
    HandlerDone {
        server: ServerId,
        handle: String,
        outcome: HandlerOutcome,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionKind {
    /// A terminal packet (`WORK_COMPLETE`/`WORK_FAIL`/`WORK_EXCEPTION`)
    /// went out
    Terminal,
    /// Dropped without a terminal; the worker must report `WORK_FAIL`
    Abandoned,
}

#[derive(Debug)]
pub(crate) enum HandlerOutcome {
    Ok,
    Error(String),
    Panicked,
}

/// Worker-side view of one job taken from a server.
///
/// Progress operations borrow the job; terminal operations consume it.
/// Dropping an unfinished job makes the worker report `WORK_FAIL` so the
/// server never waits on a dead assignment.
pub struct AssignedJob {
    handle: JobHandle,
    function: String,
    payload: Payload,
    unique: Option<String>,
    conn: ConnectionHandle,
    signals: mpsc::UnboundedSender<JobSignal>,
    finished: bool,
}

impl AssignedJob {
    pub(crate) fn new(
        handle: JobHandle,
        function: String,
        payload: Payload,
        unique: Option<String>,
        conn: ConnectionHandle,
        signals: mpsc::UnboundedSender<JobSignal>,
    ) -> Self {
        AssignedJob {
            handle,
            function,
            payload,
            unique,
            conn,
            signals,
            finished: false,
        }
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// The submitted workload, decoded per the function registration's
    /// encoding option.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The client-supplied unique token.
    ///
    /// `Some` only when the worker was configured to request uniques;
    /// `Some("")` when it was and the client omitted the token.
    pub fn unique(&self) -> Option<&str> {
        self.unique.as_deref()
    }

    /// Send an intermediate result chunk (`WORK_DATA`). Non-terminal.
    pub async fn send_data(&self, payload: impl Into<Payload>) -> Result<()> {
        self.send_chunk(PacketType::WorkData, payload.into()).await
    }

    /// Report a warning (`WORK_WARNING`). Non-terminal.
    pub async fn report_warning(&self, payload: impl Into<Payload>) -> Result<()> {
        self.send_chunk(PacketType::WorkWarning, payload.into())
            .await
    }

    /// Report a progress fraction (`WORK_STATUS`). Non-terminal.
    pub async fn report_status(&self, numerator: u64, denominator: u64) -> Result<()> {
        self.conn
            .send(Packet::request(
                PacketType::WorkStatus,
                [
                    self.handle.to_bytes(),
                    Bytes::from(numerator.to_string()),
                    Bytes::from(denominator.to_string()),
                ],
            ))
            .await
    }

    /// Finish successfully with a result payload (`WORK_COMPLETE`).
    pub async fn complete(mut self, payload: impl Into<Payload>) -> Result<()> {
        self.finish(CompletionKind::Terminal);
        self.conn
            .send(Packet::request(
                PacketType::WorkComplete,
                [self.handle.to_bytes(), payload.into().into_bytes()],
            ))
            .await
    }

    /// Finish as failed (`WORK_FAIL`).
    pub async fn fail(mut self) -> Result<()> {
        self.finish(CompletionKind::Terminal);
        self.conn
            .send(Packet::request(
                PacketType::WorkFail,
                [self.handle.to_bytes()],
            ))
            .await
    }

    /// Finish with an exception message (`WORK_EXCEPTION`).
    ///
    /// Only clients whose connection negotiated the `exceptions` option
    /// observe this; for others the server drops it.
    pub async fn report_exception(mut self, payload: impl Into<Payload>) -> Result<()> {
        self.finish(CompletionKind::Terminal);
        self.conn
            .send(Packet::request(
                PacketType::WorkException,
                [self.handle.to_bytes(), payload.into().into_bytes()],
            ))
            .await
    }

    async fn send_chunk(&self, kind: PacketType, payload: Payload) -> Result<()> {
        trace!(handle = %self.handle, kind = ?kind, payload = %payload, "sending progress");
        self.conn
            .send(Packet::request(
                kind,
                [self.handle.to_bytes(), payload.into_bytes()],
            ))
            .await
    }

    fn finish(&mut self, kind: CompletionKind) {
        self.finished = true;
        let _ = self.signals.send(JobSignal::Completion {
            server: self.handle.server(),
            handle: self.handle.as_str().to_owned(),
            kind,
        });
    }
}

impl Drop for AssignedJob {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(CompletionKind::Abandoned);
        }
    }
}

impl fmt::Debug for AssignedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssignedJob")
            .field("handle", &self.handle)
            .field("function", &self.function)
            .field("unique", &self.unique)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> JobHandle {
        JobHandle::new(ServerId::new(0), "H:test:1".to_owned())
    }

    #[test]
    fn state_machine_follows_the_happy_path() {
        let mut state = JobState::Created;
        state.apply(&JobEvent::Created(handle()));
        assert_eq!(state, JobState::Queued);
        state.apply(&JobEvent::Data(Payload::from("chunk")));
        assert_eq!(state, JobState::Running);
        state.apply(&JobEvent::Complete(Payload::from("done")));
        assert_eq!(state, JobState::Completed);
        assert!(state.is_terminal());
    }

    #[test]
    fn progress_events_never_terminate() {
        let mut state = JobState::Queued;
        state.apply(&JobEvent::Warning(Payload::from("w")));
        state.apply(&JobEvent::Status(JobStatus {
            known: true,
            running: true,
            numerator: 1,
            denominator: 2,
        }));
        assert_eq!(state, JobState::Running);
        assert!(!state.is_terminal());
    }

    #[test]
    fn terminal_state_ignores_later_events() {
        let mut state = JobState::Failed;
        state.apply(&JobEvent::Complete(Payload::from("late")));
        assert_eq!(state, JobState::Failed);
    }

    #[tokio::test]
    async fn submitted_job_caches_handle_and_state() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut job = SubmittedJob::new("reverse".to_owned(), None, false, rx);
        assert_eq!(job.state(), JobState::Created);
        assert!(job.handle().is_none());

        tx.send(JobEvent::Created(handle())).unwrap();
        tx.send(JobEvent::Complete(Payload::from("321"))).unwrap();

        assert!(matches!(
            job.next_event().await,
            Some(JobEvent::Created(_))
        ));
        assert_eq!(job.handle().map(JobHandle::as_str), Some("H:test:1"));
        assert_eq!(job.state(), JobState::Queued);

        assert!(matches!(
            job.next_event().await,
            Some(JobEvent::Complete(_))
        ));
        assert_eq!(job.state(), JobState::Completed);
    }

    #[tokio::test]
    async fn wait_skips_progress_and_returns_terminal() {
        let (tx, rx) = mpsc::unbounded_channel();
        let job = SubmittedJob::new("f".to_owned(), None, false, rx);
        tx.send(JobEvent::Created(handle())).unwrap();
        tx.send(JobEvent::Data(Payload::from("a"))).unwrap();
        tx.send(JobEvent::Warning(Payload::from("w"))).unwrap();
        tx.send(JobEvent::Complete(Payload::from("done"))).unwrap();

        match job.wait().await {
            JobOutcome::Complete(payload) => assert_eq!(payload.as_text(), Some("done")),
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn background_wait_detaches_after_created() {
        let (tx, rx) = mpsc::unbounded_channel();
        let job = SubmittedJob::new("f".to_owned(), None, true, rx);
        tx.send(JobEvent::Created(handle())).unwrap();
        drop(tx);

        match job.wait().await {
            JobOutcome::Detached(h) => assert_eq!(h.as_str(), "H:test:1"),
            other => panic!("expected Detached, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_assigned_job_signals_abandonment() {
        use tokio_util::sync::CancellationToken;
        use tokio_util::task::TaskTracker;

        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        // Never dialed; the job is dropped without any traffic
        let conn = ConnectionHandle::spawn(
            ServerId::new(0),
            "127.0.0.1:1".to_owned(),
            event_tx,
            shutdown,
            &tracker,
        );
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let job = AssignedJob::new(
            handle(),
            "f".to_owned(),
            Payload::from("p"),
            None,
            conn,
            signal_tx,
        );
        drop(job);

        match signal_rx.recv().await.unwrap() {
            JobSignal::Completion { kind, handle, .. } => {
                assert_eq!(kind, CompletionKind::Abandoned);
                assert_eq!(handle, "H:test:1");
            }
            other => panic!("expected Completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_stream_without_terminal_is_connection_loss() {
        let (tx, rx) = mpsc::unbounded_channel::<JobEvent>();
        let job = SubmittedJob::new("f".to_owned(), None, false, rx);
        drop(tx);
        assert!(matches!(
            job.wait().await,
            JobOutcome::Fail(FailureReason::ConnectionLost)
        ));
    }
}
