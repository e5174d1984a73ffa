//! Response routing for submitted jobs.
//!
//! Before a handle exists, a submission is correlated by per-connection
//! FIFO: the next `JOB_CREATED` on a connection belongs to the oldest
//! unacknowledged submission on that same connection (the protocol
//! guarantees in-order creation replies). Once the handle arrives the job
//! is re-indexed by `(server, handle)` and all later `WORK_*` traffic
//! routes through that key.
//!
//! The registry is plain data owned by the client's router task; no locks,
//! no I/O.

use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::ServerId;
use crate::error::ProtocolError;
use crate::job::{FailureReason, JobEvent, JobHandle, JobState, JobStatus};
use crate::packet::{Encoding, Packet, PacketType, Payload};

/// A submission awaiting its `JOB_CREATED`.
pub(crate) struct PendingJob {
    pub events: mpsc::UnboundedSender<JobEvent>,
    pub response_encoding: Encoding,
    pub background: bool,
}

/// A job with an assigned handle, awaiting worker traffic.
struct ActiveJob {
    events: mpsc::UnboundedSender<JobEvent>,
    response_encoding: Encoding,
    state: JobState,
}

impl ActiveJob {
    /// Apply and deliver one event; a dropped receiver just means nobody
    /// is watching anymore.
    fn emit(&mut self, event: JobEvent) {
        self.state.apply(&event);
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
pub(crate) struct JobRegistry {
    pending: HashMap<ServerId, VecDeque<PendingJob>>,
    active: HashMap<(ServerId, String), ActiveJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a submission that was just written to `server`, in write
    /// order.
    pub fn push_pending(&mut self, server: ServerId, job: PendingJob) {
        self.pending.entry(server).or_default().push_back(job);
    }

    /// Route one job-related response packet to its job.
    ///
    /// Returns a [`ProtocolError`] only for violations that poison the
    /// connection (unknown handle, duplicate handle, missing pending
    /// submission); payload-level problems fail the affected job instead.
    pub fn route(&mut self, server: ServerId, packet: &Packet) -> Result<(), ProtocolError> {
        match packet.kind {
            PacketType::JobCreated => self.on_job_created(server, packet),
            PacketType::WorkData | PacketType::WorkWarning => self.on_progress(server, packet),
            PacketType::WorkStatus => self.on_work_status(server, packet),
            PacketType::WorkComplete | PacketType::WorkException => {
                self.on_terminal_payload(server, packet)
            }
            PacketType::WorkFail => self.on_work_fail(server, packet),
            other => {
                debug!(kind = ?other, "packet kind is not registry traffic, ignoring");
                Ok(())
            }
        }
    }

    fn on_job_created(&mut self, server: ServerId, packet: &Packet) -> Result<(), ProtocolError> {
        let handle = packet.arg_utf8(0)?.to_owned();
        let pending = self
            .pending
            .get_mut(&server)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| ProtocolError::UnknownHandle {
                handle: handle.clone(),
            })?;

        let event = JobEvent::Created(JobHandle::new(server, handle.clone()));
        if pending.background {
            // Background jobs get the handle and nothing further; dropping
            // the sender ends the event stream
            let _ = pending.events.send(event);
            return Ok(());
        }

        let key = (server, handle.clone());
        if self.active.contains_key(&key) {
            return Err(ProtocolError::DuplicateHandle { handle });
        }
        let mut job = ActiveJob {
            events: pending.events,
            response_encoding: pending.response_encoding,
            state: JobState::Created,
        };
        job.emit(event);
        self.active.insert(key, job);
        Ok(())
    }

    fn on_progress(&mut self, server: ServerId, packet: &Packet) -> Result<(), ProtocolError> {
        let handle = packet.arg_utf8(0)?.to_owned();
        let job = self.lookup(server, &handle)?;
        let raw = packet
            .arg(1)
            .cloned()
            .ok_or(ProtocolError::MalformedArgument {
                kind: packet.kind,
                index: 1,
            })?;
        match Payload::decode(raw, job.response_encoding) {
            Ok(payload) => {
                let event = match packet.kind {
                    PacketType::WorkData => JobEvent::Data(payload),
                    _ => JobEvent::Warning(payload),
                };
                job.emit(event);
                Ok(())
            }
            Err(_) => {
                // Bad bytes under a text option fail this job, not the
                // connection
                warn!(handle = %handle, "progress payload invalid under text encoding, failing job");
                self.fail_one(server, &handle, FailureReason::InvalidPayload);
                Ok(())
            }
        }
    }

    fn on_work_status(&mut self, server: ServerId, packet: &Packet) -> Result<(), ProtocolError> {
        let handle = packet.arg_utf8(0)?.to_owned();
        let numerator = packet.arg_u64(1)?;
        let denominator = packet.arg_u64(2)?;
        let job = self.lookup(server, &handle)?;
        job.emit(JobEvent::Status(JobStatus {
            known: true,
            running: true,
            numerator,
            denominator,
        }));
        Ok(())
    }

    fn on_terminal_payload(
        &mut self,
        server: ServerId,
        packet: &Packet,
    ) -> Result<(), ProtocolError> {
        let handle = packet.arg_utf8(0)?.to_owned();
        let key = (server, handle.clone());
        let mut job = self
            .active
            .remove(&key)
            .ok_or_else(|| ProtocolError::UnknownHandle {
                handle: handle.clone(),
            })?;
        let raw = packet
            .arg(1)
            .cloned()
            .ok_or(ProtocolError::MalformedArgument {
                kind: packet.kind,
                index: 1,
            })?;
        match Payload::decode(raw, job.response_encoding) {
            Ok(payload) => {
                let event = match packet.kind {
                    PacketType::WorkComplete => JobEvent::Complete(payload),
                    _ => JobEvent::Exception(payload),
                };
                job.emit(event);
            }
            Err(_) => {
                warn!(handle = %handle, "result payload invalid under text encoding, failing job");
                job.emit(JobEvent::Fail(FailureReason::InvalidPayload));
            }
        }
        Ok(())
    }

    fn on_work_fail(&mut self, server: ServerId, packet: &Packet) -> Result<(), ProtocolError> {
        let handle = packet.arg_utf8(0)?.to_owned();
        let key = (server, handle.clone());
        let mut job = self
            .active
            .remove(&key)
            .ok_or(ProtocolError::UnknownHandle { handle })?;
        job.emit(JobEvent::Fail(FailureReason::Reported));
        Ok(())
    }

    fn lookup(
        &mut self,
        server: ServerId,
        handle: &str,
    ) -> Result<&mut ActiveJob, ProtocolError> {
        self.active
            .get_mut(&(server, handle.to_owned()))
            .ok_or_else(|| ProtocolError::UnknownHandle {
                handle: handle.to_owned(),
            })
    }

    fn fail_one(&mut self, server: ServerId, handle: &str, reason: FailureReason) {
        if let Some(mut job) = self.active.remove(&(server, handle.to_owned())) {
            job.emit(JobEvent::Fail(reason));
        }
    }

    /// Fail every job bound to `server` — pending and active — with the
    /// given reason. Returns how many jobs were failed.
    pub fn fail_server(&mut self, server: ServerId, reason: &FailureReason) -> usize {
        let mut failed = 0;
        if let Some(queue) = self.pending.remove(&server) {
            for pending in queue {
                let _ = pending.events.send(JobEvent::Fail(reason.clone()));
                failed += 1;
            }
        }
        let keys: Vec<_> = self
            .active
            .keys()
            .filter(|(s, _)| *s == server)
            .cloned()
            .collect();
        for key in keys {
            if let Some(mut job) = self.active.remove(&key) {
                job.emit(JobEvent::Fail(reason.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Fail everything; used at client teardown.
    pub fn fail_all(&mut self, reason: &FailureReason) {
        let servers: Vec<_> = self
            .pending
            .keys()
            .copied()
            .chain(self.active.keys().map(|(s, _)| *s))
            .collect();
        for server in servers {
            self.fail_server(server, reason);
        }
    }

    #[cfg(test)]
    fn pending_len(&self, server: ServerId) -> usize {
        self.pending.get(&server).map_or(0, VecDeque::len)
    }

    #[cfg(test)]
    fn active_len(&self) -> usize {
        self.active.len()
    }
}
