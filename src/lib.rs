//! Gearman job-queue protocol client and worker.
//!
//! This crate speaks the Gearman binary protocol: producers submit units
//! of work to one or more job servers with a [`Client`], and consumers
//! register capability names and execute assigned work with a [`Worker`].
//! Progress and results travel as structured events over a
//! length-prefixed binary wire format.
//!
//! # Protocol Overview
//!
//! Every frame is a 12-byte header (`\0REQ`/`\0RES` magic, packet-type
//! code, length) followed by NUL-separated arguments. The two sides of
//! the protocol:
//!
//! - **Client requests**: `SUBMIT_JOB` variants (background × priority),
//!   `GET_STATUS`, `OPTION_REQ`, `ECHO_REQ`
//! - **Worker requests**: `CAN_DO`/`CANT_DO` registration, the
//!   `GRAB_JOB` → `JOB_ASSIGN`/`NO_JOB` → `PRE_SLEEP` poll cycle, and
//!   `WORK_*` progress/result reports
//! - **Server responses**: `JOB_CREATED` acknowledgements correlated
//!   FIFO per connection, `WORK_*` events routed by job handle, `NOOP`
//!   wake-ups for sleeping workers
//!
//! # Architecture
//!
//! Each configured server gets one connection task owning its TCP
//! stream; decoded packets flow upward in arrival order, tagged with the
//! originating server. A client router task owns the response-routing
//! registry; a worker actor task owns the grab cycle. Nothing blocks a
//! reactor thread and nothing shares mutable state, so there are no
//! locks around job or registry state.
//!
//! # Usage
//!
//! ```rust,ignore
//! use gearwire::{Client, ClientConfig, SubmitOptions, Worker, WorkerConfig, FunctionOptions, Encoding};
//!
//! let worker = Worker::new(WorkerConfig::default())?;
//! worker.register_function(
//!     "reverse",
//!     FunctionOptions { payload_encoding: Encoding::Utf8, ..Default::default() },
//!     |job| async move {
//!         let text = job.payload().as_text().unwrap_or_default().to_owned();
//!         job.complete(text.chars().rev().collect::<String>()).await?;
//!         Ok(())
//!     },
//! ).await?;
//! worker.grab_job(1).await?;
//!
//! let client = Client::new(ClientConfig::default())?;
//! let job = client.submit_job("reverse", "123", SubmitOptions::default()).await?;
//! match job.wait().await {
//!     gearwire::JobOutcome::Complete(payload) => println!("result: {payload}"),
//!     other => eprintln!("job did not complete: {other:?}"),
//! }
//! ```

mod client;
mod codec;
mod connection;
mod error;
mod job;
mod packet;
mod pool;
mod registry;
mod worker;

pub use client::{Client, ClientConfig, SubmitOptions};
pub use codec::{PacketCodec, MAX_FRAME_LEN};
pub use connection::{ConnState, ServerId};
pub use error::{ConnectionError, Error, ProtocolError, Result};
pub use job::{
    AssignedJob, FailureReason, JobEvent, JobHandle, JobOutcome, JobState, JobStatus, Priority,
    SubmittedJob,
};
pub use packet::{Encoding, Packet, PacketMagic, PacketType, Payload};
pub use worker::{FunctionOptions, HandlerError, Worker, WorkerConfig};
