//! In-process job server for full-stack tests.
//!
//! Implements the broker side of the protocol over a loopback
//! `TcpListener`: submission queues per function and priority, FIFO
//! `JOB_CREATED` acknowledgements, grab/no-job dispatch, `NOOP` wake-ups
//! for sleeping workers, `WORK_*` forwarding to the submitting client
//! (with exception gating), status queries and echo. Enough server for
//! every scenario the crate promises, nothing more.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use gearwire::{Packet, PacketCodec, PacketType};

type ConnId = u64;
type ConnTx = mpsc::UnboundedSender<Packet>;

pub struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Start on an ephemeral loopback port.
    pub async fn start() -> TestServer {
        Self::bind("127.0.0.1:0").await
    }

    /// Start on a specific address (used to restart on a known port).
    pub async fn bind(addr: &str) -> TestServer {
        let listener = TcpListener::bind(addr).await.expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let shutdown = CancellationToken::new();
        let state = Arc::new(Mutex::new(BrokerState::default()));

        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((socket, _)) = accepted else { break };
                        tokio::spawn(serve_conn(
                            state.clone(),
                            socket,
                            accept_shutdown.clone(),
                        ));
                    }
                    _ = accept_shutdown.cancelled() => break,
                }
            }
        });
        TestServer { addr, shutdown }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Drop the listener and every open connection.
    pub async fn stop(self) {
        self.shutdown.cancel();
        // Let the accept and connection tasks close their sockets so the
        // port can be rebound
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

#[derive(Default)]
struct BrokerState {
    next_conn: ConnId,
    next_handle: u64,
    conns: HashMap<ConnId, ConnInfo>,
    /// Queued jobs per function, by priority rank (high, normal, low)
    queues: HashMap<String, [VecDeque<QueuedJob>; 3]>,
    /// Every live job by handle, queued or running
    jobs: HashMap<String, JobRecord>,
}

struct ConnInfo {
    tx: ConnTx,
    abilities: HashSet<String>,
    sleeping: bool,
    exceptions: bool,
}

struct QueuedJob {
    handle: String,
    unique: String,
    payload: Bytes,
}

struct JobRecord {
    function: String,
    /// Submitting connection; `None` for background jobs
    client: Option<ConnId>,
    running: bool,
    numerator: u64,
    denominator: u64,
}

impl BrokerState {
    fn alloc_handle(&mut self) -> String {
        self.next_handle += 1;
        format!("H:test:{}", self.next_handle)
    }

    /// Pop the best queued job this connection can run: priority rank
    /// first, FIFO within a rank.
    fn take_job(&mut self, conn: ConnId) -> Option<(String, QueuedJob)> {
        let abilities = self.conns.get(&conn)?.abilities.clone();
        for rank in 0..3 {
            for function in &abilities {
                if let Some(queues) = self.queues.get_mut(function) {
                    if let Some(job) = queues[rank].pop_front() {
                        return Some((function.clone(), job));
                    }
                }
            }
        }
        None
    }

    fn has_work_for(&self, conn: ConnId) -> bool {
        let Some(info) = self.conns.get(&conn) else {
            return false;
        };
        info.abilities.iter().any(|function| {
            self.queues
                .get(function)
                .is_some_and(|queues| queues.iter().any(|q| !q.is_empty()))
        })
    }

    fn send_to(&self, conn: ConnId, packet: Packet) {
        if let Some(info) = self.conns.get(&conn) {
            let _ = info.tx.send(packet);
        }
    }

    /// Wake every sleeping worker able to run `function`.
    fn wake_workers(&mut self, function: &str) {
        for info in self.conns.values_mut() {
            if info.sleeping && info.abilities.contains(function) {
                info.sleeping = false;
                let _ = info
                    .tx
                    .send(Packet::response(PacketType::Noop, std::iter::empty()));
            }
        }
    }
}

async fn serve_conn(
    state: Arc<Mutex<BrokerState>>,
    socket: TcpStream,
    shutdown: CancellationToken,
) {
    let framed = Framed::new(socket, PacketCodec);
    let (mut sink, mut stream) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();

    let conn = {
        let mut state = state.lock().await;
        state.next_conn += 1;
        let conn = state.next_conn;
        state.conns.insert(
            conn,
            ConnInfo {
                tx,
                abilities: HashSet::new(),
                sleeping: false,
                exceptions: false,
            },
        );
        conn
    };

    // Writer half: drain the outbox until the connection is dropped
    let writer = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if sink.send(packet).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(packet)) => handle_packet(&state, conn, packet).await,
                _ => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    state.lock().await.conns.remove(&conn);
    writer.abort();
}

async fn handle_packet(state: &Arc<Mutex<BrokerState>>, conn: ConnId, packet: Packet) {
    let mut state = state.lock().await;
    let arg_text = |index: usize| -> String {
        packet
            .arg(index)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default()
    };

    match packet.kind {
        PacketType::CanDo | PacketType::CanDoTimeout => {
            let function = arg_text(0);
            if let Some(info) = state.conns.get_mut(&conn) {
                info.abilities.insert(function);
            }
        }
        PacketType::CantDo => {
            let function = arg_text(0);
            if let Some(info) = state.conns.get_mut(&conn) {
                info.abilities.remove(&function);
            }
        }
        PacketType::SetClientId => {
            // Identity is accepted and ignored; nothing asserts on it
        }
        PacketType::OptionReq => {
            let option = arg_text(0);
            if option == "exceptions" {
                if let Some(info) = state.conns.get_mut(&conn) {
                    info.exceptions = true;
                }
            }
            state.send_to(
                conn,
                Packet::response(
                    PacketType::OptionRes,
                    [Bytes::from(option.into_bytes())],
                ),
            );
        }
        PacketType::EchoReq => {
            let payload = packet.arg(0).cloned().unwrap_or_default();
            state.send_to(conn, Packet::response(PacketType::EchoRes, [payload]));
        }
        PacketType::SubmitJob
        | PacketType::SubmitJobBg
        | PacketType::SubmitJobHigh
        | PacketType::SubmitJobHighBg
        | PacketType::SubmitJobLow
        | PacketType::SubmitJobLowBg => {
            let background = matches!(
                packet.kind,
                PacketType::SubmitJobBg
                    | PacketType::SubmitJobHighBg
                    | PacketType::SubmitJobLowBg
            );
            let rank = match packet.kind {
                PacketType::SubmitJobHigh | PacketType::SubmitJobHighBg => 0,
                PacketType::SubmitJobLow | PacketType::SubmitJobLowBg => 2,
                _ => 1,
            };
            let function = arg_text(0);
            let unique = arg_text(1);
            let payload = packet.arg(2).cloned().unwrap_or_default();

            let handle = state.alloc_handle();
            state.send_to(
                conn,
                Packet::response(
                    PacketType::JobCreated,
                    [Bytes::from(handle.clone().into_bytes())],
                ),
            );
            state.jobs.insert(
                handle.clone(),
                JobRecord {
                    function: function.clone(),
                    client: (!background).then_some(conn),
                    running: false,
                    numerator: 0,
                    denominator: 0,
                },
            );
            state
                .queues
                .entry(function.clone())
                .or_default()[rank]
                .push_back(QueuedJob {
                    handle,
                    unique,
                    payload,
                });
            state.wake_workers(&function);
        }
        PacketType::GrabJob | PacketType::GrabJobUniq => {
            match state.take_job(conn) {
                Some((function, job)) => {
                    if let Some(record) = state.jobs.get_mut(&job.handle) {
                        record.running = true;
                    }
                    let assign = if packet.kind == PacketType::GrabJobUniq {
                        Packet::response(
                            PacketType::JobAssignUniq,
                            [
                                Bytes::from(job.handle.into_bytes()),
                                Bytes::from(function.into_bytes()),
                                Bytes::from(job.unique.into_bytes()),
                                job.payload,
                            ],
                        )
                    } else {
                        Packet::response(
                            PacketType::JobAssign,
                            [
                                Bytes::from(job.handle.into_bytes()),
                                Bytes::from(function.into_bytes()),
                                job.payload,
                            ],
                        )
                    };
                    state.send_to(conn, assign);
                }
                None => {
                    state.send_to(
                        conn,
                        Packet::response(PacketType::NoJob, std::iter::empty()),
                    );
                }
            }
        }
        PacketType::PreSleep => {
            // A job may have queued between NO_JOB and PRE_SLEEP; wake
            // immediately rather than stranding the worker
            if state.has_work_for(conn) {
                state.send_to(
                    conn,
                    Packet::response(PacketType::Noop, std::iter::empty()),
                );
            } else if let Some(info) = state.conns.get_mut(&conn) {
                info.sleeping = true;
            }
        }
        PacketType::GetStatus => {
            let handle = arg_text(0);
            let (known, running, numerator, denominator) = match state.jobs.get(&handle) {
                Some(record) => (true, record.running, record.numerator, record.denominator),
                None => (false, false, 0, 0),
            };
            let flag = |b: bool| Bytes::from_static(if b { b"1" } else { b"0" });
            state.send_to(
                conn,
                Packet::response(
                    PacketType::StatusRes,
                    [
                        Bytes::from(handle.into_bytes()),
                        flag(known),
                        flag(running),
                        Bytes::from(numerator.to_string()),
                        Bytes::from(denominator.to_string()),
                    ],
                ),
            );
        }
        PacketType::WorkData | PacketType::WorkWarning | PacketType::WorkStatus => {
            let handle = arg_text(0);
            if packet.kind == PacketType::WorkStatus {
                let parse = |index: usize| arg_text(index).parse().unwrap_or(0);
                if let Some(record) = state.jobs.get_mut(&handle) {
                    record.numerator = parse(1);
                    record.denominator = parse(2);
                }
            }
            if let Some(client) = state.jobs.get(&handle).and_then(|record| record.client) {
                state.send_to(client, Packet::response(packet.kind, packet.args.clone()));
            }
        }
        PacketType::WorkComplete | PacketType::WorkFail => {
            let handle = arg_text(0);
            if let Some(record) = state.jobs.remove(&handle) {
                if let Some(client) = record.client {
                    state.send_to(client, Packet::response(packet.kind, packet.args.clone()));
                }
            }
        }
        PacketType::WorkException => {
            let handle = arg_text(0);
            if let Some(record) = state.jobs.remove(&handle) {
                // Delivered only to clients that negotiated exceptions
                let negotiated = record
                    .client
                    .and_then(|client| state.conns.get(&client))
                    .is_some_and(|info| info.exceptions);
                if let (Some(client), true) = (record.client, negotiated) {
                    state.send_to(
                        client,
                        Packet::response(PacketType::WorkException, packet.args.clone()),
                    );
                }
            }
        }
        other => panic!("test server does not handle {other:?}"),
    }
}
