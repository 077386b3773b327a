//! Session façade over a child process speaking newline-delimited JSON-RPC 2.0.
//!
//! A single actor task owns both correlation tables, the id allocator and the
//! work item tickets. Everything else (stdin writer, stdout/stderr readers,
//! deadline timers) runs in its own task and reports back to the actor over a
//! channel, so table mutations never interleave.

use log::{debug, error, trace, warn};
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::classify::classify;
use super::error::{RpcError, RpcResult};
use super::id::{CorrelationId, IdAllocator};
use super::table::CorrelationTable;
use super::types::{Envelope, ErrorResponse, Notification, Request, Response};
use super::work::{Deadline, Phase, WorkItem, WorkSignal};
use crate::config::SessionConfig;
use crate::process::{ChildProcess, ExitReport};

/// Which correlation table an outbound message lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Notifications and requests we originated
    Client,
    /// Results and errors we sent in reply to the child's requests
    Server,
}

/// Everything a session reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Notify(Notification),
    Request(Request),
    Result(Response),
    Error(ErrorResponse),
    /// A stdout line that is not valid JSON-RPC 2.0
    ParseError { line: String, reason: String },
    /// A reply whose id has no open entry (late, duplicate or forged)
    Unexpected(Envelope),
    /// A stderr line, verbatim
    Diagnostic { name: String, line: String },
    ConsumeTimeout { lane: Lane, id: CorrelationId },
    ProduceTimeout { id: CorrelationId },
    Exit(ExitReport),
}

/// Receiving end of a session's events.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Snapshot of the open correlation entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pending {
    pub client: Vec<CorrelationId>,
    pub server: Vec<CorrelationId>,
}

impl Pending {
    pub fn is_empty(&self) -> bool {
        self.client.is_empty() && self.server.is_empty()
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
}

enum Outbound {
    Notify {
        consume: Duration,
        method: String,
        params: Option<Value>,
    },
    Request {
        consume: Option<Duration>,
        produce: Option<Duration>,
        method: String,
        params: Option<Value>,
    },
    Result {
        consume: Duration,
        id: CorrelationId,
        value: Value,
    },
    Error {
        consume: Duration,
        id: CorrelationId,
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

enum Control {
    Send {
        outbound: Outbound,
        reply: oneshot::Sender<RpcResult<CorrelationId>>,
    },
    Kill {
        signal: Option<i32>,
        reply: oneshot::Sender<RpcResult<()>>,
    },
    Pending {
        reply: oneshot::Sender<Pending>,
    },
}

enum Internal {
    Written {
        lane: Lane,
        id: CorrelationId,
        ticket: u64,
    },
    Expired {
        lane: Lane,
        phase: Phase,
        id: CorrelationId,
        ticket: u64,
    },
    Stdout(String),
    StdoutClosed,
    Stderr(String),
}

struct WriteJob {
    lane: Lane,
    id: CorrelationId,
    ticket: u64,
    line: String,
}

/// Handle to a running session. Cheap to clone; the session closes (and the
/// child is killed) once every handle is dropped.
#[derive(Clone)]
pub struct RpcChild {
    name: Arc<str>,
    control_tx: mpsc::UnboundedSender<Control>,
    counters: Arc<Counters>,
}

impl RpcChild {
    /// Spawn `command` with piped stdio and start a session on it.
    pub fn spawn(mut command: Command, config: SessionConfig) -> RpcResult<(Self, SessionEvents)> {
        debug!("[{}] Spawning process: {:?}", config.name, command);

        let child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        Self::from_child(child, config)
    }

    /// Start a session on an already spawned child with piped stdio.
    pub fn from_child(mut child: Child, config: SessionConfig) -> RpcResult<(Self, SessionEvents)> {
        let stdin = child.stdin.take().ok_or_else(|| {
            RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Child process stdin not available",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Child process stdout not available",
            ))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Child process stderr not available",
            ))
        })?;

        Ok(Self::with_transport(stdin, stdout, stderr, child, config))
    }

    /// Start a session over arbitrary streams and a process handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_transport<W, R, E, P>(
        stdin: W,
        stdout: R,
        stderr: E,
        process: P,
        config: SessionConfig,
    ) -> (Self, SessionEvents)
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
        P: ChildProcess,
    {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let name: Arc<str> = Arc::from(config.name.as_str());

        let io_tasks = vec![
            tokio::spawn(stdin_handler(name.clone(), stdin, write_rx, internal_tx.clone())),
            tokio::spawn(stdout_handler(name.clone(), stdout, internal_tx.clone())),
            tokio::spawn(stderr_handler(name.clone(), stderr, internal_tx.clone())),
        ];

        let session = Session {
            config,
            process,
            ids: IdAllocator::new(),
            client: CorrelationTable::new(),
            server: CorrelationTable::new(),
            next_ticket: 0,
            counters: counters.clone(),
            control_rx,
            internal_rx,
            internal_tx,
            write_tx: Some(write_tx),
            events_tx,
            io_tasks,
            detached: false,
            exit: None,
            stdout_closed: false,
        };
        tokio::spawn(session.run());

        (
            Self {
                name,
                control_tx,
                counters,
            },
            events_rx,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a notification. The returned id is never written to the wire.
    pub async fn notify(
        &self,
        consume: Duration,
        method: &str,
        params: Option<Value>,
    ) -> RpcResult<CorrelationId> {
        self.send(Outbound::Notify {
            consume,
            method: method.to_string(),
            params,
        })
        .await
    }

    /// Send a request. At least one of `consume` and `produce` is required.
    pub async fn request(
        &self,
        consume: Option<Duration>,
        produce: Option<Duration>,
        method: &str,
        params: Option<Value>,
    ) -> RpcResult<CorrelationId> {
        self.send(Outbound::Request {
            consume,
            produce,
            method: method.to_string(),
            params,
        })
        .await
    }

    /// Answer the child's request `id` with a result.
    pub async fn result(
        &self,
        consume: Duration,
        id: CorrelationId,
        value: Value,
    ) -> RpcResult<CorrelationId> {
        self.send(Outbound::Result { consume, id, value }).await
    }

    /// Answer the child's request `id` with an error.
    pub async fn error(
        &self,
        consume: Duration,
        id: CorrelationId,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> RpcResult<CorrelationId> {
        self.send(Outbound::Error {
            consume,
            id,
            code,
            message: message.into(),
            data,
        })
        .await
    }

    /// Send `signal` to the child, or force it down when `None`. Its exit
    /// is reported through the `Exit` event.
    pub async fn kill(&self, signal: Option<i32>) -> RpcResult<()> {
        let (reply, response) = oneshot::channel();
        self.control(Control::Kill { signal, reply })?;
        response.await.map_err(|_| RpcError::ProcessTerminated)?
    }

    /// Open correlation entries, client and server side.
    pub async fn pending(&self) -> RpcResult<Pending> {
        let (reply, response) = oneshot::channel();
        self.control(Control::Pending { reply })?;
        response.await.map_err(|_| RpcError::ProcessTerminated)
    }

    /// Envelopes whose write was acknowledged.
    pub fn sent(&self) -> u64 {
        self.counters.sent.load(Ordering::SeqCst)
    }

    /// Lines read from the child's stdout.
    pub fn received(&self) -> u64 {
        self.counters.received.load(Ordering::SeqCst)
    }

    async fn send(&self, outbound: Outbound) -> RpcResult<CorrelationId> {
        let (reply, response) = oneshot::channel();
        self.control(Control::Send { outbound, reply })?;
        response.await.map_err(|_| RpcError::ProcessTerminated)?
    }

    fn control(&self, control: Control) -> RpcResult<()> {
        self.control_tx
            .send(control)
            .map_err(|_| RpcError::ProcessTerminated)
    }
}

impl std::fmt::Debug for RpcChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChild")
            .field("name", &self.name)
            .field("sent", &self.sent())
            .field("received", &self.received())
            .finish()
    }
}

enum Step {
    Internal(Internal),
    Control(Option<Control>),
    Exited(std::io::Result<ExitReport>),
    GraceElapsed,
}

struct Session<P: ChildProcess> {
    config: SessionConfig,
    process: P,
    ids: IdAllocator,
    client: CorrelationTable,
    server: CorrelationTable,
    next_ticket: u64,
    counters: Arc<Counters>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    write_tx: Option<mpsc::UnboundedSender<WriteJob>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    io_tasks: Vec<JoinHandle<()>>,
    detached: bool,
    exit: Option<(ExitReport, Instant)>,
    stdout_closed: bool,
}

impl<P: ChildProcess> Session<P> {
    async fn run(mut self) {
        debug!("[{}] Session started", self.config.name);

        loop {
            let exited = self.exit.is_some();
            let grace_deadline = self.exit.map_or_else(Instant::now, |(_, deadline)| deadline);

            let step = tokio::select! {
                biased;
                Some(message) = self.internal_rx.recv() => Step::Internal(message),
                control = self.control_rx.recv(), if !self.detached => Step::Control(control),
                status = self.process.wait(), if !exited => Step::Exited(status),
                _ = tokio::time::sleep_until(grace_deadline), if exited => Step::GraceElapsed,
            };

            match step {
                Step::Internal(message) => self.on_internal(message),
                Step::Control(Some(control)) => self.on_control(control),
                Step::Control(None) => {
                    debug!("[{}] All handles dropped, killing child", self.config.name);
                    self.detached = true;
                    if let Err(e) = self.process.kill(None) {
                        warn!("[{}] Failed to kill child: {}", self.config.name, e);
                    }
                }
                Step::Exited(status) => {
                    let report = status.unwrap_or_else(|e| {
                        error!("[{}] Failed to wait for child: {}", self.config.name, e);
                        ExitReport::default()
                    });
                    debug!("[{}] Child exited: {}", self.config.name, report);
                    // stop accepting writes right away; stdout may still deliver replies
                    self.write_tx = None;
                    self.exit = Some((report, Instant::now() + self.config.exit_grace));
                }
                Step::GraceElapsed => {
                    debug!("[{}] Stdout still open after exit grace", self.config.name);
                }
            }

            if let Some((report, deadline)) = self.exit {
                if self.stdout_closed || Instant::now() >= deadline {
                    self.close(report);
                    break;
                }
            }
        }

        debug!("[{}] Session stopped", self.config.name);
    }

    fn on_control(&mut self, control: Control) {
        match control {
            Control::Send { outbound, reply } => {
                let result = self.send(outbound);
                if let Err(e) = &result {
                    debug!("[{}] Send rejected: {}", self.config.name, e);
                }
                let _ = reply.send(result);
            }
            Control::Kill { signal, reply } => {
                debug!("[{}] Kill requested ({:?})", self.config.name, signal);
                let result = match signal {
                    _ if self.exit.is_some() => Err(RpcError::ProcessTerminated),
                    Some(signal) if signal <= 0 => Err(RpcError::InvalidArgument(format!(
                        "\"signal\" must be positive, got {}",
                        signal
                    ))),
                    _ => self.process.kill(signal).map_err(RpcError::from),
                };
                let _ = reply.send(result);
            }
            Control::Pending { reply } => {
                let _ = reply.send(Pending {
                    client: self.client.ids(),
                    server: self.server.ids(),
                });
            }
        }
    }

    fn send(&mut self, outbound: Outbound) -> RpcResult<CorrelationId> {
        if self.exit.is_some() || self.write_tx.is_none() {
            return Err(RpcError::ProcessTerminated);
        }

        let (lane, id, envelope, consume, produce) = match outbound {
            Outbound::Notify {
                consume,
                method,
                params,
            } => {
                self.config.check_timeout("consume", Some(consume))?;
                let envelope = Envelope::notify(method, params)?;
                (Lane::Client, self.ids.next(), envelope, Some(consume), None)
            }
            Outbound::Request {
                consume,
                produce,
                method,
                params,
            } => {
                self.config.check_timeout("consume", consume)?;
                self.config.check_timeout("produce", produce)?;
                if consume.is_none() && produce.is_none() {
                    return Err(RpcError::InvalidArgument(
                        "at least one of \"consume\" or \"produce\" must be present".to_string(),
                    ));
                }
                let id = self.ids.next();
                let envelope = Envelope::request(id, method, params)?;
                (Lane::Client, id, envelope, consume, produce)
            }
            Outbound::Result { consume, id, value } => {
                self.config.check_timeout("consume", Some(consume))?;
                (Lane::Server, id, Envelope::result(id, value), Some(consume), None)
            }
            Outbound::Error {
                consume,
                id,
                code,
                message,
                data,
            } => {
                self.config.check_timeout("consume", Some(consume))?;
                let envelope = Envelope::error(id, code, message, data);
                (Lane::Server, id, envelope, Some(consume), None)
            }
        };

        let line = envelope.to_line()?;

        if self.table(lane).contains(id) {
            error!(
                "[{}] Correlation id {} is already open in the {:?} table",
                self.config.name, id, lane
            );
            return Err(RpcError::DuplicateId(id));
        }

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let consume = consume.map(|after| self.arm(lane, Phase::Consume, id, ticket, after));
        let produce = produce.map(|after| self.arm(lane, Phase::Produce, id, ticket, after));
        let work = WorkItem::register(id, ticket, consume, produce)?;
        self.table_mut(lane).open(id, work)?;

        let job = WriteJob {
            lane,
            id,
            ticket,
            line,
        };
        let queued = self
            .write_tx
            .as_ref()
            .map_or(false, |write_tx| write_tx.send(job).is_ok());
        if !queued {
            self.table_mut(lane).close_and_get(id);
            return Err(RpcError::ProcessTerminated);
        }

        trace!(
            "[{}] Queued {} {} ({:?})",
            self.config.name,
            envelope.kind(),
            id,
            lane
        );
        Ok(id)
    }

    fn arm(
        &self,
        lane: Lane,
        phase: Phase,
        id: CorrelationId,
        ticket: u64,
        after: Duration,
    ) -> Box<dyn Deadline> {
        let internal_tx = self.internal_tx.clone();
        let deadline = Instant::now() + after;
        Box::new(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = internal_tx.send(Internal::Expired {
                lane,
                phase,
                id,
                ticket,
            });
        }))
    }

    fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Written { lane, id, ticket } => {
                self.counters.sent.fetch_add(1, Ordering::SeqCst);
                self.on_work(lane, id, ticket, WorkItem::on_write_acknowledged);
            }
            Internal::Expired {
                lane,
                phase,
                id,
                ticket,
            } => match phase {
                Phase::Consume => self.on_work(lane, id, ticket, WorkItem::on_consume_timeout),
                Phase::Produce => self.on_work(lane, id, ticket, WorkItem::on_produce_timeout),
            },
            Internal::Stdout(line) => self.on_stdout_line(line),
            Internal::StdoutClosed => {
                debug!("[{}] Stdout closed", self.config.name);
                self.stdout_closed = true;
            }
            Internal::Stderr(line) => self.emit(SessionEvent::Diagnostic {
                name: self.config.name.clone(),
                line,
            }),
        }
    }

    /// Drive the work item `(lane, id)` and act on the signals it produced.
    /// Messages for an item that already finished (or for an older item that
    /// used the same id) are dropped.
    fn on_work(
        &mut self,
        lane: Lane,
        id: CorrelationId,
        ticket: u64,
        transition: fn(&mut WorkItem) -> Vec<WorkSignal>,
    ) {
        let signals = match self.table_mut(lane).get_mut(id) {
            Some(work) if work.ticket() == ticket => Some(transition(work)),
            _ => None,
        };
        let Some(signals) = signals else {
            trace!("[{}] Stale event for {} ({:?})", self.config.name, id, lane);
            return;
        };

        for signal in signals {
            match signal {
                WorkSignal::Timeout(Phase::Consume) => {
                    warn!("[{}] Consume timeout for {} ({:?})", self.config.name, id, lane);
                    self.emit(SessionEvent::ConsumeTimeout { lane, id });
                }
                WorkSignal::Timeout(Phase::Produce) => {
                    warn!("[{}] Produce timeout for {}", self.config.name, id);
                    self.emit(SessionEvent::ProduceTimeout { id });
                }
                WorkSignal::Finish => {
                    self.table_mut(lane).close_and_get(id);
                }
            }
        }
    }

    fn on_stdout_line(&mut self, line: String) {
        self.counters.received.fetch_add(1, Ordering::SeqCst);
        trace!("[{}] Received: {}", self.config.name, line);

        if !line.starts_with('{') {
            self.parse_error(line, "Not a JSON object".to_string());
            return;
        }
        let mut message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                self.parse_error(line, e.to_string());
                return;
            }
        };
        let kind = match classify(&mut message, self.config.sanitize) {
            Ok(kind) => kind,
            Err(rejection) => {
                self.parse_error(line, rejection.to_string());
                return;
            }
        };
        let envelope = match Envelope::from_classified(kind, message) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.parse_error(line, e.to_string());
                return;
            }
        };

        match envelope {
            Envelope::Notify(notification) => self.emit(SessionEvent::Notify(notification)),
            Envelope::Request(request) => self.emit(SessionEvent::Request(request)),
            Envelope::Result(response) => {
                if self.reconcile(&response.id) {
                    self.emit(SessionEvent::Result(response));
                } else {
                    self.emit(SessionEvent::Unexpected(Envelope::Result(response)));
                }
            }
            Envelope::Error(response) => {
                if self.reconcile(&response.id) {
                    self.emit(SessionEvent::Error(response));
                } else {
                    self.emit(SessionEvent::Unexpected(Envelope::Error(response)));
                }
            }
        }
    }

    /// Close the client entry a reply refers to. False if nothing was open.
    fn reconcile(&mut self, id: &Value) -> bool {
        let work = CorrelationId::from_value(id).and_then(|id| self.client.close_and_get(id));
        match work {
            Some(mut work) => {
                work.finish();
                true
            }
            None => {
                debug!("[{}] Unexpected reply for id {}", self.config.name, id);
                false
            }
        }
    }

    fn parse_error(&self, line: String, reason: String) {
        debug!("[{}] Parse error ({}): {}", self.config.name, reason, line);
        self.emit(SessionEvent::ParseError { line, reason });
    }

    /// Finish every open work item, then report the exit.
    fn close(&mut self, report: ExitReport) {
        let drained: Vec<WorkItem> = self
            .client
            .drain_all()
            .into_iter()
            .chain(self.server.drain_all())
            .collect();
        debug!(
            "[{}] Draining {} open work items",
            self.config.name,
            drained.len()
        );
        for mut work in drained {
            work.finish();
        }

        self.write_tx = None;
        for task in &self.io_tasks {
            task.abort();
        }
        self.emit(SessionEvent::Exit(report));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn table(&self, lane: Lane) -> &CorrelationTable {
        match lane {
            Lane::Client => &self.client,
            Lane::Server => &self.server,
        }
    }

    fn table_mut(&mut self, lane: Lane) -> &mut CorrelationTable {
        match lane {
            Lane::Client => &mut self.client,
            Lane::Server => &mut self.server,
        }
    }
}

/// Handle stdin - write queued lines and acknowledge each one
async fn stdin_handler<W>(
    name: Arc<str>,
    mut stdin: W,
    mut write_rx: mpsc::UnboundedReceiver<WriteJob>,
    internal_tx: mpsc::UnboundedSender<Internal>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    debug!("[{}] Starting stdin handler", name);

    while let Some(job) = write_rx.recv().await {
        let written = async {
            stdin.write_all(job.line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            error!("[{}] Failed to write {}: {}", name, job.id, e);
            break;
        }
        let _ = internal_tx.send(Internal::Written {
            lane: job.lane,
            id: job.id,
            ticket: job.ticket,
        });
    }

    debug!("[{}] Stdin handler stopped", name);
}

/// Handle stdout - forward each line to the session
async fn stdout_handler<R>(name: Arc<str>, stdout: R, internal_tx: mpsc::UnboundedSender<Internal>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    debug!("[{}] Starting stdout handler", name);

    forward_lines(&name, stdout, |line| internal_tx.send(Internal::Stdout(line)).is_ok()).await;
    let _ = internal_tx.send(Internal::StdoutClosed);

    debug!("[{}] Stdout handler stopped", name);
}

/// Handle stderr - forward each line as a diagnostic
async fn stderr_handler<E>(name: Arc<str>, stderr: E, internal_tx: mpsc::UnboundedSender<Internal>)
where
    E: AsyncRead + Unpin + Send + 'static,
{
    debug!("[{}] Starting stderr handler", name);

    forward_lines(&name, stderr, |line| internal_tx.send(Internal::Stderr(line)).is_ok()).await;

    debug!("[{}] Stderr handler stopped", name);
}

/// Split a byte stream into lines until EOF, read error, or `forward` refusing.
/// Invalid UTF-8 is replaced rather than ending the stream.
async fn forward_lines<S, F>(name: &str, stream: S, mut forward: F)
where
    S: AsyncRead + Unpin,
    F: FnMut(String) -> bool,
{
    let mut reader = BufReader::new(stream);
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                error!("[{}] Error reading line: {}", name, e);
                break;
            }
        }

        if buffer.last() == Some(&b'\n') {
            buffer.pop();
        }
        if buffer.last() == Some(&b'\r') {
            buffer.pop();
        }
        if !forward(String::from_utf8_lossy(&buffer).into_owned()) {
            break;
        }
    }
}
