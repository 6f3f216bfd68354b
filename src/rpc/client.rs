//! `RpcClient`: correlates JSON-RPC calls with responses from a child process.
//!
//! The client itself is a thin handle. All state lives in a `Reactor` task
//! that serializes the three event sources (stdout chunks, stderr chunks,
//! process exit) with caller commands.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ReadinessStream};
use crate::process::{ProcessState, ProcessSupervisor, WriteCompletion};
use crate::rpc::classify::{classify, Message, PeerMessage};
use crate::rpc::error::RpcError;
use crate::rpc::framing::{encode_line, LineBuffer};
use crate::rpc::protocol::{JsonRpcNotification, JsonRpcRequest};
use crate::rpc::readiness::{ReadinessGate, ReadySignal};
use crate::rpc::registry::{Completion, PendingCalls};

/// Size of a single read from the peer's streams.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Bounded channel capacities (backpressure on the reader tasks and callers).
const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 64;
const PEER_MESSAGE_CAPACITY: usize = 64;

/// How long to keep reading the streams after the process exit is observed.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Prefix of every request identifier; the suffix is a per-client counter.
const REQUEST_ID_PREFIX: &str = "req-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Output,
    Diagnostic,
}

/// Inputs produced by the reader and watcher tasks.
#[derive(Debug)]
enum Event {
    Chunk(Stream, Vec<u8>),
    Closed(Stream),
    Exited(Option<i32>),
    DrainDeadline,
    /// The request line for a pending call never reached the peer.
    WriteFailed { id: String, error: RpcError },
}

/// Inputs produced by `RpcClient` handles.
#[derive(Debug)]
enum Command {
    Call {
        id: String,
        line: String,
        reply: Completion,
    },
    Notify {
        line: String,
        reply: WriteCompletion,
    },
    /// The caller stopped waiting; drop the entry so a late response is discarded.
    Forget { id: String },
    Terminate { grace: Duration },
}

/// Client for a tool server speaking line-delimited JSON-RPC over stdio.
///
/// # Lifecycle
///
/// - `spawn()` - Launch the peer (no readiness wait)
/// - `start()` - Launch and wait for the readiness marker
/// - `invoke()` - Send a request and wait for its response
/// - `terminate()` - Close stdin, wait out the grace period, then kill
///
/// Dropping the client without `terminate()` performs the same shutdown in
/// the background.
///
/// # Example
///
/// ```ignore
/// use stdio_rpc::{ClientConfig, RpcClient};
/// use serde_json::json;
///
/// let client = RpcClient::start(&ClientConfig::default()).await?;
/// let short = client
///     .invoke("get-shortened-url", json!({"url": "https://www.example.com"}))
///     .await?;
/// ```
pub struct RpcClient {
    commands: mpsc::Sender<Command>,
    /// Monotonically increasing request ID counter.
    next_id: AtomicU64,
    ready: ReadySignal,
    state: watch::Receiver<ProcessState>,
    peer_messages: Option<mpsc::Receiver<PeerMessage>>,
    pid: Option<u32>,
    call_timeout: Option<Duration>,
    readiness_timeout: Duration,
    shutdown_grace: Duration,
}

impl RpcClient {
    /// Launch the peer and start the event loop, without waiting for readiness.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `RpcError::Spawn` if the command cannot be launched.
    pub fn spawn(config: &ClientConfig) -> Result<Self, RpcError> {
        let mut supervisor = ProcessSupervisor::new();
        let streams = supervisor.spawn(config)?;
        let pid = supervisor.pid();

        let gate = ReadinessGate::new(config.readiness_marker.as_deref());
        let ready = gate.subscribe();

        let (state_tx, state_rx) = watch::channel(supervisor.state());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (peer_tx, peer_rx) = mpsc::channel(PEER_MESSAGE_CAPACITY);

        spawn_reader(streams.stdout, Stream::Output, events_tx.clone());
        spawn_reader(streams.stderr, Stream::Diagnostic, events_tx.clone());

        let exit_events = events_tx.clone();
        let exit = streams.exit;
        tokio::spawn(async move {
            let code = exit.await.unwrap_or(None);
            let _ = exit_events.send(Event::Exited(code)).await;
        });

        let reactor = Reactor {
            supervisor,
            pending: PendingCalls::new(),
            gate,
            readiness_stream: config.readiness_stream,
            output: LineBuffer::new(),
            diagnostic: LineBuffer::new(),
            state: state_tx,
            peer_messages: peer_tx,
            events: events_tx,
            exit_code: None,
            output_open: true,
            diagnostic_open: true,
            shutdown_grace: config.shutdown_grace(),
        };
        tokio::spawn(reactor.run(events_rx, commands_rx));

        Ok(Self {
            commands: commands_tx,
            next_id: AtomicU64::new(1),
            ready,
            state: state_rx,
            peer_messages: Some(peer_rx),
            pid,
            call_timeout: config.call_timeout(),
            readiness_timeout: config.readiness_timeout(),
            shutdown_grace: config.shutdown_grace(),
        })
    }

    /// Launch the peer and wait until it signals readiness.
    ///
    /// # Errors
    ///
    /// `RpcError::Spawn`, `RpcError::ReadinessTimeout`, or
    /// `RpcError::ProcessExited` if the peer died before becoming ready. On
    /// readiness failure the peer is terminated before returning.
    pub async fn start(config: &ClientConfig) -> Result<Self, RpcError> {
        let client = Self::spawn(config)?;
        if let Err(e) = client.wait_ready().await {
            warn!("Peer failed to become ready: {}", e);
            let _ = client.terminate().await;
            return Err(e);
        }
        Ok(client)
    }

    /// Wait for the readiness marker, bounded by the configured timeout.
    pub async fn wait_ready(&self) -> Result<(), RpcError> {
        let mut ready = self.ready.clone();
        let mut state = self.state.clone();

        tokio::select! {
            biased;
            result = ready.wait(self.readiness_timeout) => result,
            exited = state.wait_for(ProcessState::is_exited) => match exited {
                Ok(state) => Err(RpcError::ProcessExited { code: state.exit_code() }),
                Err(_) => Err(RpcError::ClientClosed),
            },
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }

    /// Current state of the peer process.
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Messages the peer sent on its own initiative. Can be taken once;
    /// until then (or once the receiver is full) they are logged and dropped.
    pub fn peer_messages(&mut self) -> Option<mpsc::Receiver<PeerMessage>> {
        self.peer_messages.take()
    }

    /// Call `method` with the configured default timeout.
    pub async fn invoke(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        self.invoke_with_timeout(method, params, self.call_timeout)
            .await
    }

    /// Call `method` and wait for its result.
    ///
    /// # Errors
    ///
    /// - `RpcError::NotReady` before the readiness marker was seen
    /// - `RpcError::WriteAfterExit` / `RpcError::Write` if the request could not be sent
    /// - `RpcError::CallTimeout` if `timeout` elapsed first
    /// - `RpcError::Remote` with the peer's error payload, verbatim
    /// - `RpcError::ProcessExited` / `RpcError::Terminated` if the peer went away
    pub async fn invoke_with_timeout(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, RpcError> {
        if !self.ready.is_ready() {
            return Err(RpcError::NotReady);
        }

        let id = self.next_id();
        let request = JsonRpcRequest::new(id.clone(), method, params);
        let line = encode_line(&request)?;
        debug!("Sending {} ({})", id, method);

        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Call {
                id: id.clone(),
                line,
                reply,
            })
            .await
            .map_err(|_| RpcError::ClientClosed)?;

        let mut guard = ForgetOnDrop::new(&self.commands, id.clone());

        let Some(limit) = timeout else {
            let result = outcome.await;
            guard.disarm();
            return result.unwrap_or_else(|_| Err(RpcError::ClientClosed));
        };

        match tokio::time::timeout(limit, outcome).await {
            Ok(result) => {
                guard.disarm();
                result.unwrap_or_else(|_| Err(RpcError::ClientClosed))
            }
            Err(_) => {
                warn!("Call {} ({}) timed out after {:?}", id, method, limit);
                let _ = self.commands.send(Command::Forget { id }).await;
                guard.disarm();
                Err(RpcError::CallTimeout {
                    method: method.to_string(),
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Send a notification (no identifier, no response).
    pub async fn notify(&self, method: &str, params: serde_json::Value) -> Result<(), RpcError> {
        if !self.ready.is_ready() {
            return Err(RpcError::NotReady);
        }

        let line = encode_line(&JsonRpcNotification::new(method, params))?;
        let (reply, written) = oneshot::channel();
        self.commands
            .send(Command::Notify { line, reply })
            .await
            .map_err(|_| RpcError::ClientClosed)?;
        written.await.unwrap_or(Err(RpcError::ClientClosed))
    }

    /// Terminate the peer with the configured grace period.
    pub async fn terminate(&self) -> Result<Option<i32>, RpcError> {
        self.terminate_with_grace(self.shutdown_grace).await
    }

    /// Close the peer's stdin, wait up to `grace`, then kill it.
    ///
    /// Every pending call is rejected with `RpcError::Terminated` before any
    /// further write can happen. Idempotent; returns the exit code.
    pub async fn terminate_with_grace(&self, grace: Duration) -> Result<Option<i32>, RpcError> {
        let state = self.state();
        if state.is_exited() {
            return Ok(state.exit_code());
        }
        self.commands
            .send(Command::Terminate { grace })
            .await
            .map_err(|_| RpcError::ClientClosed)?;
        self.wait_exit().await
    }

    /// Wait until the peer process has exited; returns its exit code.
    pub async fn wait_exit(&self) -> Result<Option<i32>, RpcError> {
        let mut state = self.state.clone();
        let exited = state
            .wait_for(ProcessState::is_exited)
            .await
            .map_err(|_| RpcError::ClientClosed)?;
        Ok(exited.exit_code())
    }

    /// Generate the next request ID.
    fn next_id(&self) -> String {
        format!(
            "{}{}",
            REQUEST_ID_PREFIX,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        )
    }
}

/// Drops the pending entry of a call whose caller stopped waiting, e.g.
/// because the `invoke` future was dropped.
struct ForgetOnDrop<'a> {
    commands: &'a mpsc::Sender<Command>,
    id: Option<String>,
}

impl<'a> ForgetOnDrop<'a> {
    fn new(commands: &'a mpsc::Sender<Command>, id: String) -> Self {
        Self {
            commands,
            id: Some(id),
        }
    }

    /// The call settled (or was already forgotten); nothing to clean up.
    fn disarm(&mut self) {
        self.id = None;
    }
}

impl Drop for ForgetOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            debug!("Caller for {} stopped waiting", id);
            if let Err(e) = self.commands.try_send(Command::Forget { id }) {
                warn!("Could not forget abandoned call: {}", e);
            }
        }
    }
}

/// Forward raw chunks from one of the peer's streams to the reactor.
fn spawn_reader<R>(mut reader: R, stream: Stream, events: mpsc::Sender<Event>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if events.send(Event::Chunk(stream, buf[..n].to_vec())).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Failed to read peer {:?} stream: {}", stream, e);
                    break;
                }
            }
        }
        let _ = events.send(Event::Closed(stream)).await;
    });
}

/// Sole owner of all mutable client state.
struct Reactor {
    supervisor: ProcessSupervisor,
    pending: PendingCalls,
    gate: ReadinessGate,
    readiness_stream: ReadinessStream,
    output: LineBuffer,
    diagnostic: LineBuffer,
    state: watch::Sender<ProcessState>,
    peer_messages: mpsc::Sender<PeerMessage>,
    /// Kept to schedule the drain deadline.
    events: mpsc::Sender<Event>,
    /// Set once the OS reports the exit; `Exited` waits for the streams too.
    exit_code: Option<Option<i32>>,
    output_open: bool,
    diagnostic_open: bool,
    shutdown_grace: Duration,
}

impl Reactor {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<Event>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event),
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All client handles dropped; shutting peer down");
                        commands_open = false;
                        self.begin_termination(self.shutdown_grace);
                    }
                },
                else => break,
            }

            if !commands_open && self.supervisor.state().is_exited() {
                break;
            }
        }
        debug!("Reactor stopped");
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Chunk(Stream::Output, bytes) => {
                if self.readiness_stream == ReadinessStream::Output {
                    self.gate.observe(&String::from_utf8_lossy(&bytes));
                }
                for line in self.output.feed(&bytes) {
                    self.handle_line(line);
                }
            }
            Event::Chunk(Stream::Diagnostic, bytes) => {
                if self.readiness_stream == ReadinessStream::Diagnostic {
                    self.gate.observe(&String::from_utf8_lossy(&bytes));
                }
                for line in self.diagnostic.feed(&bytes) {
                    info!("[peer] {}", line);
                }
            }
            Event::Closed(Stream::Output) => {
                debug!("Peer stdout closed");
                self.output_open = false;
                if let Some(line) = self.output.take_remainder() {
                    self.handle_line(line);
                }
                self.try_finish_exit();
            }
            Event::Closed(Stream::Diagnostic) => {
                debug!("Peer stderr closed");
                self.diagnostic_open = false;
                if let Some(line) = self.diagnostic.take_remainder() {
                    info!("[peer] {}", line);
                }
                self.try_finish_exit();
            }
            Event::Exited(code) => {
                debug!("Peer process reported exit code {:?}", code);
                self.exit_code = Some(code);
                if self.output_open || self.diagnostic_open {
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(STREAM_DRAIN_TIMEOUT).await;
                        let _ = events.send(Event::DrainDeadline).await;
                    });
                }
                self.try_finish_exit();
            }
            Event::WriteFailed { id, error } => {
                if self.pending.contains(&id) {
                    self.pending.reject(&id, error);
                } else {
                    debug!("Write for {} failed after the call settled: {}", id, error);
                }
            }
            Event::DrainDeadline => {
                if self.output_open || self.diagnostic_open {
                    warn!("Peer streams still open after exit; giving up on them");
                    self.output_open = false;
                    self.diagnostic_open = false;
                }
                self.try_finish_exit();
            }
        }
    }

    fn handle_line(&mut self, line: String) {
        let pending = &self.pending;
        match classify(&line, |id| pending.contains(id)) {
            Message::Response(response) => {
                debug!("Received response for {}", response.id);
                self.pending.settle(response);
            }
            Message::Peer(message) => {
                info!("Peer-initiated message: {}", message.method);
                if let Err(e) = self.peer_messages.try_send(message) {
                    debug!("Peer message dropped: {}", e);
                }
            }
            Message::Unstructured(text) => {
                debug!("Unstructured peer output: {}", text);
            }
        }
    }

    /// Never awaits: writes go through the supervisor's writer task, so a
    /// peer that stops reading stdin cannot stall events or termination.
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call { id, line, reply } => {
                if !self.supervisor.accepts_writes() {
                    let _ = reply.send(Err(RpcError::WriteAfterExit));
                    return;
                }
                if self.pending.register(id.clone(), reply).is_err() {
                    return;
                }
                let (done, written) = oneshot::channel();
                self.supervisor.write(line, done);

                let events = self.events.clone();
                tokio::spawn(async move {
                    if let Ok(Err(error)) = written.await {
                        let _ = events.send(Event::WriteFailed { id, error }).await;
                    }
                });
            }
            Command::Notify { line, reply } => self.supervisor.write(line, reply),
            Command::Forget { id } => {
                if self.pending.remove(&id) {
                    debug!("Dropped pending call {}", id);
                }
            }
            Command::Terminate { grace } => self.begin_termination(grace),
        }
    }

    fn begin_termination(&mut self, grace: Duration) {
        if self.supervisor.begin_termination(grace) {
            let aborted = self.pending.drain_all(|| RpcError::Terminated);
            if aborted > 0 {
                info!("Aborted {} pending call(s) for termination", aborted);
            }
        }
    }

    fn try_finish_exit(&mut self) {
        let Some(code) = self.exit_code else {
            return;
        };
        if self.output_open || self.diagnostic_open {
            return;
        }
        if self.supervisor.mark_exited(code, &mut self.pending) {
            self.state.send_replace(self.supervisor.state());
        }
    }
}
