//! Child process supervision.
//!
//! Owns the peer process. The process itself lives in a small watcher task
//! that reports the exit code once and performs the forced kill when asked
//! to. Stdin lives in a writer task fed through a channel, so a peer that
//! stops reading can never stall whoever submits writes.
//!
//! # Process Cleanup Safety
//! The `Child` is spawned with `kill_on_drop`, and dropping the supervisor
//! drops the kill trigger, which the watcher treats as a kill request. A
//! peer can therefore never outlive the client that spawned it.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::rpc::framing::write_line;
use crate::rpc::registry::PendingCalls;
use crate::rpc::RpcError;

/// Lifecycle of the peer process. There is no transition out of `Exited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    /// `code` is `None` when the process was killed by a signal or never ran.
    Exited { code: Option<i32> },
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running)
    }

    pub fn is_exited(&self) -> bool {
        matches!(self, ProcessState::Exited { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessState::Exited { code } => *code,
            _ => None,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::NotStarted => write!(f, "not started"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited { code: Some(code) } => write!(f, "exited ({})", code),
            ProcessState::Exited { code: None } => write!(f, "exited (signal)"),
        }
    }
}

/// Receives the outcome of one submitted write.
pub type WriteCompletion = oneshot::Sender<Result<(), RpcError>>;

/// One encoded line queued for the writer task.
#[derive(Debug)]
struct PendingWrite {
    line: String,
    done: WriteCompletion,
}

/// Read ends of the peer's streams plus its exit notification.
pub struct ChildStreams {
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    /// Fires once with the exit code when the process is gone.
    pub exit: oneshot::Receiver<Option<i32>>,
}

/// Supervisor for a single peer process.
#[derive(Debug)]
pub struct ProcessSupervisor {
    state: ProcessState,
    writes: Option<mpsc::UnboundedSender<PendingWrite>>,
    /// Dropping this aborts an in-progress write and closes stdin.
    close_stdin: Option<oneshot::Sender<()>>,
    kill: Option<oneshot::Sender<()>>,
    pid: Option<u32>,
    terminating: bool,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            state: ProcessState::NotStarted,
            writes: None,
            close_stdin: None,
            kill: None,
            pid: None,
            terminating: false,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether a write would currently be attempted.
    pub fn accepts_writes(&self) -> bool {
        self.state.is_running() && !self.terminating && self.writes.is_some()
    }

    /// Launch the peer with all three streams piped.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `RpcError::Spawn` if the executable cannot be launched. The supervisor
    /// is then `Exited` for good; there is no retry.
    pub fn spawn(&mut self, config: &ClientConfig) -> Result<ChildStreams, RpcError> {
        if self.state != ProcessState::NotStarted {
            return Err(RpcError::Spawn {
                command: config.command.clone(),
                source: std::io::Error::other(format!("supervisor already {}", self.state)),
            });
        }
        self.state = ProcessState::Starting;
        info!("Spawning peer: {} {}", config.command, config.args.join(" "));

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent a console window from appearing for the peer
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!("Failed to spawn {}: {}", config.command, source);
                self.state = ProcessState::Exited { code: None };
                return Err(RpcError::Spawn {
                    command: config.command.clone(),
                    source,
                });
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            self.state = ProcessState::Exited { code: None };
            return Err(RpcError::Spawn {
                command: config.command.clone(),
                source: std::io::Error::other("failed to capture peer stdio"),
            });
        };

        self.pid = child.id();
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        self.writes = Some(writes_tx);
        self.close_stdin = Some(close_tx);
        tokio::spawn(pump_stdin(stdin, writes_rx, close_rx));
        self.state = ProcessState::Running;
        debug!("Peer running (pid {:?})", self.pid);

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        self.kill = Some(kill_tx);
        tokio::spawn(watch_exit(child, kill_rx, exit_tx));

        Ok(ChildStreams {
            stdout,
            stderr,
            exit: exit_rx,
        })
    }

    /// Queue one encoded line for the peer's stdin. Never blocks.
    ///
    /// `done` receives the outcome once the line is flushed:
    /// `RpcError::WriteAfterExit` if the process has exited or termination
    /// began before the line went out, `RpcError::Write` if the pipe fails.
    pub fn write(&mut self, line: String, done: WriteCompletion) {
        let writes = match &self.writes {
            Some(writes) if self.state.is_running() && !self.terminating => writes,
            _ => {
                let _ = done.send(Err(RpcError::WriteAfterExit));
                return;
            }
        };
        if let Err(mpsc::error::SendError(write)) = writes.send(PendingWrite { line, done }) {
            let _ = write.done.send(Err(RpcError::WriteAfterExit));
        }
    }

    /// Close stdin and schedule a forced kill after `grace`.
    ///
    /// Returns false (and does nothing) if the process already exited or
    /// termination was already requested.
    pub fn begin_termination(&mut self, grace: Duration) -> bool {
        if self.state.is_exited() || self.terminating {
            return false;
        }
        self.terminating = true;
        // Closing stdin is the orderly shutdown signal.
        self.close_writer();
        info!("Terminating peer (grace {}ms)", grace.as_millis());

        if let Some(kill) = self.kill.take() {
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if kill.send(()).is_ok() {
                    debug!("Grace period elapsed; kill requested");
                }
            });
        }
        true
    }

    /// Record the exit and reject everything still pending.
    ///
    /// Returns false if the process was already `Exited`.
    pub fn mark_exited(&mut self, code: Option<i32>, pending: &mut PendingCalls) -> bool {
        if self.state.is_exited() {
            return false;
        }
        self.state = ProcessState::Exited { code };
        self.close_writer();
        self.kill = None;

        let drained = pending.drain_all(|| RpcError::ProcessExited { code });
        info!(
            "Peer process exited with code {:?}; rejected {} pending call(s)",
            code, drained
        );
        true
    }

    fn close_writer(&mut self) {
        self.writes = None;
        self.close_stdin = None;
    }
}

/// Write queued lines in order until closed. Whatever is queued or in flight
/// at close time fails with `RpcError::WriteAfterExit`.
async fn pump_stdin(
    mut stdin: ChildStdin,
    mut writes: mpsc::UnboundedReceiver<PendingWrite>,
    mut close: oneshot::Receiver<()>,
) {
    loop {
        let write = tokio::select! {
            biased;
            _ = &mut close => break,
            write = writes.recv() => match write {
                Some(write) => write,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = &mut close => {
                debug!("Abandoning a write the peer never read");
                let _ = write.done.send(Err(RpcError::WriteAfterExit));
                break;
            }
            result = write_line(&mut stdin, &write.line) => {
                let result = result.map_err(|e| {
                    warn!("Failed to write to peer stdin: {}", e);
                    RpcError::Write(e)
                });
                let _ = write.done.send(result);
            }
        }
    }

    drop(stdin);
    writes.close();
    while let Ok(write) = writes.try_recv() {
        let _ = write.done.send(Err(RpcError::WriteAfterExit));
    }
}

/// Wait for the child to exit, killing it if `kill` fires (or is dropped).
async fn watch_exit(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit: oneshot::Sender<Option<i32>>,
) {
    let natural = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill => None,
    };

    let status = match natural {
        Some(status) => status,
        None => {
            warn!("Peer didn't exit gracefully, killing");
            if let Err(e) = child.kill().await {
                warn!("Failed to kill peer: {}", e);
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            error!("Failed to wait for peer: {}", e);
            None
        }
    };
    let _ = exit.send(code);
}
