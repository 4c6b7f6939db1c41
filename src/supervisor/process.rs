//! Guest process lifecycle: launch, output forwarding, exit monitoring and
//! bounded shutdown.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::env::{build_child_env, inherited_env};
use super::runtime::resolve_runtime;
use crate::config::{GlobalConfig, ProxyConfig, RuntimeConfig};
use crate::transport::ConnectionTarget;
use crate::{AppError, Result};

/// Extra time allowed for the exit monitor beyond the graceful window.
const KILL_SLACK: Duration = Duration::from_secs(2);

/// Time allowed for the output drain to finish after exit.
const DRAIN_JOIN: Duration = Duration::from_millis(500);

// ── State ────────────────────────────────────────────────────────────────────

/// Observable lifecycle of the supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// `start` has not launched anything yet.
    NotStarted,
    /// The child is running.
    Running {
        /// OS process id.
        pid: u32,
    },
    /// The child exited, on request or unexpectedly.
    Exited {
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Human-readable description.
        reason: String,
    },
}

// ── Configuration ────────────────────────────────────────────────────────────

/// Settings for launching the guest runtime.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Runtime location and arguments.
    pub runtime: RuntimeConfig,
    /// Working directory of the child.
    pub working_dir: PathBuf,
    /// Proxy overrides forwarded to the child.
    pub proxy: ProxyConfig,
    /// Graceful termination window before a forced kill.
    pub stop_grace: Duration,
    /// Bound on the runtime version probe.
    pub version_probe: Duration,
}

impl SupervisorConfig {
    /// Settings derived from the global configuration.
    #[must_use]
    pub fn from_global(config: &GlobalConfig) -> Self {
        Self {
            runtime: config.runtime.clone(),
            working_dir: config.workspace_root.clone(),
            proxy: config.proxy.clone(),
            stop_grace: config.timeouts.stop_grace(),
            version_probe: config.timeouts.version_probe(),
        }
    }
}

// ── Supervisor ───────────────────────────────────────────────────────────────

struct RunningChild {
    pid: u32,
    stop: CancellationToken,
    monitor: JoinHandle<()>,
    drain: JoinHandle<()>,
}

/// Launches and supervises one guest runtime process at a time.
///
/// Exit is observable through [`subscribe`](Self::subscribe); the supervisor
/// never restarts the child on its own.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    state: watch::Sender<ProcessState>,
    running: Mutex<Option<RunningChild>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    /// Create an idle supervisor.
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        let (state, _) = watch::channel(ProcessState::NotStarted);
        Self {
            config,
            state,
            running: Mutex::new(None),
        }
    }

    /// Resolve the runtime and launch the guest pointed at `target`.
    ///
    /// Returns the child pid. Stdout and stderr are forwarded to the log
    /// with target `exthost::guest`.
    ///
    /// # Errors
    ///
    /// - `AppError::Session` if a child is already running.
    /// - `AppError::Setup` if the runtime is missing or too old, the entry
    ///   module does not exist, or the OS refuses to spawn the process.
    pub async fn start(&self, target: &ConnectionTarget) -> Result<u32> {
        if self.is_running() {
            return Err(AppError::Session("guest process already running".into()));
        }

        let runtime = resolve_runtime(&self.config.runtime, self.config.version_probe).await?;

        if let Some(entry) = &self.config.runtime.entry {
            if !entry.is_file() {
                return Err(AppError::Setup(format!(
                    "guest entry module not found: {}",
                    entry.display()
                )));
            }
        }

        let env = build_child_env(
            inherited_env(),
            runtime.directory(),
            target,
            &self.config.proxy,
        )?;

        let mut cmd = Command::new(&runtime.executable);
        cmd.args(&self.config.runtime.args);
        if let Some(entry) = &self.config.runtime.entry {
            cmd.arg(entry);
        }
        cmd.env_clear()
            .envs(env)
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Setup(format!(
                "failed to spawn {}: {err}",
                runtime.executable.display()
            ))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::Setup("guest process exited during spawn".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Setup("failed to capture guest stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Setup("failed to capture guest stderr".into()))?;

        let stop = CancellationToken::new();
        self.state.send_replace(ProcessState::Running { pid });
        let drain = tokio::spawn(drain_output(pid, stdout, stderr));
        let monitor = tokio::spawn(monitor_exit(
            child,
            pid,
            stop.clone(),
            self.config.stop_grace,
            self.state.clone(),
        ));

        let replaced = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(RunningChild {
                pid,
                stop,
                monitor,
                drain,
            });
        if let Some(stale) = replaced {
            stale.stop.cancel();
        }

        info!(pid, target = %target, executable = %runtime.executable.display(), "guest process started");
        Ok(pid)
    }

    /// Terminate the child: graceful signal, then a forced kill after the
    /// grace window. Bounded by the grace window plus a few seconds.
    /// Idempotent.
    pub async fn stop(&self) {
        let Some(mut running) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        debug!(pid = running.pid, "stopping guest process");
        running.stop.cancel();

        let deadline = self.config.stop_grace + KILL_SLACK;
        if tokio::time::timeout(deadline, &mut running.monitor).await.is_err() {
            warn!(pid = running.pid, "exit monitor did not finish; aborting");
            // Dropping the child inside the aborted task kills it.
            running.monitor.abort();
        }
        if tokio::time::timeout(DRAIN_JOIN, &mut running.drain).await.is_err() {
            debug!(pid = running.pid, "output drain still open; aborting");
            running.drain.abort();
        }
    }

    /// Whether the child is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.state.borrow(), ProcessState::Running { .. })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    /// Pid of the running child.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match *self.state.borrow() {
            ProcessState::Running { pid } => Some(pid),
            _ => None,
        }
    }

    /// Receiver notified on every lifecycle change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }
}

// ── Background tasks ─────────────────────────────────────────────────────────

async fn monitor_exit(
    mut child: Child,
    pid: u32,
    stop: CancellationToken,
    grace: Duration,
    state: watch::Sender<ProcessState>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = stop.cancelled() => terminate(&mut child, pid, grace).await,
    };

    let (code, reason) = describe_exit(&status);
    if stop.is_cancelled() {
        info!(pid, ?code, %reason, "guest process stopped");
    } else {
        warn!(pid, ?code, %reason, "guest process exited unexpectedly");
    }
    state.send_replace(ProcessState::Exited { code, reason });
}

async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> std::io::Result<ExitStatus> {
    if request_graceful_exit(pid) {
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        warn!(pid, ?grace, "guest ignored termination request; killing");
    }
    child.kill().await?;
    child.wait().await
}

#[cfg(unix)]
fn request_graceful_exit(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            debug!(pid, %err, "SIGTERM failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_graceful_exit(_pid: u32) -> bool {
    false
}

fn describe_exit(status: &std::io::Result<ExitStatus>) -> (Option<i32>, String) {
    match status {
        Ok(status) => {
            let code = status.code();
            let reason = code.map_or_else(
                || "process terminated by signal".to_owned(),
                |c| format!("process exited with code {c}"),
            );
            (code, reason)
        }
        Err(err) => (None, format!("wait error: {err}")),
    }
}

async fn drain_output(pid: u32, stdout: ChildStdout, stderr: ChildStderr) {
    drain_lines(stdout, stderr, |stream, line| match stream {
        OutputStream::Stdout => info!(target: "exthost::guest", pid, stream = "stdout", "{line}"),
        OutputStream::Stderr => warn!(target: "exthost::guest", pid, stream = "stderr", "{line}"),
    })
    .await;
    debug!(pid, "guest output closed");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Read both streams until each reaches EOF, handing over complete lines.
async fn drain_lines<O, E, F>(stdout: O, stderr: E, mut emit: F)
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
    F: FnMut(OutputStream, String),
{
    let mut out = LineReader::new(stdout);
    let mut err = LineReader::new(stderr);
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        tokio::select! {
            line = out.next_line(), if out_open => match line {
                Some(line) => emit(OutputStream::Stdout, line),
                None => out_open = false,
            },
            line = err.next_line(), if err_open => match line {
                Some(line) => emit(OutputStream::Stderr, line),
                None => err_open = false,
            },
        }
    }
}

/// Line reader that keeps a partly read line across cancelled reads.
struct LineReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
        }
    }

    /// Next line without its terminator; invalid UTF-8 is replaced.
    ///
    /// Bytes already read stay in `pending` if this future is dropped, so
    /// the following call completes the same line.
    async fn next_line(&mut self) -> Option<String> {
        let read = self.reader.read_until(b'\n', &mut self.pending).await;
        if matches!(read, Ok(0) | Err(_)) && self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending)
            .trim_end_matches(['\r', '\n'])
            .to_owned();
        self.pending.clear();
        Some(line)
    }
}
