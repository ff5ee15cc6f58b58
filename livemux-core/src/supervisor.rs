use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{watch, Notify};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::command::InvocationSpec;
use crate::config::LivemuxConfig;
use crate::logs::{ingest, merge_output, LogSink};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("transcoder executable not found: {program}")]
    NotFound { program: PathBuf },
    #[error("failed to spawn {program}: {source}")]
    Io {
        program: PathBuf,
        source: io::Error,
    },
    #[error("transcoder output pipes unavailable")]
    MissingPipe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExitOutcome {
    Exited(i32),
    /// Terminated by a signal the supervisor did not send.
    Signaled,
    /// Ended by the graceful termination signal of a stop request.
    Terminated,
    Killed,
    Failed(String),
}

impl ExitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0))
    }

    fn from_status(status: io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => match status.code() {
                Some(code) => ExitOutcome::Exited(code),
                None => ExitOutcome::Signaled,
            },
            Err(err) => ExitOutcome::Failed(err.to_string()),
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "exited with status {code}"),
            ExitOutcome::Signaled => write!(f, "terminated by signal"),
            ExitOutcome::Terminated => write!(f, "terminated on request"),
            ExitOutcome::Killed => write!(f, "killed"),
            ExitOutcome::Failed(reason) => write!(f, "wait failed: {reason}"),
        }
    }
}

/// Shared view of one supervised process. Cloning does not duplicate the process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill: Arc<Notify>,
    terminating: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    drained_rx: watch::Receiver<bool>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.exit_rx.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    grace_period: Duration,
    drain_timeout: Duration,
    excerpt_chars: usize,
    active_ingestions: Arc<AtomicUsize>,
}

impl ProcessSupervisor {
    pub fn new(grace_period: Duration, drain_timeout: Duration, excerpt_chars: usize) -> Self {
        Self {
            grace_period,
            drain_timeout,
            excerpt_chars,
            active_ingestions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_config(config: &LivemuxConfig) -> Self {
        Self::new(
            config.supervisor.grace_period(),
            config.supervisor.drain_timeout(),
            config.logs.excerpt_chars,
        )
    }

    /// Number of output-ingestion tasks that have not reached end-of-stream yet.
    pub fn active_ingestions(&self) -> usize {
        self.active_ingestions.load(Ordering::SeqCst)
    }

    /// Spawns the transcoder and its ingestion and waiter tasks. Must be called
    /// from within a tokio runtime.
    pub fn start(
        &self,
        spec: &InvocationSpec,
        sink: Arc<dyn LogSink>,
    ) -> Result<ProcessHandle, SpawnError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                SpawnError::NotFound {
                    program: spec.program.clone(),
                }
            } else {
                SpawnError::Io {
                    program: spec.program.clone(),
                    source,
                }
            }
        })?;
        let pid = child.id();
        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(SpawnError::MissingPipe);
            }
        };
        info!(
            pid = ?pid,
            program = %spec.program.display(),
            args = ?spec.redacted_args(),
            "transcoder spawned"
        );

        let (exit_tx, exit_rx) = watch::channel(None);
        let (drained_tx, drained_rx) = watch::channel(false);
        let kill = Arc::new(Notify::new());
        let terminating = Arc::new(AtomicBool::new(false));

        self.active_ingestions.fetch_add(1, Ordering::SeqCst);
        let active = Arc::clone(&self.active_ingestions);
        let excerpt_chars = self.excerpt_chars;
        tokio::spawn(async move {
            let appended = ingest(merge_output(stdout, stderr), sink.as_ref(), excerpt_chars).await;
            debug!(pid = ?pid, appended, "transcoder output drained");
            active.fetch_sub(1, Ordering::SeqCst);
            let _ = drained_tx.send(true);
        });

        let kill_signal = Arc::clone(&kill);
        let stop_requested = Arc::clone(&terminating);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => match ExitOutcome::from_status(status) {
                    ExitOutcome::Signaled if stop_requested.load(Ordering::SeqCst) => {
                        ExitOutcome::Terminated
                    }
                    other => other,
                },
                _ = kill_signal.notified() => {
                    if let Err(error) = child.start_kill() {
                        debug!(pid = ?pid, %error, "start_kill failed");
                    }
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        signal_group(pid, libc::SIGKILL);
                    }
                    match child.wait().await {
                        Ok(_) => ExitOutcome::Killed,
                        Err(err) => ExitOutcome::Failed(err.to_string()),
                    }
                }
            };
            info!(pid = ?pid, outcome = %outcome, "transcoder exited");
            let _ = exit_tx.send(Some(outcome));
        });

        Ok(ProcessHandle {
            pid,
            kill,
            terminating,
            exit_rx,
            drained_rx,
        })
    }

    /// Graceful termination, escalating to a forceful kill after the grace period.
    /// Suspends for at most two grace periods: one for the graceful exit, one
    /// shared by the kill and the output drain. Returns `false` when the process
    /// had already exited.
    pub async fn request_stop(&self, handle: &ProcessHandle) -> bool {
        if handle.has_exited() {
            return false;
        }
        handle.terminating.store(true, Ordering::SeqCst);
        self.terminate(handle);

        let mut exit_rx = handle.exit_rx.clone();
        let graceful = timeout(self.grace_period, exit_rx.wait_for(Option::is_some))
            .await
            .is_ok();
        let deadline = Instant::now() + self.grace_period;
        if !graceful {
            warn!(pid = ?handle.pid, "transcoder ignored termination, killing");
            handle.kill.notify_one();
            if timeout_at(deadline, exit_rx.wait_for(Option::is_some))
                .await
                .is_err()
            {
                warn!(pid = ?handle.pid, "transcoder did not exit after kill");
            }
        }
        self.await_drain(handle, deadline).await;
        true
    }

    /// Resolves once the process has exited and its output has been drained
    /// (drain bounded by the configured timeout).
    pub async fn wait(&self, handle: &ProcessHandle) -> ExitOutcome {
        let mut exit_rx = handle.exit_rx.clone();
        let outcome = match exit_rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        self.await_drain(handle, Instant::now() + self.drain_timeout)
            .await;
        outcome.unwrap_or_else(|| ExitOutcome::Failed("supervisor ended without exit status".into()))
    }

    async fn await_drain(&self, handle: &ProcessHandle, deadline: Instant) {
        let mut drained_rx = handle.drained_rx.clone();
        if timeout_at(deadline, drained_rx.wait_for(|drained| *drained))
            .await
            .is_err()
        {
            warn!(pid = ?handle.pid, "transcoder output still open after exit");
        }
    }

    #[cfg(unix)]
    fn terminate(&self, handle: &ProcessHandle) {
        match handle.pid {
            Some(pid) if signal_group(pid, libc::SIGTERM) => {
                debug!(pid, "sent SIGTERM to transcoder group");
            }
            _ => handle.kill.notify_one(),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self, handle: &ProcessHandle) {
        handle.kill.notify_one();
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) takes plain integers; a negative pid addresses the process group.
    unsafe { libc::kill(-pgid, signal) == 0 }
}
