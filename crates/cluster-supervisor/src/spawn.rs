// Spawn seam between the supervisor and the operating system, plus the
// default tokio-backed implementation.

use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cluster_common::constants::{CHANNEL_FD, CHANNEL_FD_ENV};
use cluster_common::WorkerId;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::settings::Settings;

/// How a worker process ended. Signal exits report the signal name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildExit {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

/// A spawned worker process as seen by the supervisor.
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process id, when one exists.
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to end. Must be cancel-safe: dropping the
    /// future and polling again resolves with the same status.
    async fn wait(&mut self) -> ChildExit;

    /// Best-effort termination signal.
    fn kill(&mut self);
}

/// The process-spawning primitive the supervisor is parameterized by.
///
/// A spawner executes the settings' program with its runtime flags and
/// arguments, the given environment merged over the supervisor's own
/// (later keys win), and the channel end inherited by the child.
pub trait Spawner: Send + Sync {
    fn spawn(
        &self,
        id: WorkerId,
        settings: &Settings,
        env: Vec<(String, String)>,
        channel: OwnedFd,
    ) -> Result<Box<dyn ChildProcess>>;
}

/// Default spawner: a real child process via `tokio::process`, with the
/// channel end re-mapped to a well-known descriptor number published in
/// the child's environment.
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(
        &self,
        id: WorkerId,
        settings: &Settings,
        env: Vec<(String, String)>,
        channel: OwnedFd,
    ) -> Result<Box<dyn ChildProcess>> {
        let mut command = tokio::process::Command::new(&settings.exec);
        command.args(&settings.exec_argv).args(&settings.args);
        command.env(CHANNEL_FD_ENV, CHANNEL_FD.to_string());
        for (key, value) in env {
            command.env(key, value);
        }
        command.stdin(Stdio::null());
        if settings.silent {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }

        let raw = channel.as_raw_fd();
        unsafe {
            command.pre_exec(move || {
                // dup2 clears close-on-exec on the duplicate; when the
                // descriptor already sits at the target number, clear the
                // flag directly instead.
                if raw == CHANNEL_FD {
                    nix::fcntl::fcntl(
                        raw,
                        nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::empty()),
                    )
                    .map_err(std::io::Error::from)?;
                } else {
                    nix::unistd::dup2(raw, CHANNEL_FD).map_err(std::io::Error::from)?;
                }
                Ok(())
            });
        }

        let mut child = command.spawn().with_context(|| {
            format!("failed to spawn worker {} ({})", id, settings.exec.display())
        })?;
        // Our copy of the child's channel end drops when this call
        // returns; the child then holds the only reference, so its exit
        // is observable as end-of-stream.

        if settings.silent {
            forward_output(id, &mut child);
        }

        Ok(Box::new(TokioChild { child }))
    }
}

/// Pipe a silent child's standard streams into tracing, one line at a
/// time, tagged with the worker id.
fn forward_output(id: WorkerId, child: &mut tokio::process::Child) {
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "cluster::worker", worker = id, "{}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let mut lines = BufReader::new(stderr).lines();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "cluster::worker", worker = id, "{}", line);
            }
        });
    }
}

struct TokioChild {
    child: tokio::process::Child,
}

#[async_trait]
impl ChildProcess for TokioChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> ChildExit {
        match self.child.wait().await {
            Ok(status) => {
                use std::os::unix::process::ExitStatusExt;
                ChildExit {
                    code: status.code(),
                    signal: status.signal().map(signal_name),
                }
            }
            Err(_) => ChildExit::default(),
        }
    }

    fn kill(&mut self) {
        match self.child.id() {
            Some(pid) => {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
            None => {
                let _ = self.child.start_kill();
            }
        }
    }
}

fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{}", signal))
}
