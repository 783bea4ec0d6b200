// In-process worker double: a real `WorkerAgent` attached to the real
// channel end the supervisor created, run as a task in the supervisor's
// own process. Every protocol path is exercised without forking.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use cluster_agent::{ExitHook, WorkerAgent};
use cluster_common::{MessageChannel, WorkerId};
use cluster_supervisor::{ChildExit, ChildProcess, Settings, Spawner};
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// The worker body a `LocalSpawner` runs: what the spawned process's main
/// function would do. Its return value becomes the exit code.
pub type WorkerBody = Arc<dyn Fn(WorkerAgent) -> BoxFuture<'static, i32> + Send + Sync>;

/// A spawner that runs each "process" in-process. The agent's exit hook
/// and the body's return value stand in for process termination; `kill`
/// cancels the body and reports a SIGTERM exit.
pub struct LocalSpawner {
    body: WorkerBody,
}

impl LocalSpawner {
    pub fn new<F, Fut>(body: F) -> Arc<Self>
    where
        F: Fn(WorkerAgent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = i32> + Send + 'static,
    {
        Arc::new(Self {
            body: Arc::new(move |agent| Box::pin(body(agent))),
        })
    }
}

impl Spawner for LocalSpawner {
    fn spawn(
        &self,
        id: WorkerId,
        _settings: &Settings,
        _env: Vec<(String, String)>,
        channel: OwnedFd,
    ) -> Result<Box<dyn ChildProcess>> {
        let channel = MessageChannel::from_fd(channel)?;
        let (exit_tx, exit_rx) = watch::channel(None::<ChildExit>);
        let exit_tx = Arc::new(exit_tx);

        let hook_tx = Arc::clone(&exit_tx);
        let exit_hook: ExitHook = Arc::new(move |code| {
            record_exit(&hook_tx, ChildExit { code: Some(code), signal: None });
        });

        let agent = WorkerAgent::attach(channel, Some(id), exit_hook);

        let killed = CancellationToken::new();
        let body = (self.body)(agent);
        let body_tx = Arc::clone(&exit_tx);
        let kill_signal = killed.clone();
        tokio::spawn(async move {
            tokio::select! {
                code = body => {
                    record_exit(&body_tx, ChildExit { code: Some(code), signal: None });
                }
                _ = kill_signal.cancelled() => {
                    record_exit(
                        &body_tx,
                        ChildExit { code: None, signal: Some("SIGTERM".to_string()) },
                    );
                }
            }
        });

        Ok(Box::new(LocalChild { exit: exit_rx, killed }))
    }
}

/// The first exit wins, as it would for a real process.
fn record_exit(tx: &watch::Sender<Option<ChildExit>>, status: ChildExit) {
    tx.send_if_modified(|slot| {
        if slot.is_none() {
            *slot = Some(status);
            true
        } else {
            false
        }
    });
}

struct LocalChild {
    exit: watch::Receiver<Option<ChildExit>>,
    killed: CancellationToken,
}

#[async_trait]
impl ChildProcess for LocalChild {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> ChildExit {
        match self.exit.wait_for(|status| status.is_some()).await {
            Ok(status) => status.clone().unwrap_or_default(),
            Err(_) => ChildExit::default(),
        }
    }

    fn kill(&mut self) {
        self.killed.cancel();
    }
}
