// The supervisor: owns worker records, spawn settings, and the
// shared-listener registry, and dispatches the master side of the
// cluster protocol.

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use cluster_common::constants::UNIQUE_ID_ENV;
use cluster_common::{
    ChannelReceiver, ClusterDebug, ClusterEvent, DebugRole, InternalCmd, InternalMessage,
    MessageChannel, PendingQueries, QueryReply, WorkerId, WorkerState,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::registry::{SharedListeners, Waiter};
use crate::settings::{SetupOptions, Settings};
use crate::spawn::{ChildExit, ChildProcess, Spawner, TokioSpawner};
use crate::worker::Worker;

const EVENT_CAPACITY: usize = 256;

/// The master role: spawns workers, tracks their lifecycle, and hands
/// shared listening sockets to whoever asks.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<SupervisorShared>,
}

struct SupervisorShared {
    settings: Mutex<Option<Settings>>,
    workers: Mutex<BTreeMap<WorkerId, Worker>>,
    next_id: AtomicU32,
    listeners: Arc<SharedListeners>,
    queries: PendingQueries,
    events: broadcast::Sender<ClusterEvent>,
    spawner: Arc<dyn Spawner>,
    debug: ClusterDebug,
}

impl Supervisor {
    /// Create a supervisor that spawns real worker processes.
    ///
    /// # Panics
    /// When called from a worker process; this is master-only surface.
    pub fn new() -> Supervisor {
        Self::with_spawner(Arc::new(TokioSpawner))
    }

    /// Create a supervisor over an explicit spawn primitive.
    ///
    /// # Panics
    /// When called from a worker process; this is master-only surface.
    pub fn with_spawner(spawner: Arc<dyn Spawner>) -> Supervisor {
        assert!(
            std::env::var_os(UNIQUE_ID_ENV).is_none(),
            "Supervisor requires the master role ({} is set)",
            UNIQUE_ID_ENV
        );
        let debug = ClusterDebug::new(DebugRole::Master);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Supervisor {
            shared: Arc::new(SupervisorShared {
                settings: Mutex::new(None),
                workers: Mutex::new(BTreeMap::new()),
                next_id: AtomicU32::new(1),
                listeners: SharedListeners::new(debug),
                queries: PendingQueries::new(),
                events,
                spawner,
                debug,
            }),
        }
    }

    /// Capture spawn settings. The first call wins; later calls return
    /// the captured snapshot unchanged.
    pub fn setup_master(&self, options: SetupOptions) -> Settings {
        let mut slot = self.shared.settings.lock();
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }
        let settings = Settings::capture(options);
        *slot = Some(settings.clone());
        drop(slot);
        self.shared.debug.log("settings captured");
        self.shared.emit(ClusterEvent::Setup);
        settings
    }

    /// The captured settings, once `setup_master` (or `fork`) has run.
    pub fn settings(&self) -> Option<Settings> {
        self.shared.settings.lock().clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.shared.events.subscribe()
    }

    /// Live worker records, in id order. A worker leaves the map when its
    /// channel closes or its process ends, whichever is observed first.
    pub fn workers(&self) -> Vec<Worker> {
        self.shared.workers.lock().values().cloned().collect()
    }

    pub fn worker(&self, id: WorkerId) -> Option<Worker> {
        self.shared.workers.lock().get(&id).cloned()
    }

    /// Number of shared listeners the supervisor currently holds.
    pub fn shared_listener_count(&self) -> usize {
        self.shared.listeners.count()
    }

    /// Spawn one worker. The child environment is the supervisor's own,
    /// plus the id marker, plus `env_overrides` (later keys win).
    pub fn fork(&self, env_overrides: Vec<(String, String)>) -> Result<Worker> {
        let settings = self.setup_master(SetupOptions::default());
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (channel, child_end) =
            MessageChannel::pair().context("creating worker channel")?;
        let (sender, receiver) = channel.split();

        let mut env = vec![(UNIQUE_ID_ENV.to_string(), id.to_string())];
        env.extend(env_overrides);

        let spawned = self.shared.spawner.spawn(id, &settings, env, child_end);

        let worker = Worker::new(id, sender);
        self.shared.workers.lock().insert(id, worker.clone());
        self.shared.emit(ClusterEvent::Fork { worker: id });
        self.shared.debug.log(&format!("worker {} forked", id));

        match spawned {
            Ok(proc) => {
                worker.shared.set_pid(proc.pid());
                let shared = Arc::clone(&self.shared);
                let reader_worker = worker.clone();
                tokio::spawn(async move { shared.run_reader(reader_worker, receiver).await });
                let shared = Arc::clone(&self.shared);
                let waited_worker = worker.clone();
                tokio::spawn(async move { shared.run_waiter(waited_worker, proc).await });
            }
            Err(err) => {
                // No process and no channel tasks exist behind this
                // record; retire it on the spot so cluster-wide
                // disconnect never waits on a worker that was never
                // alive.
                worker.shared.sender.close();
                self.shared.emit(ClusterEvent::Error {
                    worker: id,
                    message: format!("{:#}", err),
                });
                if self.shared.prepare_exit(&worker, WorkerState::Disconnected) {
                    self.shared.emit(ClusterEvent::Disconnect { worker: id });
                }
                self.shared.prepare_exit(&worker, WorkerState::Dead);
                worker.shared.record_exit(ChildExit::default());
                let suicide = worker.shared.coerce_suicide();
                self.shared.emit(ClusterEvent::Exit {
                    worker: id,
                    code: None,
                    signal: None,
                    suicide,
                });
            }
        }
        Ok(worker)
    }

    /// Gracefully disconnect every worker, then close and drop every
    /// shared listener. Resolves immediately when there are no workers.
    pub async fn disconnect(&self) {
        let workers = self.workers();
        self.shared
            .debug
            .log(&format!("disconnecting {} worker(s)", workers.len()));
        let drains = workers.iter().map(|worker| async move {
            let _ = worker.disconnect().await;
            worker.wait_disconnect().await;
        });
        futures::future::join_all(drains).await;
        self.shared.listeners.close_all();
        self.shared.debug.log("shutdown complete");
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorShared {
    fn emit(&self, event: ClusterEvent) {
        let _ = self.events.send(event);
    }

    async fn run_reader(self: Arc<Self>, worker: Worker, mut receiver: ChannelReceiver) {
        loop {
            match receiver.recv().await {
                Ok(Some((value, handle))) => self.dispatch(&worker, value, handle).await,
                Ok(None) => break,
                Err(err) => {
                    self.emit(ClusterEvent::Error {
                        worker: worker.id(),
                        message: err.to_string(),
                    });
                    break;
                }
            }
        }
        self.channel_closed(&worker);
    }

    /// Channel closure is terminal for the worker: retire the record and,
    /// for a destroyed worker, deliver the kill signal now.
    fn channel_closed(&self, worker: &Worker) {
        worker.shared.sender.close();
        if self.prepare_exit(worker, WorkerState::Disconnected) {
            self.debug.log(&format!("worker {} disconnected", worker.id()));
            self.emit(ClusterEvent::Disconnect { worker: worker.id() });
        }
        if worker.shared.kill_on_disconnect.load(Ordering::SeqCst) {
            worker.shared.kill_requested.cancel();
        }
    }

    async fn run_waiter(self: Arc<Self>, worker: Worker, mut proc: Box<dyn ChildProcess>) {
        let kill = worker.shared.kill_requested.clone();
        let status = tokio::select! {
            status = proc.wait() => status,
            _ = kill.cancelled() => {
                proc.kill();
                proc.wait().await
            }
        };
        // Disconnect precedes exit even when the process dies before the
        // reader observes end-of-stream.
        if self.prepare_exit(&worker, WorkerState::Disconnected) {
            self.emit(ClusterEvent::Disconnect { worker: worker.id() });
        }
        self.prepare_exit(&worker, WorkerState::Dead);
        worker.shared.record_exit(status.clone());
        let suicide = worker.shared.coerce_suicide();
        self.debug.log(&format!(
            "worker {} died (code={:?}, signal={:?}, suicide={})",
            worker.id(),
            status.code,
            status.signal,
            suicide
        ));
        self.emit(ClusterEvent::Exit {
            worker: worker.id(),
            code: status.code,
            signal: status.signal,
            suicide,
        });
    }

    /// Record a terminal state, coerce the suicide flag, and drop the
    /// record from the workers map. Runs from both the channel-closure and
    /// process-exit paths; the second call no longer finds the record.
    fn prepare_exit(&self, worker: &Worker, state: WorkerState) -> bool {
        let changed = worker.shared.advance_state(state);
        worker.shared.coerce_suicide();
        self.workers.lock().remove(&worker.id());
        changed
    }

    async fn dispatch(&self, worker: &Worker, value: Value, handle: Option<OwnedFd>) {
        let Some(msg) = InternalMessage::from_value(&value) else {
            // User payloads bypass the cluster protocol.
            self.emit(ClusterEvent::Message {
                worker: worker.id(),
                value,
                handle: handle.map(Arc::new),
            });
            return;
        };

        let mut handle = handle;
        if let Some(token) = msg.query_echo.as_deref() {
            let reply = QueryReply {
                content: msg.content.clone(),
                error: msg.error.clone(),
                handle: handle.take(),
            };
            if !self.queries.complete(token, reply) {
                self.debug.log(&format!("dropping unsolicited echo {}", token));
            }
        }

        match msg.command() {
            InternalCmd::Online => {
                worker.shared.advance_state(WorkerState::Online);
                self.debug.log(&format!("worker {} online", worker.id()));
                self.emit(ClusterEvent::Online { worker: worker.id() });
            }
            InternalCmd::QueryServer => {
                if let Some(args) = msg.args.clone() {
                    let waiter = Waiter {
                        sender: worker.shared.sender.clone(),
                        token: msg.request_echo.clone(),
                        worker: worker.id(),
                        cmd: msg.cmd.clone(),
                    };
                    // The registry answers once the socket is listening.
                    Arc::clone(&self.listeners).query(args, waiter);
                    return;
                }
            }
            InternalCmd::Listening => {
                worker.shared.advance_state(WorkerState::Listening);
                if let Some(address) = msg.address {
                    self.debug.log(&format!(
                        "worker {} listening on {}",
                        worker.id(),
                        address
                    ));
                    self.emit(ClusterEvent::Listening {
                        worker: worker.id(),
                        address,
                    });
                }
            }
            InternalCmd::Suicide => {
                worker.shared.set_suicide();
            }
            InternalCmd::Disconnect | InternalCmd::Unknown => {}
        }

        // Empty echo for anything that asked and was not answered above,
        // so requesters never hang on an unknown command.
        if let Some(token) = msg.request_echo {
            let reply = InternalMessage {
                cmd: msg.cmd.clone(),
                ..Default::default()
            }
            .with_query_echo(token);
            let _ = worker.shared.sender.send(&reply.to_value(), None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_master_first_call_wins() {
        let supervisor = Supervisor::new();
        assert!(supervisor.settings().is_none());

        let first = supervisor.setup_master(SetupOptions {
            exec: Some("/bin/first".into()),
            ..Default::default()
        });
        assert_eq!(first.exec, std::path::PathBuf::from("/bin/first"));

        let second = supervisor.setup_master(SetupOptions {
            exec: Some("/bin/second".into()),
            silent: Some(true),
            ..Default::default()
        });
        assert_eq!(second.exec, std::path::PathBuf::from("/bin/first"));
        assert!(!second.silent);
        assert_eq!(supervisor.settings().unwrap().exec, std::path::PathBuf::from("/bin/first"));
    }

    #[test]
    fn test_setup_emits_one_setup_event() {
        let supervisor = Supervisor::new();
        let mut events = supervisor.events();
        supervisor.setup_master(SetupOptions::default());
        supervisor.setup_master(SetupOptions::default());
        assert!(matches!(events.try_recv(), Ok(ClusterEvent::Setup)));
        assert!(events.try_recv().is_err());
    }
}
