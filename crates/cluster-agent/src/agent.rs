// The worker self-record. Talks to the supervisor over the inherited
// channel: reports in, borrows shared listening sockets, and runs the
// graceful-disconnect procedure.

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use anyhow::{Context, Result};
use cluster_common::constants::{CHANNEL_FD_ENV, UNIQUE_ID_ENV};
use cluster_common::{
    AgentEvent, ChannelReceiver, ChannelSender, ClusterDebug, ClusterError, DebugRole,
    InternalCmd, InternalMessage, ListenSpec, MessageChannel, PendingQueries, QueryReply,
    WorkerId, WorkerState,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::server::SharedServer;

const EVENT_CAPACITY: usize = 256;

/// Runs where the worker process would terminate. The default hook calls
/// `process::exit`; embedded (in-process) workers substitute their own.
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// The worker self-record.
#[derive(Clone)]
pub struct WorkerAgent {
    shared: Arc<AgentShared>,
}

struct AgentShared {
    id: Option<WorkerId>,
    sender: ChannelSender,
    state: watch::Sender<WorkerState>,
    suicide: Mutex<Option<bool>>,
    /// Live servers keyed by listen fingerprint; drained during graceful
    /// disconnect.
    servers: Mutex<HashMap<String, SharedServer>>,
    queries: PendingQueries,
    events: broadcast::Sender<AgentEvent>,
    exit: ExitHook,
    debug: ClusterDebug,
}

impl WorkerAgent {
    /// Connect from the inherited environment (worker bootstrap).
    ///
    /// The id is parsed from the environment marker; a malformed value
    /// leaves it unset, which is observable but not fatal.
    ///
    /// # Panics
    /// When called from the supervisor process; this is worker-only
    /// surface.
    pub fn connect() -> Result<WorkerAgent> {
        let marker = std::env::var_os(UNIQUE_ID_ENV);
        assert!(
            marker.is_some(),
            "WorkerAgent requires the worker role ({} is not set)",
            UNIQUE_ID_ENV
        );
        let id = marker.and_then(|raw| raw.to_str().and_then(|s| s.parse().ok()));

        let fd: i32 = std::env::var(CHANNEL_FD_ENV)
            .with_context(|| format!("{} is not set; not spawned by a supervisor", CHANNEL_FD_ENV))?
            .parse()
            .with_context(|| format!("{} is not a descriptor number", CHANNEL_FD_ENV))?;
        // The descriptor was inherited for exactly this purpose; nothing
        // else in the process owns it.
        let channel = MessageChannel::from_fd(unsafe { OwnedFd::from_raw_fd(fd) })?;
        Ok(Self::attach(
            channel,
            id,
            Arc::new(|code| std::process::exit(code)),
        ))
    }

    /// Attach an agent to an explicit channel. The exit hook runs where a
    /// real worker would terminate the process.
    pub fn attach(channel: MessageChannel, id: Option<WorkerId>, exit: ExitHook) -> WorkerAgent {
        let (sender, receiver) = channel.split();
        let (state, _) = watch::channel(WorkerState::None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(AgentShared {
            id,
            sender,
            state,
            suicide: Mutex::new(None),
            servers: Mutex::new(HashMap::new()),
            queries: PendingQueries::new(),
            events,
            exit,
            debug: ClusterDebug::new(DebugRole::Worker),
        });

        let reader = Arc::clone(&shared);
        tokio::spawn(async move { reader.run_reader(receiver).await });

        // Report in; the supervisor flips the record online on receipt.
        let hello = Arc::clone(&shared);
        tokio::spawn(async move {
            let msg = InternalMessage::new(InternalCmd::Online);
            let _ = hello.sender.send(&msg.to_value(), None).await;
        });
        shared.advance_state(WorkerState::Online);
        shared.emit(AgentEvent::Online);
        shared.debug.log("agent attached");

        WorkerAgent { shared }
    }

    pub fn id(&self) -> Option<WorkerId> {
        self.shared.id
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.borrow()
    }

    /// Whether this worker's shutdown was asked for. Set by `disconnect`
    /// and `destroy` before anything observable happens.
    pub fn suicide(&self) -> Option<bool> {
        *self.shared.suicide.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.sender.is_connected()
    }

    pub fn events(&self) -> broadcast::Receiver<AgentEvent> {
        self.shared.events.subscribe()
    }

    /// Send a user message to the supervisor.
    pub async fn send(&self, value: Value) -> Result<(), ClusterError> {
        self.shared.sender.send(&value, None).await
    }

    /// Send a user message with a descriptor riding along.
    pub async fn send_with_handle(
        &self,
        value: Value,
        handle: BorrowedFd<'_>,
    ) -> Result<(), ClusterError> {
        self.shared.sender.send(&value, Some(handle)).await
    }

    /// Listen on a socket shared with the whole cluster.
    ///
    /// The bind happens in the supervisor, once per distinct spec; this
    /// worker receives a duplicate of the listening descriptor and starts
    /// accepting on it. Connection distribution between siblings is the
    /// kernel's accept queue.
    pub async fn listen(&self, spec: impl Into<ListenSpec>) -> Result<SharedServer, ClusterError> {
        let spec = spec.into();
        let key = spec.fingerprint();

        let scope = self.shared.id.unwrap_or(0);
        let (token, reply_rx) = self.shared.queries.allocate(scope);
        let msg = InternalMessage::new(InternalCmd::QueryServer)
            .with_request_echo(token.clone())
            .with_args(spec);
        if let Err(err) = self.shared.sender.send(&msg.to_value(), None).await {
            self.shared.queries.forget(&token);
            return Err(err);
        }
        let reply = reply_rx.await.map_err(|_| ClusterError::ChannelClosed)?;
        if let Some(error) = reply.error {
            return Err(ClusterError::Bind(error));
        }
        let fd = reply.handle.ok_or(ClusterError::MissingHandle)?;

        let std_listener = std::net::TcpListener::from(fd);
        std_listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(std_listener)?;
        let address = listener.local_addr()?;

        let server = SharedServer::new(address, listener);
        self.shared.servers.lock().insert(key, server.clone());
        self.shared.advance_state(WorkerState::Listening);

        // One-way notice; the supervisor's listening event carries this
        // address.
        let notice = InternalMessage::new(InternalCmd::Listening).with_address(address);
        let _ = self.shared.sender.send(&notice.to_value(), None).await;
        self.shared.emit(AgentEvent::Listening { address });
        self.shared.debug.log(&format!("listening on {}", address));
        Ok(server)
    }

    /// Graceful shutdown: announce the intent to the supervisor, close
    /// every local server, then close the channel.
    pub async fn disconnect(&self) {
        Arc::clone(&self.shared).graceful_disconnect().await;
    }

    /// Hard stop. In a real worker this never returns; the exit hook
    /// terminates the process with status 0.
    pub async fn destroy(&self) {
        self.shared.set_suicide();
        if self.is_connected() {
            let scope = self.shared.id.unwrap_or(0);
            let (token, reply_rx) = self.shared.queries.allocate(scope);
            let msg = InternalMessage::new(InternalCmd::Suicide).with_request_echo(token.clone());
            if self.shared.sender.send(&msg.to_value(), None).await.is_ok() {
                let mut state = self.shared.state.subscribe();
                // Leave on whichever comes first: the acknowledgement or
                // the channel going away.
                tokio::select! {
                    _ = reply_rx => {}
                    _ = state.wait_for(|s| *s >= WorkerState::Disconnected) => {}
                }
            } else {
                self.shared.queries.forget(&token);
            }
        }
        (self.shared.exit)(0);
    }
}

impl AgentShared {
    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }

    fn set_suicide(&self) {
        *self.suicide.lock() = Some(true);
    }

    fn advance_state(&self, next: WorkerState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_advance_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    async fn run_reader(self: Arc<Self>, mut receiver: ChannelReceiver) {
        loop {
            match receiver.recv().await {
                Ok(Some((value, handle))) => {
                    Arc::clone(&self).dispatch(value, handle).await;
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(target: "cluster", "channel error: {}", err);
                    break;
                }
            }
        }
        self.channel_closed();
    }

    /// The channel is gone. An end that was never asked for means the
    /// supervisor died: leave with status 0 rather than linger orphaned.
    fn channel_closed(&self) {
        self.sender.close();
        if *self.suicide.lock() != Some(true) {
            self.debug.log("channel closed unexpectedly, exiting");
            (self.exit)(0);
            return;
        }
        if self.advance_state(WorkerState::Disconnected) {
            self.emit(AgentEvent::Disconnect);
        }
    }

    async fn dispatch(self: Arc<Self>, value: Value, handle: Option<OwnedFd>) {
        let Some(msg) = InternalMessage::from_value(&value) else {
            // User payloads bypass the cluster protocol.
            self.emit(AgentEvent::Message {
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

        if msg.command() == InternalCmd::Disconnect {
            let shared = Arc::clone(&self);
            tokio::spawn(async move { shared.graceful_disconnect().await });
        }

        // Empty echo for anything that asked and was not answered above,
        // so requesters never hang on an unknown command.
        if let Some(token) = msg.request_echo {
            let reply = InternalMessage {
                cmd: msg.cmd.clone(),
                ..Default::default()
            }
            .with_query_echo(token);
            let _ = self.sender.send(&reply.to_value(), None).await;
        }
    }

    /// The worker-side graceful-disconnect procedure: mark the shutdown
    /// as intentional, wait for the supervisor to acknowledge, drain the
    /// local listeners, then drop the channel.
    async fn graceful_disconnect(self: Arc<Self>) {
        self.set_suicide();

        let scope = self.id.unwrap_or(0);
        let (token, reply_rx) = self.queries.allocate(scope);
        let msg = InternalMessage::new(InternalCmd::Suicide).with_request_echo(token.clone());
        if self.sender.send(&msg.to_value(), None).await.is_ok() {
            let _ = reply_rx.await;
        } else {
            self.queries.forget(&token);
        }

        let servers: Vec<SharedServer> = self.servers.lock().values().cloned().collect();
        futures::future::join_all(servers.iter().map(|server| server.close())).await;
        self.sender.close();

        if self.advance_state(WorkerState::Disconnected) {
            self.emit(AgentEvent::Disconnect);
        }
        self.debug.log("disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::time::Duration;

    struct MasterEnd {
        sender: ChannelSender,
        receiver: ChannelReceiver,
    }

    fn attach_pair() -> (WorkerAgent, MasterEnd, Arc<AtomicI32>) {
        let (master, worker_fd) = MessageChannel::pair().unwrap();
        let (sender, receiver) = master.split();
        let exit_code = Arc::new(AtomicI32::new(-1));
        let hook_code = Arc::clone(&exit_code);
        let agent = WorkerAgent::attach(
            MessageChannel::from_fd(worker_fd).unwrap(),
            Some(1),
            Arc::new(move |code| hook_code.store(code, Ordering::SeqCst)),
        );
        (agent, MasterEnd { sender, receiver }, exit_code)
    }

    async fn next_internal(master: &mut MasterEnd) -> (InternalMessage, Option<OwnedFd>) {
        loop {
            let (value, handle) = master.receiver.recv().await.unwrap().expect("agent message");
            if let Some(msg) = InternalMessage::from_value(&value) {
                return (msg, handle);
            }
        }
    }

    #[tokio::test]
    async fn test_attach_reports_online() {
        let (agent, mut master, _exit) = attach_pair();
        let (msg, _) = next_internal(&mut master).await;
        assert_eq!(msg.command(), InternalCmd::Online);
        assert!(msg.request_echo.is_none());
        assert_eq!(agent.state(), WorkerState::Online);
        assert_eq!(agent.id(), Some(1));
    }

    #[tokio::test]
    async fn test_orphaned_agent_exits_zero() {
        let (agent, master, exit_code) = attach_pair();
        assert_eq!(agent.suicide(), None);

        drop(master);
        for _ in 0..100 {
            if exit_code.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(exit_code.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listen_accepts_on_the_received_descriptor() {
        let (agent, mut master, _exit) = attach_pair();
        let (online, _) = next_internal(&mut master).await;
        assert_eq!(online.command(), InternalCmd::Online);

        let listen = tokio::spawn(async move { agent.listen(("127.0.0.1", 0)).await });

        // Play the supervisor: answer queryServer with a bound socket.
        let (query, _) = next_internal(&mut master).await;
        assert_eq!(query.command(), InternalCmd::QueryServer);
        let token = query.request_echo.clone().unwrap();
        let bound = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let reply = InternalMessage {
            cmd: query.cmd.clone(),
            ..Default::default()
        }
        .with_query_echo(token);
        master
            .sender
            .send(&reply.to_value(), Some(bound.as_fd()))
            .await
            .unwrap();

        let server = listen.await.unwrap().unwrap();
        assert_eq!(server.local_addr(), bound.local_addr().unwrap());

        let (notice, _) = next_internal(&mut master).await;
        assert_eq!(notice.command(), InternalCmd::Listening);
        assert_eq!(notice.address, Some(server.local_addr()));

        // The shared queue serves connections through the worker's copy.
        let address = server.local_addr();
        let client = tokio::spawn(async move {
            tokio::net::TcpStream::connect(address).await.unwrap();
        });
        assert!(server.accept().await.is_ok());
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_surfaces_bind_failure() {
        let (agent, mut master, _exit) = attach_pair();
        let _ = next_internal(&mut master).await;

        let listen = tokio::spawn(async move { agent.listen(("nowhere.invalid", 80)).await });

        let (query, _) = next_internal(&mut master).await;
        let reply = InternalMessage {
            cmd: query.cmd.clone(),
            ..Default::default()
        }
        .with_query_echo(query.request_echo.clone().unwrap())
        .with_error("address in use");
        master.sender.send(&reply.to_value(), None).await.unwrap();

        match listen.await.unwrap() {
            Err(ClusterError::Bind(message)) => assert_eq!(message, "address in use"),
            other => panic!("expected bind error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_master_disconnect_runs_graceful_shutdown() {
        let (agent, mut master, _exit) = attach_pair();
        let _ = next_internal(&mut master).await;
        let mut agent_events = agent.events();

        let disconnect = InternalMessage::new(InternalCmd::Disconnect);
        master.sender.send(&disconnect.to_value(), None).await.unwrap();

        // The agent announces the intent and waits for the empty echo.
        let (suicide, _) = next_internal(&mut master).await;
        assert_eq!(suicide.command(), InternalCmd::Suicide);
        let reply = InternalMessage {
            cmd: suicide.cmd.clone(),
            ..Default::default()
        }
        .with_query_echo(suicide.request_echo.clone().unwrap());
        master.sender.send(&reply.to_value(), None).await.unwrap();

        // Then the channel goes away.
        loop {
            match master.receiver.recv().await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(err) => panic!("unexpected channel error: {}", err),
            }
        }
        loop {
            match agent_events.recv().await {
                Ok(AgentEvent::Disconnect) => break,
                Ok(_) => continue,
                Err(err) => panic!("missed disconnect event: {}", err),
            }
        }
        assert_eq!(agent.state(), WorkerState::Disconnected);
        assert_eq!(agent.suicide(), Some(true));
    }

    #[tokio::test]
    async fn test_unknown_request_is_acked_empty() {
        let (_agent, mut master, _exit) = attach_pair();
        let _ = next_internal(&mut master).await;

        let probe = serde_json::json!({
            "cmd": "NODE_CLUSTER_mystery",
            "_requestEcho": "0:42",
        });
        master.sender.send(&probe, None).await.unwrap();

        let (echo, handle) = next_internal(&mut master).await;
        assert_eq!(echo.query_echo.as_deref(), Some("0:42"));
        assert!(echo.content.is_none());
        assert!(handle.is_none());
    }
}
