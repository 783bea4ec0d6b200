// Lifecycle events emitted by the supervisor and by the worker agent.

use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use serde_json::Value;

use crate::message::WorkerId;

/// A descriptor that arrived with a message. Shared because events are
/// broadcast to every subscriber.
pub type SharedHandle = Arc<OwnedFd>;

/// Events observed on the supervisor. Per-worker events carry the worker
/// id so one ordered stream covers the whole cluster.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// Settings were captured by the first `setup_master` call.
    Setup,
    /// A worker record was created and its process spawn attempted.
    Fork { worker: WorkerId },
    /// The worker reported itself up.
    Online { worker: WorkerId },
    /// The worker began accepting on a shared listener.
    Listening { worker: WorkerId, address: SocketAddr },
    /// A user message from the worker, bypassing the cluster protocol.
    Message { worker: WorkerId, value: Value, handle: Option<SharedHandle> },
    /// The worker's spawn or channel failed.
    Error { worker: WorkerId, message: String },
    /// The worker's channel closed.
    Disconnect { worker: WorkerId },
    /// The worker process ended.
    Exit { worker: WorkerId, code: Option<i32>, signal: Option<String>, suicide: bool },
}

/// Events observed inside a worker process.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Online,
    Listening { address: SocketAddr },
    Message { value: Value, handle: Option<SharedHandle> },
    Disconnect,
}
