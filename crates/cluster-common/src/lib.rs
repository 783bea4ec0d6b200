// cluster-common: Shared infrastructure for the worker-cluster supervisor.
// Both roles (supervisor and worker agent) are built on this crate: the
// framed message channel with descriptor passing, the internal protocol
// envelope, the pending-query table, and the diagnostic channel.

pub mod channel;
pub mod constants;
pub mod debug;
pub mod error;
pub mod events;
pub mod message;
pub mod query;
pub mod state;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use channel::{ChannelReceiver, ChannelSender, MessageChannel};
pub use debug::{ClusterDebug, DebugRole};
pub use error::ClusterError;
pub use events::{AgentEvent, ClusterEvent, SharedHandle};
pub use message::{InternalCmd, InternalMessage, ListenSpec, WorkerId};
pub use query::{PendingQueries, QueryReply};
pub use state::WorkerState;
