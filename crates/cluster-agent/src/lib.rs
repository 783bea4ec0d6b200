// cluster-agent: the worker role of the worker cluster.
// The agent speaks the worker side of the cluster protocol over the
// inherited channel: it reports in, borrows shared listening sockets from
// the supervisor, and runs the graceful-disconnect procedure.

pub mod agent;
pub mod server;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use agent::{ExitHook, WorkerAgent};
pub use server::SharedServer;
