// Role detection and the public surface of the worker cluster.
//
// One program serves both roles: the process that starts without the id
// marker is the supervisor, and every process it forks carries the marker
// and plays a worker. The role never changes for the lifetime of the
// process.

pub mod testing;

use cluster_common::constants::UNIQUE_ID_ENV;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use cluster_agent::{ExitHook, SharedServer, WorkerAgent};
pub use cluster_common::{
    AgentEvent, ClusterError, ClusterEvent, ListenSpec, SharedHandle, WorkerId, WorkerState,
};
pub use cluster_supervisor::{
    ChildExit, ChildProcess, SetupOptions, Settings, Spawner, Supervisor, TokioSpawner, Worker,
};

/// Which role the current process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Supervisor,
    /// A worker. The id is `None` when the inherited marker is malformed,
    /// which is observable but not fatal.
    Worker { id: Option<WorkerId> },
}

/// Detect the role from the environment: absence of the id marker means
/// this process is the supervisor.
pub fn role() -> Role {
    match std::env::var_os(UNIQUE_ID_ENV) {
        None => Role::Supervisor,
        Some(raw) => Role::Worker {
            id: raw.to_str().and_then(parse_worker_id),
        },
    }
}

pub fn is_master() -> bool {
    matches!(role(), Role::Supervisor)
}

pub fn is_worker() -> bool {
    !is_master()
}

fn parse_worker_id(raw: &str) -> Option<WorkerId> {
    raw.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_parses_decimal() {
        assert_eq!(parse_worker_id("1"), Some(1));
        assert_eq!(parse_worker_id("417"), Some(417));
    }

    #[test]
    fn test_malformed_worker_id_is_none() {
        assert_eq!(parse_worker_id(""), None);
        assert_eq!(parse_worker_id("banana"), None);
        assert_eq!(parse_worker_id("-3"), None);
        assert_eq!(parse_worker_id("1.5"), None);
    }
}
