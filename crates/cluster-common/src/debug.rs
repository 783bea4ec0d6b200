// Diagnostic channel for the cluster protocol.
//
// Independent of the tracing subscriber: when NODE_DEBUG matches the
// substring `cluster`, lines are written to standard error prefixed with
// "<pid>,<Master|Worker>" so interleaved output from a whole process tree
// stays attributable.

use std::fmt;

use once_cell::sync::Lazy;

use crate::constants::DEBUG_ENV;

static ENABLED: Lazy<bool> = Lazy::new(|| {
    std::env::var(DEBUG_ENV)
        .map(|value| value.contains("cluster"))
        .unwrap_or(false)
});

/// Which role the current process plays in diagnostic output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugRole {
    Master,
    Worker,
}

impl fmt::Display for DebugRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebugRole::Master => write!(f, "Master"),
            DebugRole::Worker => write!(f, "Worker"),
        }
    }
}

/// A per-role diagnostic writer. Cheap to clone and to call when the
/// channel is disabled.
#[derive(Debug, Clone, Copy)]
pub struct ClusterDebug {
    role: DebugRole,
}

impl ClusterDebug {
    pub fn new(role: DebugRole) -> Self {
        Self { role }
    }

    pub fn role(&self) -> DebugRole {
        self.role
    }

    /// Emit one diagnostic line. Always forwarded to `tracing` at debug
    /// level; additionally printed to stderr when NODE_DEBUG asks for it.
    pub fn log(&self, message: &str) {
        tracing::debug!(target: "cluster", role = %self.role, "{}", message);
        if *ENABLED {
            eprintln!("{},{} {}", std::process::id(), self.role, message);
        }
    }
}
