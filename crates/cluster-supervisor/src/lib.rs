// cluster-supervisor: the master role of the worker cluster.
// Owns worker records, spawn settings, and the shared-listener registry,
// and speaks the master side of the cluster protocol.

mod registry;
pub mod settings;
pub mod spawn;
pub mod supervisor;
pub mod worker;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use settings::{SetupOptions, Settings};
pub use spawn::{ChildExit, ChildProcess, Spawner, TokioSpawner};
pub use supervisor::Supervisor;
pub use worker::Worker;
