// Protocol constants shared by the supervisor and worker roles.

/// Environment variable carrying the worker's unique id. Absent in the
/// supervisor process; its presence selects the worker role at startup.
pub const UNIQUE_ID_ENV: &str = "NODE_UNIQUE_ID";

/// Environment variable carrying the descriptor number of the inherited
/// message channel in a spawned worker.
pub const CHANNEL_FD_ENV: &str = "NODE_CHANNEL_FD";

/// Environment variable enabling the diagnostic channel when its value
/// contains the substring `cluster`.
pub const DEBUG_ENV: &str = "NODE_DEBUG";

/// Command prefix distinguishing cluster-internal messages from user
/// messages on the channel.
pub const INTERNAL_PREFIX: &str = "NODE_CLUSTER_";

/// Descriptor number the channel end is mapped to in spawned workers.
pub const CHANNEL_FD: i32 = 3;

/// Upper bound on a single wire frame. Anything larger indicates a
/// corrupted stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Listen backlog used when the worker's listen arguments carry none.
/// The kernel clamps this to its own limit.
pub const DEFAULT_BACKLOG: u32 = 511;
