// Error type for the channel and protocol layers.

use thiserror::Error;

/// Errors surfaced by the IPC channel and the cluster protocol.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The message channel to the peer process is closed.
    #[error("ipc channel closed")]
    ChannelClosed,

    /// The byte stream no longer parses as frames.
    #[error("malformed frame: {0}")]
    Protocol(String),

    /// A shared-listener reply arrived without a descriptor.
    #[error("reply carried no listener handle")]
    MissingHandle,

    /// The supervisor failed to bind the shared listener.
    #[error("shared bind failed: {0}")]
    Bind(String),

    /// The shared server has been closed.
    #[error("server closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("message encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}
