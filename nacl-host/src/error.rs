//! Error types for nacl-host operations.

use crate::state::HostState;

/// Alias for `Result<T, nacl_host::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the process host.
///
/// Every failed launch request is answered with exactly one of these.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The requester asked for more data sockets than allowed.
    #[error("requested {requested} sockets, at most {max} are allowed")]
    TooManySockets {
        /// Number of sockets requested.
        requested: usize,
        /// The hard ceiling.
        max: usize,
    },

    /// A socket pair could not be allocated.
    #[error("failed to create socket pair: {0}")]
    ChannelCreation(#[source] std::io::Error),

    /// The runtime image could not be opened (missing, unreadable, or no
    /// install directory).
    #[error("runtime image unavailable: {path}")]
    RuntimeImageUnavailable {
        /// Display form of the resolved path (`<unresolved>` if none).
        path: String,
    },

    /// Spawning the loader failed synchronously.
    #[error("failed to launch loader: {0}")]
    LaunchFailed(#[source] std::io::Error),

    /// A delegated launch never reported a launched process.
    #[error("launch of channel {channel} was dropped before completing")]
    LaunchNotificationLost {
        /// Control channel identifier of the lost launch.
        channel: String,
    },

    /// The requester stopped waiting for its reply.
    #[error("requester went away before the reply was sent")]
    RequesterGone,

    /// Sending the start message to the loader failed.
    #[error("failed to start loader: {0}")]
    StartFailed(#[source] std::io::Error),

    /// The host was torn down before it replied.
    #[error("process host destroyed in state {0}")]
    Terminated(HostState),

    /// The loader sent something that violates the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An I/O error from channel or process operations.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
