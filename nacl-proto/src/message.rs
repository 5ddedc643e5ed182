//! Protocol message types for host↔loader communication.

use serde::{Deserialize, Serialize};

/// Upper bound on the data sockets a single launch request may ask for.
///
/// Limits what a compromised or buggy requester can make the host allocate.
pub const MAX_SOCKETS: usize = 8;

/// Descriptor number at which a loader finds its control channel.
pub const CONTROL_FD: i32 = 3;

/// Command-line switches understood by the loader.
pub mod switches {
    /// Process type switch (`--type=<value>`).
    pub const PROCESS_TYPE: &str = "type";
    /// Value of [`PROCESS_TYPE`] for loader processes.
    pub const LOADER_PROCESS: &str = "nacl-loader";
    /// Control channel identifier (`--channel=<id>`).
    pub const CHANNEL_ID: &str = "channel";
    /// Suppress interactive error dialogs in the loader.
    pub const NO_ERROR_DIALOGS: &str = "no-error-dialogs";
}

/// Parameters the host sends to a freshly launched loader.
///
/// The message travels with `handle_count` descriptors attached: the
/// loader's half of every data socket in request order, then the runtime
/// image, then any platform-specific extras.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct StartParams {
    /// Per-session key for HMACing validation signatures.
    pub validation_cache_key: Vec<u8>,
    /// Version string of the host that launched the loader.
    pub version: String,
    /// Whether untrusted hardware exception handling is enabled.
    pub enable_exception_handling: bool,
    /// Number of descriptors attached to this message.
    pub handle_count: u32,
}

impl StartParams {
    /// Creates a new set of start parameters.
    pub fn new(
        validation_cache_key: Vec<u8>,
        version: impl Into<String>,
        enable_exception_handling: bool,
        handle_count: u32,
    ) -> Self {
        Self {
            validation_cache_key,
            version: version.into(),
            enable_exception_handling,
            handle_count,
        }
    }
}

/// Message sent from host to loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum HostMsg {
    /// Start executing with the attached handles.
    Start(StartParams),
    /// Reply to [`LoaderMsg::QueryKnownToValidate`].
    KnownToValidate(bool),
}

/// Message sent from loader to host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum LoaderMsg {
    /// Has this signature already passed validation? Answered with
    /// [`HostMsg::KnownToValidate`].
    QueryKnownToValidate {
        /// HMAC of the code, keyed with the session key.
        signature: Vec<u8>,
    },
    /// Record that this signature passed validation. Not answered.
    SetKnownToValidate {
        /// HMAC of the code, keyed with the session key.
        signature: Vec<u8>,
    },
}
