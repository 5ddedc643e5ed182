//! Process host lifecycle states and channel identifiers.

use std::fmt;

/// Lifecycle of one process host, as reported by [`Error::Terminated`](crate::Error::Terminated).
///
/// ```text
/// Created → ResourcesRequested → Launching → AwaitingRuntimeImage → ReadyToStart → Started
///    └──────────────┴────────────────┴──────────────┴───────────────────┴──→ Failed
/// ```
///
/// `Launching` may skip straight to `ReadyToStart` when the runtime image is
/// already open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum HostState {
    /// Host exists, no request processed yet.
    Created,
    /// Socket pairs allocated.
    ResourcesRequested,
    /// Loader spawn requested, waiting for the launch notification.
    Launching,
    /// Loader running, waiting for the runtime image open to finish.
    AwaitingRuntimeImage,
    /// Loader running and image open; about to hand out resources.
    ReadyToStart,
    /// Requester replied to and start message sent.
    Started,
    /// Torn down without starting.
    Failed,
}

impl HostState {
    /// Returns `true` for `Started` and `Failed`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Started | Self::Failed)
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::ResourcesRequested => "resources-requested",
            Self::Launching => "launching",
            Self::AwaitingRuntimeImage => "awaiting-runtime-image",
            Self::ReadyToStart => "ready-to-start",
            Self::Started => "started",
            Self::Failed => "failed",
        })
    }
}

/// Generates a 12-character hex control channel identifier.
pub(crate) fn gen_channel_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static SEQ: AtomicU64 = AtomicU64::new(0);

    let mut h = RandomState::new().build_hasher();
    h.write_u64(u64::from(std::process::id()));
    h.write_u64(SEQ.fetch_add(1, Ordering::Relaxed));
    h.write_u128(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    format!("{:012x}", h.finish() & 0xffff_ffff_ffff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_are_short_hex_and_distinct() {
        let a = gen_channel_id();
        let b = gen_channel_id();
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn only_started_and_failed_are_terminal() {
        assert!(HostState::Started.is_terminal());
        assert!(HostState::Failed.is_terminal());
        assert!(!HostState::Launching.is_terminal());
        assert_eq!(HostState::AwaitingRuntimeImage.to_string(), "awaiting-runtime-image");
    }
}
