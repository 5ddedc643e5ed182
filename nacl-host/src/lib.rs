//! Process host for sandboxed native-code loaders.
//!
//! A [`HostContext`] owns the state shared by every launch: the validation
//! cache, the runtime image and the spawn strategy. Each
//! [`launch`](HostContext::launch) runs one process host on its own tokio
//! task, which
//!
//! 1. creates the requested data socket pairs,
//! 2. spawns a loader with its control channel at descriptor 3,
//! 3. waits for the runtime image to be open,
//! 4. hands the requester its socket ends and sends the loader a start
//!    message carrying its ends, the image and the session key,
//! 5. answers the loader's validation cache queries until it exits.
//!
//! # Quick start
//!
//! ```no_run
//! use nacl_host::{HostConfig, HostContext, LaunchRequest};
//!
//! # async fn demo() -> nacl_host::Result<()> {
//! let ctx = HostContext::new(HostConfig::from_env());
//! ctx.early_startup();
//!
//! let mut ticket = ctx.launch(LaunchRequest::new("https://example.test/app.nmf", 2));
//! let sockets = ticket.reply().await?;
//! assert_eq!(sockets.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod cache;
#[cfg(unix)]
pub mod channel;
#[cfg(unix)]
pub mod client;
mod config;
#[cfg(unix)]
mod context;
mod error;
#[cfg(unix)]
mod host;
pub mod image;
#[cfg(unix)]
pub mod launcher;
mod state;

pub use cache::{CacheStats, ValidationCache};
#[cfg(unix)]
pub use channel::TransferableHandle;
pub use config::{ENV_EXCEPTION_HANDLING, ENV_IRT_LIBRARY, HostConfig, LOADER_BINARY, LaunchMode};
#[cfg(unix)]
pub use context::{HostContext, LaunchRequest, LaunchTicket};
pub use error::{Error, Result};
pub use image::RuntimeImage;
#[cfg(unix)]
pub use launcher::{BrokerLauncher, DirectLauncher, Launcher};
pub use nacl_proto::MAX_SOCKETS;
pub use state::HostState;
