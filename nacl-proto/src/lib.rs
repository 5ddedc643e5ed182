//! Wire protocol for nacl-host ↔ loader communication.
//!
//! Messages are serialized with [`postcard`] and framed with a 4-byte
//! big-endian length prefix. The control channel is a Unix stream socket;
//! descriptors that accompany a message travel as `SCM_RIGHTS` ancillary
//! data on the frame's first bytes (see `nacl_host::channel`).

mod codec;
mod message;

#[cfg(feature = "tokio")]
pub use codec::{recv, send};
pub use codec::{HEADER_LEN, MAX_FRAME, decode, encode, frame, from_payload, payload_len};
pub use message::{CONTROL_FD, HostMsg, LoaderMsg, MAX_SOCKETS, StartParams, switches};
