//! Loader-side end of the control channel.
//!
//! Used by the `nacl-loader` binary: receives the start message and its
//! handles, then talks to the host's validation cache.

#![allow(unsafe_code)]

use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::fs::FileExt;
use std::os::unix::net::UnixStream;

use nacl_proto::{CONTROL_FD, HostMsg, LoaderMsg, StartParams};
use sha2::{Digest, Sha256};

use crate::channel;

/// Descriptors after the runtime image in a start message.
const EXTRA_HANDLES: usize = if cfg!(target_os = "macos") { 1 } else { 0 };

/// Everything a loader receives when it is started.
#[derive(Debug)]
#[non_exhaustive]
pub struct LoaderStart {
    /// Session key, version and flags.
    pub params: StartParams,
    /// Loader ends of the data sockets, in request order.
    pub sockets: Vec<OwnedFd>,
    /// Read-only runtime image.
    pub image: File,
    /// Platform-specific extras (macOS: a mappable temporary file).
    pub extra: Vec<OwnedFd>,
}

/// A loader's connection to its host.
#[derive(Debug)]
pub struct LoaderChannel {
    /// Control channel socket, blocking.
    stream: UnixStream,
}

impl LoaderChannel {
    /// Wraps an already connected control socket.
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Adopts the control channel the host installed at
    /// [`CONTROL_FD`].
    ///
    /// # Safety
    ///
    /// Must be called at most once per process, and only in a process
    /// launched by a host, so that descriptor 3 is the control channel and
    /// nothing else owns it.
    pub unsafe fn from_control_fd() -> io::Result<Self> {
        // SAFETY: F_GETFD only inspects the descriptor table.
        if unsafe { libc::fcntl(CONTROL_FD, libc::F_GETFD) } == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the descriptor is open and, per the caller, ours alone.
        let fd = unsafe { OwnedFd::from_raw_fd(CONTROL_FD) };
        channel::set_cloexec(&fd)?;
        Ok(Self::new(UnixStream::from(fd)))
    }

    /// Waits for the start message and splits its handles.
    pub fn recv_start(&mut self) -> io::Result<LoaderStart> {
        let (payload, mut fds) = channel::recv_with_handles(&self.stream)?;
        let params = match nacl_proto::from_payload::<HostMsg>(&payload)? {
            HostMsg::Start(params) => params,
            other => return Err(unexpected(&other)),
        };
        if fds.len() != params.handle_count as usize || fds.len() < 1 + EXTRA_HANDLES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "start message announced {} handles, carried {}",
                    params.handle_count,
                    fds.len()
                ),
            ));
        }
        let extra = fds.split_off(fds.len() - EXTRA_HANDLES);
        let image = File::from(fds.pop().ok_or(io::ErrorKind::InvalidData)?);
        Ok(LoaderStart {
            params,
            sockets: fds,
            image,
            extra,
        })
    }

    /// Asks the host whether `signature` is known to validate.
    pub fn query_known_to_validate(&mut self, signature: &[u8]) -> io::Result<bool> {
        nacl_proto::encode(
            &mut self.stream,
            &LoaderMsg::QueryKnownToValidate {
                signature: signature.to_vec(),
            },
        )?;
        match nacl_proto::decode::<HostMsg>(&mut self.stream)? {
            HostMsg::KnownToValidate(known) => Ok(known),
            other => Err(unexpected(&other)),
        }
    }

    /// Tells the host that `signature` passed validation.
    pub fn set_known_to_validate(&mut self, signature: &[u8]) -> io::Result<()> {
        nacl_proto::encode(
            &mut self.stream,
            &LoaderMsg::SetKnownToValidate {
                signature: signature.to_vec(),
            },
        )
    }

    /// Blocks until the host closes the control channel.
    pub fn wait_for_close(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 64];
        loop {
            match io::Read::read(&mut self.stream, &mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// Error for a host message arriving out of turn.
fn unexpected(msg: &HostMsg) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected host message: {msg:?}"),
    )
}

/// HMAC-SHA256 of the whole file, read positionally.
pub fn file_signature(key: &[u8], file: &File) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut offset = 0u64;
    hmac_sha256(key, |inner| {
        loop {
            let n = file.read_at(&mut buf, offset)?;
            if n == 0 {
                return Ok(());
            }
            inner.update(&buf[..n]);
            offset += n as u64;
        }
    })
}

/// HMAC-SHA256 (RFC 2104) with the message supplied by `feed`.
pub fn hmac_sha256(
    key: &[u8],
    feed: impl FnOnce(&mut Sha256) -> io::Result<()>,
) -> io::Result<Vec<u8>> {
    const BLOCK_LEN: usize = 64;
    let mut block = [0u8; BLOCK_LEN];
    if key.len() > BLOCK_LEN {
        let digest = Sha256::digest(key);
        block[..digest.len()].copy_from_slice(&digest);
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    inner.update(block.map(|b| b ^ 0x36));
    feed(&mut inner)?;
    let inner_hash = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(block.map(|b| b ^ 0x5c));
    outer.update(inner_hash);
    Ok(outer.finalize().to_vec())
}
