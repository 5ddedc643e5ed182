//! Socket pairs and descriptor hand-off.
//!
//! Data sockets are created in the host and split between the requester and
//! the loader, rather than letting either side create them, so that neither
//! sandboxed party ever needs to send a descriptor to the other.
//!
//! Descriptors leave the host as `SCM_RIGHTS` ancillary data attached to the
//! first bytes of a framed message.

#![allow(unsafe_code)]

use std::io::{self, IoSlice, IoSliceMut, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, recvmsg,
    sendmsg, socketpair,
};

/// Most descriptors a single message may carry.
pub const MAX_HANDLES: usize = nacl_proto::MAX_SOCKETS + 2;

/// A descriptor on its way to another process.
///
/// Owns its descriptor; dropping an untransferred handle closes it.
#[derive(Debug)]
pub struct TransferableHandle {
    /// The descriptor that will be sent.
    fd: OwnedFd,
}

impl TransferableHandle {
    /// Takes the descriptor back, e.g. for an in-process requester.
    pub fn into_owned_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for TransferableHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for TransferableHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Creates one connected stream socket pair, both ends close-on-exec.
///
/// Either both descriptors are returned or neither exists.
pub fn create_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let (a, b) = socketpair(AddressFamily::Unix, SockType::Stream, None, PAIR_FLAGS)?;
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        set_cloexec(&a)?;
        set_cloexec(&b)?;
    }
    Ok((a, b))
}

/// Prepares `endpoint` for hand-off, giving up the local copy.
///
/// With pass-by-descriptor the local descriptor itself travels; it is closed
/// here once the message carrying it has been sent and the handle dropped.
pub fn transfer_to_process(endpoint: OwnedFd, target_pid: u32) -> TransferableHandle {
    tracing::trace!(fd = endpoint.as_raw_fd(), target_pid, "transferring endpoint");
    TransferableHandle { fd: endpoint }
}

/// Prepares a duplicate of `fd` for hand-off; the source stays open.
pub fn share_with_process(fd: BorrowedFd<'_>, target_pid: u32) -> io::Result<TransferableHandle> {
    tracing::trace!(fd = fd.as_raw_fd(), target_pid, "sharing descriptor");
    Ok(TransferableHandle {
        fd: fd.try_clone_to_owned()?,
    })
}

/// Sends `frame` with `handles` attached to its first byte.
///
/// The socket must be in blocking mode. Handles are closed in this process
/// when the caller drops them afterwards.
pub fn send_with_handles(
    sock: &UnixStream,
    frame: &[u8],
    handles: &[TransferableHandle],
) -> io::Result<()> {
    if frame.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty frame"));
    }
    if handles.len() > MAX_HANDLES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} handles exceed the limit of {MAX_HANDLES}", handles.len()),
        ));
    }
    let fds: Vec<RawFd> = handles.iter().map(TransferableHandle::as_raw_fd).collect();
    let rights = [ControlMessage::ScmRights(&fds)];
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };

    let first = sendmsg::<()>(
        sock.as_raw_fd(),
        &[IoSlice::new(frame)],
        cmsgs,
        SEND_FLAGS,
        None,
    )?;
    let mut sent = first;
    while sent < frame.len() {
        let n = sendmsg::<()>(
            sock.as_raw_fd(),
            &[IoSlice::new(&frame[sent..])],
            &[],
            SEND_FLAGS,
            None,
        )?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        sent += n;
    }
    Ok(())
}

/// Receives one frame (header + payload) and the descriptors attached to it.
///
/// Returns the payload bytes and the received descriptors, which are
/// close-on-exec. The socket must be in blocking mode.
pub fn recv_with_handles(sock: &UnixStream) -> io::Result<(Vec<u8>, Vec<OwnedFd>)> {
    let mut header = [0u8; nacl_proto::HEADER_LEN];
    let mut fds = Vec::new();
    let mut got = 0;
    while got < header.len() {
        let n = recv_some(sock.as_raw_fd(), &mut header[got..], &mut fds)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        got += n;
    }

    let mut payload = vec![0u8; nacl_proto::payload_len(header)?];
    (&*sock).read_exact(&mut payload)?;
    Ok((payload, fds))
}

/// One `recvmsg` call, collecting any `SCM_RIGHTS` descriptors into `fds`.
fn recv_some(sock: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut space = nix::cmsg_space!([RawFd; MAX_HANDLES]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(sock, &mut iov, Some(&mut space), RECV_FLAGS)?;
    // Adopt whatever the kernel installed first so an error below closes it.
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(raw) = cmsg {
            for fd in raw {
                // SAFETY: the kernel just installed `fd` in our table for us.
                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "descriptor list truncated",
        ));
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    for fd in &*fds {
        set_cloexec(fd)?;
    }
    Ok(msg.bytes)
}

/// Flags for `socketpair`: close-on-exec from birth where supported.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const PAIR_FLAGS: SockFlag = SockFlag::SOCK_CLOEXEC;
/// Flags for `socketpair`.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const PAIR_FLAGS: SockFlag = SockFlag::empty();

/// Flags for `sendmsg`: a closed peer is an error, not a signal.
#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
/// Flags for `sendmsg`.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

/// Flags for `recvmsg`: have the kernel mark received descriptors
/// close-on-exec where it can.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
/// Flags for `recvmsg`.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

/// Sets `FD_CLOEXEC` on a file descriptor.
pub(crate) fn set_cloexec(fd: &impl AsRawFd) -> io::Result<()> {
    // SAFETY: fcntl(F_GETFD/F_SETFD) on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Returns whether `FD_CLOEXEC` is set.
#[cfg(test)]
pub(crate) fn is_cloexec(fd: &impl AsRawFd) -> bool {
    // SAFETY: fcntl(F_GETFD) on a valid descriptor.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
    flags != -1 && flags & libc::FD_CLOEXEC != 0
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use nacl_proto::{HostMsg, StartParams};

    use super::*;

    #[test]
    fn pair_is_connected_and_cloexec() {
        let (a, b) = create_pair().unwrap();
        assert!(is_cloexec(&a));
        assert!(is_cloexec(&b));

        let mut a = UnixStream::from(a);
        let mut b = UnixStream::from(b);
        a.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn share_keeps_source_open() {
        let (a, _b) = create_pair().unwrap();
        let shared = share_with_process(a.as_fd(), 1).unwrap();
        assert_ne!(shared.as_raw_fd(), a.as_raw_fd());
        assert!(is_cloexec(&shared));
        drop(shared);
        assert!(is_cloexec(&a));
    }

    #[test]
    fn transfer_moves_the_descriptor() {
        let (a, _b) = create_pair().unwrap();
        let raw = a.as_raw_fd();
        let handle = transfer_to_process(a, 1);
        assert_eq!(handle.as_raw_fd(), raw);
    }

    #[test]
    fn handles_travel_with_frame() {
        let (host, loader) = create_pair().unwrap();
        let host = UnixStream::from(host);
        let loader = UnixStream::from(loader);

        let (ours, theirs) = create_pair().unwrap();
        let msg = HostMsg::Start(StartParams::new(vec![1; 64], "v", false, 1));
        let frame = nacl_proto::frame(&msg).unwrap();
        send_with_handles(&host, &frame, &[transfer_to_process(theirs, 0)]).unwrap();

        let (payload, fds) = recv_with_handles(&loader).unwrap();
        let decoded: HostMsg = nacl_proto::from_payload(&payload).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(fds.len(), 1);
        assert!(is_cloexec(&fds[0]));

        let mut ours = UnixStream::from(ours);
        let mut received = UnixStream::from(fds.into_iter().next().unwrap());
        ours.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        received.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn frame_without_handles() {
        let (host, loader) = create_pair().unwrap();
        let host = UnixStream::from(host);
        let loader = UnixStream::from(loader);

        let frame = nacl_proto::frame(&HostMsg::KnownToValidate(true)).unwrap();
        send_with_handles(&host, &frame, &[]).unwrap();
        let (payload, fds) = recv_with_handles(&loader).unwrap();
        assert!(fds.is_empty());
        let msg: HostMsg = nacl_proto::from_payload(&payload).unwrap();
        assert_eq!(msg, HostMsg::KnownToValidate(true));
    }

    #[test]
    fn eof_before_header() {
        let (host, loader) = create_pair().unwrap();
        drop(host);
        let loader = UnixStream::from(loader);
        let err = recv_with_handles(&loader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn truncated_descriptor_list_closes_what_arrived() {
        let (host, loader) = create_pair().unwrap();
        let host = UnixStream::from(host);
        let loader = UnixStream::from(loader);

        // One copy more than a frame may carry.
        let (r, w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();
        let copies = vec![w.as_raw_fd(); MAX_HANDLES + 1];
        let header = [0u8; nacl_proto::HEADER_LEN];
        sendmsg::<()>(
            host.as_raw_fd(),
            &[IoSlice::new(&header)],
            &[ControlMessage::ScmRights(&copies)],
            MsgFlags::empty(),
            None,
        )
        .unwrap();
        drop(w);

        let err = recv_with_handles(&loader).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // Every write end is gone once the installed copies were closed.
        let mut r = std::fs::File::from(r);
        let mut buf = [0u8; 1];
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }
}
