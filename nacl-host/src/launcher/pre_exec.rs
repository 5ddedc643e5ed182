//! Pre-exec setup for loader processes.
//!
//! Applied after `fork()` but before `exec()`:
//! 1. **Die with parent**: `PR_SET_PDEATHSIG(SIGKILL)` prevents orphaned loaders.
//! 2. **Control channel**: the loader's endpoint moves to [`CONTROL_FD`] and
//!    loses `FD_CLOEXEC` so it survives `exec`.
//! 3. **FD cleanup**: every other inherited descriptor above it is marked
//!    close-on-exec. Closing them outright would also close the pipe std
//!    uses to report a failed `exec`.

#![allow(unsafe_code)]

use std::os::fd::RawFd;
use std::process::Command;

use nacl_proto::CONTROL_FD;

/// `CLOSE_RANGE_CLOEXEC` from `<linux/close_range.h>`.
#[cfg(target_os = "linux")]
const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

/// Install pre-exec hooks on the command.
///
/// `control` must stay open in the parent until the command is spawned.
pub fn apply(cmd: &mut Command, control: RawFd) {
    use std::os::unix::process::CommandExt;

    // SAFETY: all operations inside are async-signal-safe syscalls.
    unsafe {
        cmd.pre_exec(move || {
            // 1. Die when the host exits.
            #[cfg(target_os = "linux")]
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);

            // 2. Install the control channel at its well-known number.
            if control == CONTROL_FD {
                if libc::fcntl(CONTROL_FD, libc::F_SETFD, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(control, CONTROL_FD) == -1 {
                return Err(std::io::Error::last_os_error());
            }

            // 3. Nothing else crosses exec.
            cloexec_from(CONTROL_FD + 1);

            Ok(())
        });
    }
}

/// Marks all file descriptors >= `first` close-on-exec.
fn cloexec_from(first: RawFd) {
    #[cfg(target_os = "linux")]
    {
        #[allow(clippy::cast_sign_loss)]
        let lo = first as u32;
        // SAFETY: close_range is an async-signal-safe syscall (Linux 5.11+
        // for the CLOEXEC flag).
        let ret = unsafe {
            libc::syscall(libc::SYS_close_range, lo, u32::MAX, CLOSE_RANGE_CLOEXEC)
        };
        if ret == 0 {
            return;
        }
    }

    // Fallback: walk up to sysconf(_SC_OPEN_MAX); closed slots just fail.
    // SAFETY: sysconf and fcntl are async-signal-safe.
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let limit = if max_fd > 0 { max_fd } else { 1024 };
    #[allow(clippy::cast_possible_truncation)]
    for fd in first..limit as RawFd {
        unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    }
}
