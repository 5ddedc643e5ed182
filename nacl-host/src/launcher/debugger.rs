//! Debugger attach gate.
//!
//! With a debugger configured, a freshly spawned loader is not reported as
//! launched until the debugger has attached. The debugger signals this by
//! writing one zero byte into a pipe it reaches through `/proc/<host>/fd`.

use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use nix::fcntl::OFlag;

use super::CommandLine;

/// Debugger command line for attaching to `loader_pid`.
///
/// Returns `None` if `debugger` is blank.
pub(crate) fn command_line(
    debugger: &str,
    image: Option<&Path>,
    loader_pid: u32,
    host_pid: u32,
    sync_fd: i32,
) -> Option<CommandLine> {
    let mut line = CommandLine::from_space_separated(debugger)?;
    if let Some(image) = image {
        line.append_arg("--eval-command");
        line.append_arg(format!("nacl-irt {}", image.display()));
    }
    line.append_arg("--eval-command");
    line.append_arg(format!("attach {loader_pid}"));
    line.append_arg("--eval-command");
    line.append_arg(format!("dump binary value /proc/{host_pid}/fd/{sync_fd} (char)0"));
    Some(line)
}

/// Starts the debugger and waits until it reports being attached.
///
/// Failures are logged and reported as `false`; the launch proceeds either
/// way. Returns early if the debugger exits without writing the sync byte.
pub(crate) async fn attach(debugger: &str, image: Option<&Path>, loader_pid: u32) -> bool {
    let (read_end, write_end) = match sync_pipe() {
        Ok(pipe) => pipe,
        Err(e) => {
            tracing::error!(error = %e, "failed to create debugger sync pipe");
            return false;
        }
    };
    let Some(line) = command_line(
        debugger,
        image,
        loader_pid,
        std::process::id(),
        write_end.as_raw_fd(),
    ) else {
        tracing::error!("debugger command is empty");
        return false;
    };

    let mut child = match tokio::process::Command::from(line.to_command()).spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(debugger, error = %e, "failed to launch debugger");
            return false;
        }
    };
    tracing::info!(debugger, loader_pid, "waiting for debugger to attach");

    let read = tokio::task::spawn_blocking(move || {
        let mut byte = [0u8; 1];
        std::fs::File::from(read_end).read_exact(&mut byte).map(|()| byte[0])
    });

    let attached = tokio::select! {
        biased;
        res = read => match res {
            Ok(Ok(0)) => {
                tracing::debug!(loader_pid, "debugger attached");
                true
            }
            Ok(Ok(b)) => {
                tracing::error!(byte = b, "unexpected debugger sync byte");
                false
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "failed to read debugger sync byte");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "debugger sync task failed");
                false
            }
        },
        status = child.wait() => {
            tracing::error!(?status, "debugger exited before attaching");
            false
        }
    };
    // Closing the write end unblocks a reader still waiting.
    drop(write_end);
    attached
}

/// Pipe whose ends are both close-on-exec.
fn sync_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe2(OFlag::O_CLOEXEC)?)
}
