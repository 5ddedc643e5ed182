//! Loader process spawning.
//!
//! A [`Launcher`] turns a [`LaunchCommand`] into a running loader. The
//! process host only sees the [`PendingLaunch`] it gets back, so whether the
//! spawn happens inline ([`DirectLauncher`]) or is delegated to a helper
//! ([`BrokerLauncher`]) does not change its state machine.
//!
//! Every spawn goes through the same path: stdin is null, the loader's end
//! of the control channel becomes descriptor [`CONTROL_FD`], other inherited
//! descriptors do not survive `exec`, and the child dies with the host.
//!
//! [`CONTROL_FD`]: nacl_proto::CONTROL_FD

mod broker;
#[cfg(target_os = "linux")]
pub(crate) mod debugger;
mod pre_exec;

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use nacl_proto::switches;
use tokio::process::Child;
use tokio::sync::oneshot;

pub use broker::BrokerLauncher;

use crate::error::{Error, Result};

/// Argument vector of a process to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// `argv[0]` followed by the arguments.
    argv: Vec<OsString>,
}

/// Launch options taken from the host configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct LaunchFlags {
    /// Wrapper command prepended to the loader (space separated).
    pub loader_prefix: Option<String>,
    /// Pass `--no-error-dialogs`.
    pub no_error_dialogs: bool,
}

impl CommandLine {
    /// Starts a command line running `program`.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            argv: vec![program.into()],
        }
    }

    /// Splits a space-separated command. Arguments cannot contain spaces.
    ///
    /// Returns `None` if `command` holds no words.
    pub fn from_space_separated(command: &str) -> Option<Self> {
        let argv: Vec<OsString> = command.split(' ').filter(|s| !s.is_empty()).map(OsString::from).collect();
        if argv.is_empty() {
            None
        } else {
            Some(Self { argv })
        }
    }

    /// The loader command line for one launch.
    ///
    /// Pure: only assembles arguments.
    pub fn for_loader(loader: &Path, channel_id: &str, flags: &LaunchFlags) -> Self {
        let mut line = Self::new(loader);
        line.append_switch_value(switches::PROCESS_TYPE, switches::LOADER_PROCESS);
        line.append_switch_value(switches::CHANNEL_ID, channel_id);
        if flags.no_error_dialogs {
            line.append_switch(switches::NO_ERROR_DIALOGS);
        }
        if let Some(prefix) = &flags.loader_prefix {
            line.prepend_wrapper(prefix);
        }
        line
    }

    /// Appends a bare argument.
    pub fn append_arg(&mut self, arg: impl Into<OsString>) {
        self.argv.push(arg.into());
    }

    /// Appends `--name`.
    pub fn append_switch(&mut self, name: &str) {
        self.argv.push(format!("--{name}").into());
    }

    /// Appends `--name=value`.
    pub fn append_switch_value(&mut self, name: &str, value: &str) {
        self.argv.push(format!("--{name}={value}").into());
    }

    /// Inserts a space-separated wrapper command in front of `argv[0]`.
    pub fn prepend_wrapper(&mut self, wrapper: &str) {
        let words = wrapper.split(' ').filter(|s| !s.is_empty()).map(OsString::from);
        self.argv.splice(0..0, words);
    }

    /// Program that will be executed.
    pub fn program(&self) -> &OsStr {
        &self.argv[0]
    }

    /// The full argument vector, `argv[0]` included.
    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    /// Value of `--name=value`, if present.
    pub fn switch_value(&self, name: &str) -> Option<&str> {
        let prefix = format!("--{name}=");
        self.argv
            .iter()
            .filter_map(|a| a.to_str())
            .find_map(|a| a.strip_prefix(prefix.as_str()))
    }

    /// Returns `true` if `--name` is present.
    pub fn has_switch(&self, name: &str) -> bool {
        let flag = format!("--{name}");
        self.argv.iter().any(|a| a.to_str() == Some(flag.as_str()))
    }

    /// Builds a `std::process::Command` from this line.
    pub fn to_command(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        cmd
    }
}

/// Everything needed to spawn one loader.
#[derive(Debug)]
#[non_exhaustive]
pub struct LaunchCommand {
    /// Command line to execute.
    pub command_line: CommandLine,
    /// Control channel identifier, also on the command line.
    pub channel_id: String,
    /// Loader's end of the control channel.
    pub control: OwnedFd,
}

impl LaunchCommand {
    /// Bundles a launch.
    pub fn new(command_line: CommandLine, channel_id: impl Into<String>, control: OwnedFd) -> Self {
        Self {
            command_line,
            channel_id: channel_id.into(),
            control,
        }
    }
}

/// A spawned loader.
///
/// Dropping it kills the process if it is still running.
#[derive(Debug)]
pub struct LaunchedProcess {
    /// Process id.
    pid: u32,
    /// Owned child handle, absent if the process is not ours to reap.
    child: Option<Child>,
    /// Broker to notify when this loader goes away.
    broker: Option<broker::Link>,
}

impl LaunchedProcess {
    /// Wraps a child spawned with `kill_on_drop(true)`.
    pub fn new(child: Child) -> Self {
        Self {
            pid: child.id().unwrap_or(0),
            child: Some(child),
            broker: None,
        }
    }

    /// A process identified only by pid; it cannot be waited on or killed.
    pub const fn detached(pid: u32) -> Self {
        Self {
            pid,
            child: None,
            broker: None,
        }
    }

    /// Process id.
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Waits for the process to exit. Returns `None` for detached processes.
    pub async fn wait(&mut self) -> io::Result<Option<ExitStatus>> {
        match &mut self.child {
            Some(child) => child.wait().await.map(Some),
            None => Ok(None),
        }
    }

    /// Asks the process to terminate without waiting.
    pub fn kill(&mut self) {
        if let Some(child) = &mut self.child {
            if let Err(e) = child.start_kill() {
                tracing::debug!(pid = self.pid, error = %e, "kill failed");
            }
        }
    }

    /// Marks this loader as launched by `broker`.
    fn with_broker(mut self, link: broker::Link) -> Self {
        self.broker = Some(link);
        self
    }
}

/// Notification that a requested launch produced a process.
///
/// If the launcher drops its side without sending, the launch failed.
#[derive(Debug)]
pub struct PendingLaunch {
    /// Channel identifier of the launch, for error reporting.
    channel_id: String,
    /// Receives the process once launched.
    rx: oneshot::Receiver<LaunchedProcess>,
}

impl PendingLaunch {
    /// Creates a pending launch and the sender that completes it.
    pub fn channel(channel_id: impl Into<String>) -> (oneshot::Sender<LaunchedProcess>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                channel_id: channel_id.into(),
                rx,
            },
        )
    }

    /// A launch that has already completed.
    pub fn ready(channel_id: impl Into<String>, process: LaunchedProcess) -> Self {
        let (tx, pending) = Self::channel(channel_id);
        // The receiver is alive in `pending`, so this cannot fail.
        let _ = tx.send(process);
        pending
    }

    /// Waits for the launched process.
    pub async fn launched(self) -> Result<LaunchedProcess> {
        self.rx.await.map_err(|_| Error::LaunchNotificationLost {
            channel: self.channel_id,
        })
    }
}

/// Strategy for spawning loaders.
pub trait Launcher: fmt::Debug + Send + Sync {
    /// Starts a launch.
    ///
    /// An `Err` means the launch failed immediately; otherwise the process
    /// arrives through the returned [`PendingLaunch`], or never does.
    fn launch(&self, command: LaunchCommand) -> Result<PendingLaunch>;
}

/// Spawns loaders inline; the launch notification is ready immediately.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct DirectLauncher;

impl Launcher for DirectLauncher {
    fn launch(&self, command: LaunchCommand) -> Result<PendingLaunch> {
        let channel_id = command.channel_id.clone();
        let process = spawn(command).map_err(Error::LaunchFailed)?;
        Ok(PendingLaunch::ready(channel_id, process))
    }
}

/// Spawns a loader process.
///
/// Must run inside a tokio runtime. The parent's copy of the loader's
/// control endpoint is closed once the child exists.
pub(crate) fn spawn(command: LaunchCommand) -> io::Result<LaunchedProcess> {
    let mut cmd = command.command_line.to_command();
    cmd.stdin(Stdio::null());
    pre_exec::apply(&mut cmd, command.control.as_raw_fd());

    let mut cmd = tokio::process::Command::from(cmd);
    cmd.kill_on_drop(true);
    let child = cmd.spawn()?;
    drop(command.control);

    let process = LaunchedProcess::new(child);
    tracing::debug!(
        pid = process.pid(),
        channel = %command.channel_id,
        program = %command.command_line.program().to_string_lossy(),
        "loader spawned"
    );
    Ok(process)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;

    fn flags() -> LaunchFlags {
        LaunchFlags::default()
    }

    #[test]
    fn loader_line_has_type_and_channel() {
        let line = CommandLine::for_loader(Path::new("/opt/nacl-loader"), "abc123", &flags());
        assert_eq!(line.program(), "/opt/nacl-loader");
        assert_eq!(line.switch_value("type"), Some("nacl-loader"));
        assert_eq!(line.switch_value("channel"), Some("abc123"));
        assert!(!line.has_switch("no-error-dialogs"));
    }

    #[test]
    fn wrapper_goes_first() {
        let f = LaunchFlags {
            loader_prefix: Some("xterm -e  gdb --args".into()),
            no_error_dialogs: true,
        };
        let line = CommandLine::for_loader(Path::new("/opt/nacl-loader"), "c", &f);
        let argv: Vec<_> = line.argv().iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            argv,
            [
                "xterm",
                "-e",
                "gdb",
                "--args",
                "/opt/nacl-loader",
                "--type=nacl-loader",
                "--channel=c",
                "--no-error-dialogs",
            ]
        );
    }

    #[test]
    fn blank_command_is_none() {
        assert!(CommandLine::from_space_separated("   ").is_none());
        let line = CommandLine::from_space_separated("gdb -q").unwrap();
        assert_eq!(line.argv().len(), 2);
    }

    #[tokio::test]
    async fn ready_launch_resolves() {
        let pending = PendingLaunch::ready("c", LaunchedProcess::detached(42));
        assert_eq!(pending.launched().await.unwrap().pid(), 42);
    }

    #[tokio::test]
    async fn dropped_sender_is_lost_launch() {
        let (tx, pending) = PendingLaunch::channel("lost");
        drop(tx);
        match pending.launched().await {
            Err(Error::LaunchNotificationLost { channel }) => assert_eq!(channel, "lost"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn direct_launcher_spawns_a_process() {
        let (_host, loader) = channel::create_pair().unwrap();
        let line = CommandLine::for_loader(Path::new("/bin/true"), "t", &flags());
        let pending = DirectLauncher
            .launch(LaunchCommand::new(line, "t", loader))
            .unwrap();
        let mut process = pending.launched().await.unwrap();
        assert!(process.pid() > 0);
        let status = process.wait().await.unwrap().unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn missing_binary_fails_immediately() {
        let (_host, loader) = channel::create_pair().unwrap();
        let line = CommandLine::for_loader(Path::new("/nonexistent/nacl-loader"), "m", &flags());
        let err = DirectLauncher
            .launch(LaunchCommand::new(line, "m", loader))
            .unwrap_err();
        assert!(matches!(err, Error::LaunchFailed(_)));
    }
}
