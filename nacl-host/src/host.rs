//! Per-request process host.
//!
//! One [`ProcessHost`] drives one loader from the launch request to its
//! exit:
//!
//! ```text
//! Created ─▶ ResourcesRequested ─▶ Launching ─┬─▶ AwaitingRuntimeImage ─┐
//!                                             └────────────────────────┴─▶ ReadyToStart ─▶ Started
//! ```
//!
//! Any step may fail instead, which moves the host to `Failed`. The
//! requester gets exactly one reply: its handles on success, otherwise the
//! error. Dropping the host at any point sends the error reply if none was
//! sent, closes every socket it holds and kills the loader.

use std::future::Future;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::process::ExitStatus;
use std::sync::Arc;

use nacl_proto::{HostMsg, LoaderMsg, MAX_SOCKETS, StartParams};
use tokio::sync::oneshot;

use crate::channel::{self, TransferableHandle};
use crate::context::HostContext;
use crate::error::{Error, Result};
use crate::launcher::{CommandLine, LaunchCommand, LaunchFlags, LaunchedProcess, PendingLaunch};
use crate::state::{HostState, gen_channel_id};

/// What the requester eventually receives.
pub(crate) type Reply = Result<Vec<TransferableHandle>>;

/// The requester's side of the exchange, answered at most once.
#[derive(Debug)]
pub(crate) struct PendingReply {
    /// Completes the requester's wait.
    tx: oneshot::Sender<Reply>,
}

impl PendingReply {
    /// Creates a reply slot and the receiver the requester waits on.
    pub(crate) fn channel() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Delivers the reply. Returns `false` if nobody is waiting anymore.
    fn send(self, reply: Reply) -> bool {
        self.tx.send(reply).is_ok()
    }

    /// Resolves once the requester has stopped waiting.
    async fn closed(&mut self) {
        self.tx.closed().await;
    }
}

/// Orchestrates one loader launch.
#[derive(Debug)]
pub(crate) struct ProcessHost {
    /// Identifies the content the loader is launched for.
    url: String,
    /// Number of data sockets requested.
    socket_count: usize,
    /// Current state.
    state: HostState,
    /// Shared cache, image, config and launcher.
    ctx: Arc<HostContext>,
    /// Requester ends of the data sockets.
    requester_sockets: Vec<OwnedFd>,
    /// Loader ends of the data sockets.
    loader_sockets: Vec<OwnedFd>,
    /// Host end of the control channel.
    control: Option<UnixStream>,
    /// The spawned loader; dropping it kills the process.
    process: Option<LaunchedProcess>,
    /// Pending answer to the requester.
    reply: Option<PendingReply>,
}

impl ProcessHost {
    /// Creates a host in the `Created` state.
    pub(crate) fn new(
        ctx: Arc<HostContext>,
        url: impl Into<String>,
        socket_count: usize,
        reply: PendingReply,
    ) -> Self {
        Self {
            url: url.into(),
            socket_count,
            state: HostState::Created,
            ctx,
            requester_sockets: Vec::new(),
            loader_sockets: Vec::new(),
            control: None,
            process: None,
            reply: Some(reply),
        }
    }

    /// Runs the whole lifecycle: launch, start, then serve the loader until
    /// it disconnects.
    pub(crate) async fn run(mut self) {
        match self.start().await {
            Ok(()) => self.serve().await,
            Err(e) => self.fail(e),
        }
    }

    /// Moves from `Created` to `Started`.
    async fn start(&mut self) -> Result<()> {
        self.request_resources()?;
        let pending = self.launch()?;

        let process = until_requester_gone(&mut self.reply, pending.launched()).await??;
        tracing::debug!(url = %self.url, pid = process.pid(), "loader launched");
        self.process = Some(process);

        #[cfg(target_os = "linux")]
        self.debugger_gate().await?;

        let image = Arc::clone(self.ctx.image());
        if !image.is_open() {
            self.transition(HostState::AwaitingRuntimeImage);
            if !until_requester_gone(&mut self.reply, image.ensure_open_then()).await? {
                return Err(Error::RuntimeImageUnavailable {
                    path: image
                        .path()
                        .map_or_else(|| "<unresolved>".to_owned(), |p| p.display().to_string()),
                });
            }
        }
        self.transition(HostState::ReadyToStart);

        self.send_reply()?;
        self.send_start()?;
        self.transition(HostState::Started);
        Ok(())
    }

    /// `Created → ResourcesRequested`: allocates the data socket pairs.
    fn request_resources(&mut self) -> Result<()> {
        if self.socket_count > MAX_SOCKETS {
            return Err(Error::TooManySockets {
                requested: self.socket_count,
                max: MAX_SOCKETS,
            });
        }
        for _ in 0..self.socket_count {
            let (requester, loader) = channel::create_pair().map_err(Error::ChannelCreation)?;
            self.requester_sockets.push(requester);
            self.loader_sockets.push(loader);
        }
        self.transition(HostState::ResourcesRequested);
        Ok(())
    }

    /// `ResourcesRequested → Launching`: opens the image in the background
    /// and asks the launcher for a loader.
    fn launch(&mut self) -> Result<PendingLaunch> {
        self.ctx.image().ensure_open();

        let config = self.ctx.config();
        let loader = config.loader.as_deref().ok_or_else(|| {
            Error::LaunchFailed(io::Error::new(
                io::ErrorKind::NotFound,
                "loader binary location unknown",
            ))
        })?;
        let (host, loader_end) = channel::create_pair().map_err(Error::ChannelCreation)?;
        let channel_id = gen_channel_id();
        let flags = LaunchFlags {
            loader_prefix: config.loader_prefix.clone(),
            no_error_dialogs: config.no_error_dialogs,
        };
        let line = CommandLine::for_loader(loader, &channel_id, &flags);
        self.control = Some(UnixStream::from(host));
        self.transition(HostState::Launching);

        tracing::debug!(url = %self.url, channel = %channel_id, "launching loader");
        self.ctx
            .launcher()
            .launch(LaunchCommand::new(line, channel_id, loader_end))
    }

    /// Holds the launch until a configured debugger has attached.
    #[cfg(target_os = "linux")]
    async fn debugger_gate(&mut self) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let (Some(debugger), Some(process)) = (ctx.config().debugger_command(), &self.process)
        else {
            return Ok(());
        };
        let attach = crate::launcher::debugger::attach(debugger, ctx.image().path(), process.pid());
        until_requester_gone(&mut self.reply, attach).await?;
        Ok(())
    }

    /// Hands the requester its ends of the data sockets.
    fn send_reply(&mut self) -> Result<()> {
        let pid = std::process::id();
        let handles = self
            .requester_sockets
            .drain(..)
            .map(|fd| channel::transfer_to_process(fd, pid))
            .collect();
        let reply = self.reply.take().ok_or(Error::RequesterGone)?;
        if reply.send(Ok(handles)) {
            Ok(())
        } else {
            Err(Error::RequesterGone)
        }
    }

    /// Sends the start message and its handles over the control channel.
    ///
    /// Handle order: loader sockets, runtime image, then (macOS) a
    /// temporary file the loader may map executable.
    fn send_start(&mut self) -> Result<()> {
        let pid = self.process.as_ref().map_or(0, LaunchedProcess::pid);
        let mut handles: Vec<TransferableHandle> = self
            .loader_sockets
            .drain(..)
            .map(|fd| channel::transfer_to_process(fd, pid))
            .collect();
        let image = channel::share_with_process(self.ctx.image().handle().as_fd(), pid)
            .map_err(Error::StartFailed)?;
        handles.push(image);
        #[cfg(target_os = "macos")]
        {
            let scratch = tempfile::tempfile_in("/tmp").map_err(Error::StartFailed)?;
            handles.push(channel::transfer_to_process(OwnedFd::from(scratch), pid));
        }

        let config = self.ctx.config();
        let params = StartParams::new(
            self.ctx.cache().session_key().to_vec(),
            config.version_string(),
            config.exception_handling_enabled(),
            u32::try_from(handles.len()).unwrap_or(u32::MAX),
        );
        let frame = nacl_proto::frame(&HostMsg::Start(params)).map_err(Error::StartFailed)?;
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| Error::StartFailed(io::ErrorKind::NotConnected.into()))?;
        // The socket is still blocking; the frame fits its send buffer.
        channel::send_with_handles(control, &frame, &handles).map_err(Error::StartFailed)?;
        tracing::debug!(url = %self.url, pid, handles = handles.len(), "start message sent");
        Ok(())
    }

    /// Answers the loader's validation cache queries until it disconnects,
    /// then reaps it.
    async fn serve(&mut self) {
        let Some(control) = self.control.take() else {
            return;
        };
        let stream = match control
            .set_nonblocking(true)
            .and_then(|()| tokio::net::UnixStream::from_std(control))
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(url = %self.url, error = %e, "failed to register control channel");
                self.kill();
                return;
            }
        };
        let (mut rd, mut wr) = stream.into_split();

        loop {
            let msg = match nacl_proto::recv::<LoaderMsg, _>(&mut rd).await {
                Ok(msg) => msg,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    tracing::error!(url = %self.url, error = %e, "bad message from loader");
                    self.kill();
                    break;
                }
            };
            let cache = self.ctx.cache();
            match msg {
                LoaderMsg::QueryKnownToValidate { signature } => {
                    let known = cache.query(&signature);
                    if let Err(e) = nacl_proto::send(&mut wr, &HostMsg::KnownToValidate(known)).await {
                        tracing::warn!(url = %self.url, error = %e, "failed to answer loader");
                        break;
                    }
                }
                LoaderMsg::SetKnownToValidate { signature } => cache.record(&signature),
                other => {
                    tracing::warn!(url = %self.url, ?other, "unexpected message from loader");
                }
            }
        }
        self.reap().await;
    }

    /// Waits for the loader to exit and logs its status.
    async fn reap(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        let pid = process.pid();
        match process.wait().await {
            Ok(Some(status)) => log_exit(pid, status),
            Ok(None) => {}
            Err(e) => tracing::warn!(pid, error = %e, "failed to wait for loader"),
        }
    }

    /// `* → Failed`: replies with `err` if no reply was sent, then kills
    /// the loader. Sockets close when the host is dropped.
    fn fail(&mut self, err: Error) {
        tracing::error!(url = %self.url, state = %self.state, error = %err, "loader launch failed");
        self.state = HostState::Failed;
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(err));
        }
        self.kill();
    }

    /// Kills the loader if one was spawned.
    fn kill(&mut self) {
        if let Some(process) = self.process.as_mut() {
            process.kill();
        }
    }

    /// Records a state change.
    fn transition(&mut self, next: HostState) {
        tracing::debug!(url = %self.url, from = %self.state, to = %next, "host state");
        self.state = next;
    }
}

impl Drop for ProcessHost {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            tracing::debug!(url = %self.url, state = %self.state, "host dropped before replying");
            let _ = reply.send(Err(Error::Terminated(self.state)));
        }
    }
}

/// Awaits `fut` unless the requester stops waiting first.
async fn until_requester_gone<T>(
    reply: &mut Option<PendingReply>,
    fut: impl Future<Output = T>,
) -> Result<T> {
    let Some(pending) = reply.as_mut() else {
        return Err(Error::RequesterGone);
    };
    tokio::select! {
        out = fut => Ok(out),
        () = pending.closed() => Err(Error::RequesterGone),
    }
}

/// Logs the loader's exit the way a crash report would want it.
fn log_exit(pid: u32, status: ExitStatus) {
    use std::os::unix::process::ExitStatusExt;

    let code = status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1);
    if code == 0 {
        tracing::info!(pid, "loader exited with status {code} ({code:#x})");
    } else {
        tracing::error!(pid, "loader exited with status {code} ({code:#x})");
    }
}
