//! Application context shared by every process host.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};

use crate::cache::ValidationCache;
use crate::channel::TransferableHandle;
use crate::config::{HostConfig, LaunchMode};
use crate::error::{Error, Result};
use crate::host::{PendingReply, ProcessHost, Reply};
use crate::image::{self, RuntimeImage};
use crate::launcher::{BrokerLauncher, DirectLauncher, Launcher};
use crate::state::HostState;

/// A request to launch one loader.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct LaunchRequest {
    /// Identifies the content the loader runs; used for logging.
    pub url: String,
    /// Number of data sockets to create, at most
    /// [`MAX_SOCKETS`](nacl_proto::MAX_SOCKETS).
    pub socket_count: usize,
}

impl LaunchRequest {
    /// Creates a request.
    pub fn new(url: impl Into<String>, socket_count: usize) -> Self {
        Self {
            url: url.into(),
            socket_count,
        }
    }
}

/// Handle on a launch in progress.
///
/// Dropping the ticket before the reply arrives makes the host give up with
/// [`Error::RequesterGone`]. Once replied, the host keeps serving its loader
/// until [`abort`](Self::abort) or the loader exits.
#[derive(Debug)]
pub struct LaunchTicket {
    /// Receives the single reply.
    reply: Option<oneshot::Receiver<Reply>>,
    /// The host task, until it has been awaited.
    task: Option<JoinHandle<()>>,
    /// Aborts the host task.
    abort_handle: AbortHandle,
}

impl LaunchTicket {
    /// Waits for the reply: the requester's socket ends, or why there are
    /// none. The reply can be taken only once.
    ///
    /// Cancel-safe: dropping the future before it completes leaves the reply
    /// in the ticket.
    pub async fn reply(&mut self) -> Result<Vec<TransferableHandle>> {
        let rx = self.reply.as_mut().ok_or(Error::Terminated(HostState::Failed))?;
        let reply = rx.await;
        self.reply = None;
        reply.unwrap_or(Err(Error::Terminated(HostState::Failed)))
    }

    /// Destroys the host, killing its loader. A reply not yet sent becomes
    /// [`Error::Terminated`].
    pub fn abort(&self) {
        self.abort_handle.abort();
    }

    /// Waits until the host is done: the loader exited, the launch failed or
    /// the host was aborted. Cancel-safe; returns at once when already done.
    pub async fn finished(&mut self) {
        let Some(task) = self.task.as_mut() else {
            return;
        };
        let joined = task.await;
        self.task = None;
        if let Err(e) = joined {
            if e.is_panic() {
                tracing::error!(error = %e, "process host panicked");
            }
        }
    }
}

/// Owns the process-wide state: validation cache, runtime image, launcher
/// and configuration.
#[derive(Debug)]
pub struct HostContext {
    /// Configuration shared by every launch.
    config: HostConfig,
    /// Signatures known to validate.
    cache: ValidationCache,
    /// The runtime image, opened on first use.
    image: Arc<RuntimeImage>,
    /// Spawn strategy.
    launcher: Arc<dyn Launcher>,
}

impl HostContext {
    /// Creates a context with the launcher selected by the configuration.
    pub fn new(config: HostConfig) -> Arc<Self> {
        let launcher: Arc<dyn Launcher> = match config.launch_mode {
            LaunchMode::Direct => Arc::new(DirectLauncher),
            LaunchMode::Broker => Arc::new(BrokerLauncher::new()),
        };
        Self::with_launcher(config, launcher)
    }

    /// Creates a context with a custom launcher.
    pub fn with_launcher(config: HostConfig, launcher: Arc<dyn Launcher>) -> Arc<Self> {
        let path = image::resolve_path(config.irt_override.as_deref(), config.install_dir.as_deref());
        Arc::new(Self {
            cache: ValidationCache::new(config.cache_capacity),
            image: Arc::new(RuntimeImage::new(path)),
            launcher,
            config,
        })
    }

    /// Starts opening the runtime image ahead of the first launch.
    ///
    /// Call from inside a tokio runtime; returns `false` otherwise.
    pub fn early_startup(&self) -> bool {
        tracing::debug!(path = ?self.image.path(), "prefetching runtime image");
        self.image.ensure_open()
    }

    /// Launches a loader for `request` on a new host task.
    ///
    /// # Panics
    ///
    /// If called outside a tokio runtime.
    pub fn launch(self: &Arc<Self>, request: LaunchRequest) -> LaunchTicket {
        let (reply, rx) = PendingReply::channel();
        tracing::info!(url = %request.url, sockets = request.socket_count, "launch requested");
        let host = ProcessHost::new(Arc::clone(self), request.url, request.socket_count, reply);
        let task = tokio::spawn(host.run());
        LaunchTicket {
            reply: Some(rx),
            abort_handle: task.abort_handle(),
            task: Some(task),
        }
    }

    /// Host configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Validation cache.
    pub fn cache(&self) -> &ValidationCache {
        &self.cache
    }

    /// Runtime image.
    pub fn image(&self) -> &Arc<RuntimeImage> {
        &self.image
    }

    /// Spawn strategy.
    pub fn launcher(&self) -> &Arc<dyn Launcher> {
        &self.launcher
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nacl_proto::{HostMsg, LoaderMsg, MAX_SOCKETS};

    use super::*;
    use crate::channel;
    use crate::launcher::{LaunchCommand, LaunchedProcess, PendingLaunch};

    /// What the recording launcher does with a launch.
    #[derive(Debug, Clone, Copy)]
    enum Outcome {
        /// Report a detached process at once.
        Launch,
        /// Drop the notification sender.
        Lose,
        /// Keep the sender forever.
        Hang,
    }

    /// Launcher that spawns nothing and keeps the loader's control end.
    #[derive(Debug)]
    struct Recording {
        outcome: Outcome,
        launches: AtomicUsize,
        controls: Mutex<Vec<OwnedFd>>,
        hung: Mutex<Vec<oneshot::Sender<LaunchedProcess>>>,
    }

    impl Recording {
        fn new(outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                launches: AtomicUsize::new(0),
                controls: Mutex::new(Vec::new()),
                hung: Mutex::new(Vec::new()),
            })
        }

        fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        fn take_control(&self) -> UnixStream {
            UnixStream::from(self.controls.lock().unwrap().pop().unwrap())
        }
    }

    impl Launcher for Recording {
        fn launch(&self, command: LaunchCommand) -> Result<PendingLaunch> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            self.controls.lock().unwrap().push(command.control);
            let (tx, pending) = PendingLaunch::channel(command.channel_id);
            match self.outcome {
                Outcome::Launch => {
                    tx.send(LaunchedProcess::detached(4242)).unwrap();
                }
                Outcome::Lose => drop(tx),
                Outcome::Hang => self.hung.lock().unwrap().push(tx),
            }
            Ok(pending)
        }
    }

    fn image_file() -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"\x7fELF irt").unwrap();
        f
    }

    fn context(image: Option<&std::path::Path>, outcome: Outcome) -> (Arc<HostContext>, Arc<Recording>) {
        let mut config = HostConfig::default().loader("/opt/nacl/nacl-loader");
        config = match image {
            Some(path) => config.irt_path(path),
            None => config.irt_path("/nonexistent/nacl_irt.nexe"),
        };
        let rec = Recording::new(outcome);
        let launcher: Arc<dyn Launcher> = Arc::<Recording>::clone(&rec);
        (HostContext::with_launcher(config, launcher), rec)
    }

    /// Receives the start message on the loader's control end.
    async fn recv_start(control: UnixStream) -> (HostMsg, Vec<OwnedFd>, UnixStream) {
        tokio::task::spawn_blocking(move || {
            let (payload, fds) = channel::recv_with_handles(&control).unwrap();
            (nacl_proto::from_payload(&payload).unwrap(), fds, control)
        })
        .await
        .unwrap()
    }

    fn extra_handles() -> usize {
        usize::from(cfg!(target_os = "macos"))
    }

    #[tokio::test]
    async fn two_sockets_end_to_end() {
        let image = image_file();
        let (ctx, rec) = context(Some(image.path()), Outcome::Launch);

        let mut ticket = ctx.launch(LaunchRequest::new("https://example.test/app.nmf", 2));
        let handles = ticket.reply().await.unwrap();
        assert_eq!(handles.len(), 2);
        assert_eq!(rec.launches(), 1);

        let (msg, fds, control) = recv_start(rec.take_control()).await;
        let HostMsg::Start(params) = msg else {
            panic!("expected start, got {msg:?}");
        };
        assert_eq!(params.validation_cache_key, ctx.cache().session_key());
        assert_eq!(params.version, ctx.config().version_string());
        assert_eq!(params.handle_count as usize, 3 + extra_handles());
        assert_eq!(fds.len(), 3 + extra_handles());

        // Requester end i talks to loader end i.
        let mut fds = fds.into_iter();
        for handle in handles {
            let mut ours = UnixStream::from(handle.into_owned_fd());
            let mut theirs = UnixStream::from(fds.next().unwrap());
            ours.write_all(b"hi").unwrap();
            let mut buf = [0u8; 2];
            theirs.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hi");
        }
        // Then the image.
        let mut irt = std::fs::File::from(fds.next().unwrap());
        let mut contents = Vec::new();
        irt.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"\x7fELF irt");

        drop(control);
        ticket.finished().await;
    }

    #[tokio::test]
    async fn every_allowed_count_succeeds() {
        let image = image_file();
        let (ctx, rec) = context(Some(image.path()), Outcome::Launch);
        for n in 0..=MAX_SOCKETS {
            let mut ticket = ctx.launch(LaunchRequest::new("app", n));
            assert_eq!(ticket.reply().await.unwrap().len(), n);
            let (_, fds, control) = recv_start(rec.take_control()).await;
            assert_eq!(fds.len(), n + 1 + extra_handles());
            drop(control);
            ticket.finished().await;
        }
        assert_eq!(rec.launches(), MAX_SOCKETS + 1);
        assert_eq!(ctx.image().open_attempts(), 1);
    }

    #[tokio::test]
    async fn too_many_sockets_never_launches() {
        let image = image_file();
        let (ctx, rec) = context(Some(image.path()), Outcome::Launch);
        let mut ticket = ctx.launch(LaunchRequest::new("app", MAX_SOCKETS + 1));
        match ticket.reply().await {
            Err(Error::TooManySockets { requested, max }) => {
                assert_eq!(requested, 9);
                assert_eq!(max, MAX_SOCKETS);
            }
            other => panic!("unexpected {other:?}"),
        }
        ticket.finished().await;
        assert_eq!(rec.launches(), 0);
    }

    #[tokio::test]
    async fn missing_image_fails_after_launch() {
        let (ctx, rec) = context(None, Outcome::Launch);
        let mut ticket = ctx.launch(LaunchRequest::new("app", 1));
        assert!(matches!(
            ticket.reply().await,
            Err(Error::RuntimeImageUnavailable { .. })
        ));
        ticket.finished().await;
        assert_eq!(rec.launches(), 1);

        // The loader's control channel is closed without a start message.
        let control = rec.take_control();
        let err = tokio::task::spawn_blocking(move || channel::recv_with_handles(&control))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn lost_notification_fails_the_launch() {
        let image = image_file();
        let (ctx, _rec) = context(Some(image.path()), Outcome::Lose);
        let mut ticket = ctx.launch(LaunchRequest::new("app", 1));
        assert!(matches!(
            ticket.reply().await,
            Err(Error::LaunchNotificationLost { .. })
        ));
    }

    #[tokio::test]
    async fn abort_replies_terminated_once() {
        let image = image_file();
        let (ctx, rec) = context(Some(image.path()), Outcome::Hang);
        let mut ticket = ctx.launch(LaunchRequest::new("app", 1));
        while rec.launches() == 0 {
            tokio::task::yield_now().await;
        }
        ticket.abort();
        match ticket.reply().await {
            Err(Error::Terminated(state)) => assert_eq!(state, HostState::Launching),
            other => panic!("unexpected {other:?}"),
        }
        assert!(ticket.reply().await.is_err());
    }

    #[tokio::test]
    async fn gone_requester_stops_the_host() {
        let image = image_file();
        let (ctx, rec) = context(Some(image.path()), Outcome::Hang);
        let mut ticket = ctx.launch(LaunchRequest::new("app", 1));
        while rec.launches() == 0 {
            tokio::task::yield_now().await;
        }
        drop(ticket.reply.take());
        ticket.finished().await;
    }

    #[tokio::test]
    async fn gone_requester_stops_the_image_wait() {
        // A FIFO without a writer blocks the image open indefinitely.
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("nacl_irt.nexe");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::S_IRWXU).unwrap();
        let (ctx, rec) = context(Some(fifo.as_path()), Outcome::Launch);

        let mut ticket = ctx.launch(LaunchRequest::new("app", 1));
        while rec.launches() == 0 {
            tokio::task::yield_now().await;
        }
        drop(ticket.reply.take());
        ticket.finished().await;
        assert!(!ctx.image().is_open());

        // The loader never got a start message.
        let control = rec.take_control();
        let err = tokio::task::spawn_blocking(move || channel::recv_with_handles(&control))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

        // Release the blocked open so the runtime can shut down.
        tokio::task::spawn_blocking(move || std::fs::OpenOptions::new().write(true).open(fifo))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn abort_after_reply_closes_the_control_channel() {
        let image = image_file();
        let (ctx, rec) = context(Some(image.path()), Outcome::Launch);
        let mut ticket = ctx.launch(LaunchRequest::new("app", 1));
        ticket.reply().await.unwrap();
        let (_, _, control) = recv_start(rec.take_control()).await;

        ticket.abort();
        ticket.finished().await;
        // Done already; a second wait returns at once.
        ticket.finished().await;

        let mut buf = [0u8; 1];
        let n = tokio::task::spawn_blocking(move || (&control).read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn loader_uses_the_validation_cache() {
        let image = image_file();
        let (ctx, rec) = context(Some(image.path()), Outcome::Launch);
        let mut ticket = ctx.launch(LaunchRequest::new("app", 0));
        ticket.reply().await.unwrap();
        let (_, _, mut control) = recv_start(rec.take_control()).await;

        let answers = tokio::task::spawn_blocking(move || {
            let sig = b"signature".to_vec();
            let query = |c: &mut UnixStream| {
                nacl_proto::encode(c, &LoaderMsg::QueryKnownToValidate { signature: sig.clone() })
                    .unwrap();
                nacl_proto::decode::<HostMsg>(c).unwrap()
            };
            let before = query(&mut control);
            nacl_proto::encode(
                &mut control,
                &LoaderMsg::SetKnownToValidate {
                    signature: b"signature".to_vec(),
                },
            )
            .unwrap();
            let after = query(&mut control);
            (before, after)
        })
        .await
        .unwrap();

        assert_eq!(answers.0, HostMsg::KnownToValidate(false));
        assert_eq!(answers.1, HostMsg::KnownToValidate(true));
        ticket.finished().await;
        assert_eq!(ctx.cache().stats().sets, 1);
    }

    #[tokio::test]
    async fn early_startup_prefetches_the_image() {
        let image = image_file();
        let (ctx, _rec) = context(Some(image.path()), Outcome::Launch);
        assert!(ctx.early_startup());
        assert!(ctx.image().ensure_open_then().await);
        assert_eq!(ctx.image().open_attempts(), 1);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn direct_launch_of_a_real_process() {
        let image = image_file();
        let config = HostConfig::default().loader("/bin/true").irt_path(image.path());
        let ctx = HostContext::new(config);
        let mut ticket = ctx.launch(LaunchRequest::new("app", 1));
        // `/bin/true` may exit before or after the start message is sent.
        match ticket.reply().await {
            Ok(handles) => assert_eq!(handles.len(), 1),
            Err(e) => panic!("unexpected {e:?}"),
        }
        ticket.finished().await;
    }
}
