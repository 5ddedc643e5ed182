//! `nacl-host launch`: start one loader and exercise its data sockets.

use std::num::NonZeroUsize;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use nacl_host::{
    HostConfig, HostContext, LaunchMode, LaunchRequest, LaunchTicket, TransferableHandle,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Arguments for `nacl-host launch`.
///
/// Usage: `nacl-host launch [OPTIONS] URL`
#[derive(clap::Args)]
pub struct LaunchArgs {
    /// Identifies the content the loader runs (used for logging).
    url: String,

    /// Number of data sockets to create (0-8).
    #[arg(short = 'n', long, default_value_t = 1)]
    sockets: usize,

    /// Loader binary (default: nacl-loader next to this executable).
    #[arg(long)]
    loader: Option<PathBuf>,

    /// Directory holding nacl_irt_<arch>.nexe.
    #[arg(long)]
    install_dir: Option<PathBuf>,

    /// Runtime image path, used verbatim.
    #[arg(long)]
    irt: Option<PathBuf>,

    /// Debugger command to attach to the loader (Linux).
    #[arg(long)]
    nacl_gdb: Option<String>,

    /// Wrapper command prepended to the loader (e.g. "valgrind -q").
    #[arg(long)]
    loader_prefix: Option<String>,

    /// Enable untrusted hardware exception handling.
    #[arg(long)]
    exception_handling: bool,

    /// Suppress error dialogs in the loader.
    #[arg(long)]
    no_error_dialogs: bool,

    /// Spawn through the broker instead of directly.
    #[arg(long)]
    broker: bool,

    /// Validation cache capacity.
    #[arg(long, default_value = "200")]
    cache_size: NonZeroUsize,
}

impl LaunchArgs {
    pub async fn run(self) -> Result<()> {
        let config = self.config();
        let ctx = HostContext::new(config);
        ctx.early_startup();

        let mut ticket = ctx.launch(LaunchRequest::new(self.url.clone(), self.sockets));
        let reply = tokio::select! {
            reply = ticket.reply() => Some(reply),
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(reply) = reply else {
            return interrupt(&mut ticket).await;
        };
        let handles = reply.with_context(|| format!("launch of {} failed", self.url))?;
        println!("launched {} with {} socket(s)", self.url, handles.len());

        for (i, handle) in handles.into_iter().enumerate() {
            echo_check(i, handle)
                .await
                .with_context(|| format!("echo check on socket {i} failed"))?;
        }

        let interrupted = tokio::select! {
            () = ticket.finished() => false,
            _ = tokio::signal::ctrl_c() => true,
        };
        if interrupted {
            return interrupt(&mut ticket).await;
        }
        let stats = ctx.cache().stats();
        println!(
            "validation cache: {} queries, {} hits, {} sets",
            stats.queries, stats.hits, stats.sets
        );
        Ok(())
    }

    /// Maps the flags onto a [`HostConfig`].
    fn config(&self) -> HostConfig {
        let mut config = HostConfig::from_env()
            .no_error_dialogs(self.no_error_dialogs)
            .cache_capacity(self.cache_size);
        if self.exception_handling {
            config = config.exception_handling(true);
        }
        if let Some(loader) = &self.loader {
            config = config.loader(loader);
        }
        if let Some(dir) = &self.install_dir {
            config = config.install_dir(dir);
        }
        if let Some(irt) = &self.irt {
            config = config.irt_path(irt);
        }
        if let Some(gdb) = &self.nacl_gdb {
            config = config.debugger(gdb);
        }
        if let Some(prefix) = &self.loader_prefix {
            config = config.loader_prefix(prefix);
        }
        if self.broker {
            config = config.launch_mode(LaunchMode::Broker);
        }
        config
    }
}

/// Kills the loader and reports the interruption.
async fn interrupt(ticket: &mut LaunchTicket) -> Result<()> {
    tracing::warn!("interrupted, killing loader");
    ticket.abort();
    ticket.finished().await;
    bail!("interrupted")
}

/// Sends a line through the socket and expects the loader to echo it.
async fn echo_check(index: usize, handle: TransferableHandle) -> Result<()> {
    let std_stream = StdUnixStream::from(handle.into_owned_fd());
    std_stream.set_nonblocking(true)?;
    let mut stream = UnixStream::from_std(std_stream)?;

    let line = format!("ping {index}\n");
    stream.write_all(line.as_bytes()).await?;
    let mut echo = vec![0u8; line.len()];
    stream.read_exact(&mut echo).await.context("no echo")?;
    if echo != line.as_bytes() {
        bail!("echo mismatch: {:?}", String::from_utf8_lossy(&echo));
    }
    println!("socket {index}: echo ok");
    Ok(())
}
