//! Broker-mediated spawning.
//!
//! The broker is a task that performs spawns on behalf of process hosts and
//! answers each with a launch notification. It is started on the first
//! launch and stops once it has no pending launches and no live loaders.
//! Loaders report their death to the broker when their [`LaunchedProcess`]
//! is dropped.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use super::{LaunchCommand, LaunchedProcess, Launcher, PendingLaunch};
use crate::error::{Error, Result};

/// Requests handled by the broker task.
#[derive(Debug)]
enum BrokerMsg {
    /// Spawn a loader and notify `reply`.
    Launch {
        /// What to spawn.
        command: LaunchCommand,
        /// Dropped unanswered if the spawn fails.
        reply: oneshot::Sender<LaunchedProcess>,
    },
    /// A loader launched by this broker went away.
    LoaderDied,
}

/// Bookkeeping shared between the launcher and its task.
#[derive(Debug, Default)]
struct BrokerState {
    /// Sender of the running broker task, `None` when stopped.
    tx: Option<mpsc::UnboundedSender<BrokerMsg>>,
    /// Channel ids of launches not yet answered.
    pending: HashSet<String>,
    /// Live loaders launched by the broker.
    running: usize,
}

/// Tells the broker its loader died when dropped.
#[derive(Debug)]
pub(super) struct Link {
    /// Sender of the broker task that launched the loader.
    tx: mpsc::UnboundedSender<BrokerMsg>,
}

impl Drop for Link {
    fn drop(&mut self) {
        let _ = self.tx.send(BrokerMsg::LoaderDied);
    }
}

/// Launcher that delegates spawns to a lazily started broker task.
#[derive(Debug, Clone, Default)]
pub struct BrokerLauncher {
    /// Shared with the broker task.
    state: Arc<Mutex<BrokerState>>,
}

impl BrokerLauncher {
    /// Creates a launcher; the broker starts on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while the broker task is running.
    pub fn is_running(&self) -> bool {
        self.lock().tx.is_some()
    }

    /// Number of launches awaiting their notification.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Locks the shared state; a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the broker sender, starting the task if needed.
    fn sender(&self, state: &mut BrokerState) -> Result<mpsc::UnboundedSender<BrokerMsg>> {
        if let Some(tx) = &state.tx {
            return Ok(tx.clone());
        }
        let rt = Handle::try_current()
            .map_err(|_| Error::LaunchFailed(io::Error::other("no async runtime for the broker")))?;
        let (tx, rx) = mpsc::unbounded_channel();
        rt.spawn(run(Arc::clone(&self.state), tx.clone(), rx));
        tracing::debug!("broker started");
        state.tx = Some(tx.clone());
        Ok(tx)
    }
}

impl Launcher for BrokerLauncher {
    fn launch(&self, command: LaunchCommand) -> Result<PendingLaunch> {
        let mut state = self.lock();
        let tx = self.sender(&mut state)?;
        let channel_id = command.channel_id.clone();
        let (reply, pending) = PendingLaunch::channel(channel_id.clone());
        state.pending.insert(channel_id);
        tx.send(BrokerMsg::Launch { command, reply }).map_err(|_| {
            Error::LaunchFailed(io::Error::new(io::ErrorKind::BrokenPipe, "broker stopped"))
        })?;
        Ok(pending)
    }
}

/// The broker loop.
async fn run(
    state: Arc<Mutex<BrokerState>>,
    tx: mpsc::UnboundedSender<BrokerMsg>,
    mut rx: mpsc::UnboundedReceiver<BrokerMsg>,
) {
    while let Some(msg) = rx.recv().await {
        let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
        match msg {
            BrokerMsg::Launch { command, reply } => {
                let channel_id = command.channel_id.clone();
                st.pending.remove(&channel_id);
                match super::spawn(command) {
                    Ok(process) => {
                        st.running += 1;
                        let process = process.with_broker(Link { tx: tx.clone() });
                        // A host that gave up drops the process, which kills it.
                        let _ = reply.send(process);
                    }
                    Err(e) => {
                        tracing::error!(channel = %channel_id, error = %e, "broker failed to launch loader");
                    }
                }
            }
            BrokerMsg::LoaderDied => {
                st.running = st.running.saturating_sub(1);
            }
        }
        if st.pending.is_empty() && st.running == 0 {
            st.tx = None;
            tracing::debug!("broker idle, stopping");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::channel;
    use crate::launcher::{CommandLine, LaunchFlags};

    fn command(program: &str, channel_id: &str) -> LaunchCommand {
        let (_host, loader) = channel::create_pair().unwrap();
        let line = CommandLine::for_loader(Path::new(program), channel_id, &LaunchFlags::default());
        LaunchCommand::new(line, channel_id, loader)
    }

    async fn wait_stopped(broker: &BrokerLauncher) {
        for _ in 0..200 {
            if !broker.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("broker still running");
    }

    #[test]
    fn launch_needs_a_runtime() {
        let broker = BrokerLauncher::new();
        let err = broker.launch(command("/bin/true", "x")).unwrap_err();
        assert!(matches!(err, Error::LaunchFailed(_)));
        assert!(!broker.is_running());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn broker_stops_after_loader_dies() {
        let broker = BrokerLauncher::new();
        let pending = broker.launch(command("/bin/true", "b1")).unwrap();
        assert!(broker.is_running());

        let mut process = pending.launched().await.unwrap();
        assert!(process.pid() > 0);
        assert_eq!(broker.pending(), 0);
        let _ = process.wait().await.unwrap();
        assert!(broker.is_running());

        drop(process);
        wait_stopped(&broker).await;
    }

    #[tokio::test]
    async fn failed_spawn_loses_the_notification() {
        let broker = BrokerLauncher::new();
        let pending = broker.launch(command("/nonexistent/loader", "b2")).unwrap();
        match pending.launched().await {
            Err(Error::LaunchNotificationLost { channel }) => assert_eq!(channel, "b2"),
            other => panic!("unexpected {other:?}"),
        }
        wait_stopped(&broker).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn broker_restarts_on_demand() {
        let broker = BrokerLauncher::new();
        let p = broker.launch(command("/bin/true", "r1")).unwrap();
        drop(p.launched().await.unwrap());
        wait_stopped(&broker).await;

        let p = broker.launch(command("/bin/true", "r2")).unwrap();
        assert!(broker.is_running());
        drop(p.launched().await.unwrap());
        wait_stopped(&broker).await;
    }
}
