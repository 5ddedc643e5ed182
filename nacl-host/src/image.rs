//! The shared runtime image every loader maps at startup.
//!
//! The path is known as soon as the [`RuntimeImage`] exists; the read-only
//! handle is opened once, off the caller's task, on tokio's blocking pool.
//! Whatever that single attempt produces (a handle or nothing) is kept for
//! the lifetime of the value. A failed open is not retried.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::runtime::Handle;
use tokio::sync::Notify;

/// Architecture tag embedded in the runtime image file name.
#[cfg(target_arch = "x86_64")]
pub const ARCH: &str = "x86_64";
/// Architecture tag embedded in the runtime image file name.
#[cfg(target_arch = "x86")]
pub const ARCH: &str = "x86_32";
/// Architecture tag embedded in the runtime image file name.
#[cfg(target_arch = "arm")]
pub const ARCH: &str = "arm";
/// Architecture tag embedded in the runtime image file name.
#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "arm")))]
pub const ARCH: &str = std::env::consts::ARCH;

/// File name of the runtime image for this architecture.
pub fn file_name() -> String {
    format!("nacl_irt_{ARCH}.nexe")
}

/// Resolves the runtime image path: the override verbatim if present,
/// otherwise [`file_name`] inside `install_dir`.
pub fn resolve_path(irt_override: Option<&Path>, install_dir: Option<&Path>) -> Option<PathBuf> {
    match (irt_override, install_dir) {
        (Some(path), _) => Some(path.to_path_buf()),
        (None, Some(dir)) => Some(dir.join(file_name())),
        (None, None) => None,
    }
}

/// Read-only handle to the runtime image, opened at most once.
#[derive(Debug)]
pub struct RuntimeImage {
    /// Resolved path, `None` if no install directory was known.
    path: Option<PathBuf>,
    /// Set exactly once by the open attempt; `None` inside means it failed.
    file: OnceLock<Option<File>>,
    /// In-flight flag: the first `ensure_open` wins.
    started: AtomicBool,
    /// Wakes tasks waiting in [`ensure_open_then`](Self::ensure_open_then).
    ready: Notify,
    /// Underlying open attempts performed.
    attempts: AtomicUsize,
}

impl RuntimeImage {
    /// Creates an unopened image handle for `path`.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            file: OnceLock::new(),
            started: AtomicBool::new(false),
            ready: Notify::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Resolved path of the image; available before it is opened.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Kicks off the open if nobody has yet. Does not wait.
    ///
    /// Returns whether an attempt is scheduled or already finished, not
    /// whether it succeeds. Only returns `false` outside a tokio runtime.
    pub fn ensure_open(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            return true;
        }
        let Ok(rt) = Handle::try_current() else {
            self.started.store(false, Ordering::Release);
            return false;
        };
        let this = Arc::clone(self);
        drop(rt.spawn_blocking(move || this.open_now()));
        true
    }

    /// Ensures the open was attempted and waits for it to finish.
    ///
    /// Returns [`is_open`](Self::is_open) once the attempt has completed.
    pub async fn ensure_open_then(self: &Arc<Self>) -> bool {
        let notified = self.ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(done) = self.file.get() {
            return done.is_some();
        }
        if !self.ensure_open() {
            return false;
        }
        notified.await;
        self.is_open()
    }

    /// Returns `true` if the image has been opened successfully.
    pub fn is_open(&self) -> bool {
        matches!(self.file.get(), Some(Some(_)))
    }

    /// Returns `true` once the open attempt has completed, either way.
    pub fn is_settled(&self) -> bool {
        self.file.get().is_some()
    }

    /// The open handle.
    ///
    /// # Panics
    ///
    /// If called while [`is_open`](Self::is_open) is `false`.
    #[allow(clippy::panic)]
    pub fn handle(&self) -> &File {
        match self.file.get() {
            Some(Some(file)) => file,
            _ => panic!("runtime image handle requested before it was opened"),
        }
    }

    /// Number of underlying open attempts (0 or 1).
    pub fn open_attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    /// Performs the blocking open and publishes the result.
    fn open_now(&self) {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        let file = match &self.path {
            Some(path) => match File::open(path) {
                Ok(file) => {
                    tracing::debug!(path = %path.display(), "runtime image opened");
                    Some(file)
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "failed to open runtime image");
                    None
                }
            },
            None => {
                tracing::error!("failed to locate the runtime image directory");
                None
            }
        };
        let _ = self.file.set(file);
        self.ready.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn image_file() -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"\x7fELF runtime").unwrap();
        f
    }

    #[test]
    fn override_wins_over_install_dir() {
        let p = resolve_path(Some(Path::new("/x/irt.nexe")), Some(Path::new("/opt")));
        assert_eq!(p.as_deref(), Some(Path::new("/x/irt.nexe")));
    }

    #[test]
    fn install_dir_gets_arch_file_name() {
        let p = resolve_path(None, Some(Path::new("/opt/nacl"))).unwrap();
        assert_eq!(p, Path::new("/opt/nacl").join(format!("nacl_irt_{ARCH}.nexe")));
        assert!(resolve_path(None, None).is_none());
    }

    #[tokio::test]
    async fn opens_existing_image() {
        let f = image_file();
        let image = Arc::new(RuntimeImage::new(Some(f.path().to_path_buf())));
        assert!(!image.is_open());
        assert!(image.ensure_open_then().await);
        assert!(image.is_open());
        assert!(image.handle().metadata().unwrap().len() > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_callers_share_one_attempt() {
        let f = image_file();
        let image = Arc::new(RuntimeImage::new(Some(f.path().to_path_buf())));

        let (a, b) = tokio::join!(image.ensure_open_then(), image.ensure_open_then());
        assert!(a && b);
        assert!(image.ensure_open());
        assert!(image.ensure_open_then().await);
        assert_eq!(image.open_attempts(), 1);
    }

    #[tokio::test]
    async fn failed_open_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.nexe");
        let image = Arc::new(RuntimeImage::new(Some(path.clone())));

        assert!(!image.ensure_open_then().await);
        assert!(image.is_settled());

        // The file appearing later does not help: the failure is permanent.
        std::fs::write(&path, b"late").unwrap();
        assert!(image.ensure_open());
        assert!(!image.ensure_open_then().await);
        assert_eq!(image.open_attempts(), 1);
    }

    #[tokio::test]
    async fn unresolved_path_fails() {
        let image = Arc::new(RuntimeImage::new(None));
        assert!(!image.ensure_open_then().await);
        assert_eq!(image.open_attempts(), 1);
    }

    #[test]
    fn ensure_open_needs_a_runtime() {
        let image = Arc::new(RuntimeImage::new(None));
        assert!(!image.ensure_open());
        assert_eq!(image.open_attempts(), 0);
    }

    #[test]
    #[should_panic(expected = "before it was opened")]
    fn handle_before_open_panics() {
        let image = RuntimeImage::new(None);
        let _ = image.handle();
    }
}
