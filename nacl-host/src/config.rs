//! Host configuration.

use std::ffi::OsString;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use crate::cache::DEFAULT_CAPACITY;

/// Environment variable overriding the runtime image path.
pub const ENV_IRT_LIBRARY: &str = "NACL_IRT_LIBRARY";

/// Environment variable enabling untrusted hardware exception handling.
pub const ENV_EXCEPTION_HANDLING: &str = "NACL_UNTRUSTED_EXCEPTION_HANDLING";

/// File name of the reference loader binary.
pub const LOADER_BINARY: &str = "nacl-loader";

/// How loader processes get spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum LaunchMode {
    /// Spawn directly from the host.
    #[default]
    Direct,
    /// Hand the spawn to a broker task and wait for its notification.
    Broker,
}

/// Configuration shared by every process host of one
/// [`HostContext`](crate::HostContext).
///
/// Defaults: loader next to the current executable, runtime image looked up
/// in the current executable's directory, 200 cached signatures, direct
/// launch, no debugger.
#[derive(Debug, Clone)]
#[must_use = "a HostConfig does nothing until handed to a HostContext"]
pub struct HostConfig {
    /// Loader binary to spawn.
    pub(crate) loader: Option<PathBuf>,
    /// Directory holding `nacl_irt_<arch>.nexe`.
    pub(crate) install_dir: Option<PathBuf>,
    /// Verbatim runtime image path, bypassing `install_dir`.
    pub(crate) irt_override: Option<PathBuf>,
    /// Debugger command (space separated) to attach to every loader.
    pub(crate) debugger: Option<String>,
    /// Wrapper command (space separated) prepended to the loader command.
    pub(crate) loader_prefix: Option<String>,
    /// Enable untrusted hardware exception handling in loaders.
    pub(crate) exception_handling: bool,
    /// Pass `--no-error-dialogs` to loaders.
    pub(crate) no_error_dialogs: bool,
    /// Validation cache capacity.
    pub(crate) cache_capacity: NonZeroUsize,
    /// Spawn strategy.
    pub(crate) launch_mode: LaunchMode,
    /// Version string sent in the start message.
    pub(crate) version: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(PathBuf::from));
        Self {
            loader: exe_dir.as_ref().map(|dir| dir.join(LOADER_BINARY)),
            install_dir: exe_dir,
            irt_override: None,
            debugger: None,
            loader_prefix: None,
            exception_handling: false,
            no_error_dialogs: false,
            cache_capacity: NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            launch_mode: LaunchMode::Direct,
            version: concat!("nacl-host/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

impl HostConfig {
    /// Returns the defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().apply_env(
            std::env::var_os(ENV_IRT_LIBRARY),
            std::env::var_os(ENV_EXCEPTION_HANDLING),
        )
    }

    /// Applies the values of [`ENV_IRT_LIBRARY`] and
    /// [`ENV_EXCEPTION_HANDLING`]. The mere presence of the latter enables
    /// exception handling.
    pub fn apply_env(mut self, irt: Option<OsString>, exceptions: Option<OsString>) -> Self {
        if let Some(path) = irt {
            self.irt_override = Some(PathBuf::from(path));
        }
        if exceptions.is_some() {
            self.exception_handling = true;
        }
        self
    }

    /// Sets the loader binary path.
    pub fn loader(mut self, path: impl Into<PathBuf>) -> Self {
        self.loader = Some(path.into());
        self
    }

    /// Sets the directory searched for the runtime image.
    pub fn install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = Some(dir.into());
        self
    }

    /// Uses `path` verbatim as the runtime image.
    pub fn irt_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.irt_override = Some(path.into());
        self
    }

    /// Attaches the given debugger command to every loader.
    pub fn debugger(mut self, command: impl Into<String>) -> Self {
        self.debugger = Some(command.into());
        self
    }

    /// Prepends a wrapper command (e.g. `valgrind --trace-children=yes`).
    pub fn loader_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.loader_prefix = Some(prefix.into());
        self
    }

    /// Enables or disables untrusted hardware exception handling.
    pub const fn exception_handling(mut self, enable: bool) -> Self {
        self.exception_handling = enable;
        self
    }

    /// Suppresses error dialogs in loaders.
    pub const fn no_error_dialogs(mut self, enable: bool) -> Self {
        self.no_error_dialogs = enable;
        self
    }

    /// Sets the validation cache capacity.
    pub const fn cache_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Selects the spawn strategy.
    pub const fn launch_mode(mut self, mode: LaunchMode) -> Self {
        self.launch_mode = mode;
        self
    }

    /// Overrides the version string sent to loaders.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Loader binary that will be spawned.
    pub fn loader_path(&self) -> Option<&Path> {
        self.loader.as_deref()
    }

    /// Directory searched for the runtime image.
    pub fn install_dir_path(&self) -> Option<&Path> {
        self.install_dir.as_deref()
    }

    /// Runtime image path that bypasses the install directory.
    pub fn irt_path_override(&self) -> Option<&Path> {
        self.irt_override.as_deref()
    }

    /// Whether loaders get exception handling enabled.
    pub const fn exception_handling_enabled(&self) -> bool {
        self.exception_handling
    }

    /// Configured debugger command, if any.
    pub fn debugger_command(&self) -> Option<&str> {
        self.debugger.as_deref()
    }

    /// Version string sent in start messages.
    pub fn version_string(&self) -> &str {
        &self.version
    }
}
