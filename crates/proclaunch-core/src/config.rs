//! Centralized configuration for the process launcher.
//!
//! Compile-time limits and timeouts live in constant holders; settings a
//! caller may want to change per launcher live in [`LauncherSettings`].

use crate::error::{LauncherError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Wire protocol limits.
pub struct PacketConfig;

impl PacketConfig {
    /// Largest payload a peer may announce (16 MiB).
    pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;
    /// `[size:u32][type:u8][token:u64]`
    pub const HEADER_SIZE: usize = 4 + 1 + 8;
    pub const READ_CHUNK_SIZE: usize = 8192;
}

/// Server-side process table behaviour.
pub struct ServerConfig;

impl ServerConfig {
    /// How long to keep collecting output after a process exited.
    pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
    /// Output kept for the finished report; the rest is sent ahead as ReadyRead.
    pub const MAX_TRAILING_OUTPUT: usize = 1024 * 1024;
    /// Upper bound for monitor tasks to hand their process to the reaper on teardown.
    pub const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
}

/// Background reaper limits.
pub struct ReaperConfig;

impl ReaperConfig {
    pub const TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);
    pub const KILL_TIMEOUT: Duration = Duration::from_secs(1);
    pub const MAX_CONCURRENT_REAPS: usize = 8;
    pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Client-side launcher defaults.
pub struct LauncherConfig;

impl LauncherConfig {
    pub const SERVER_BINARY_NAME: &'static str = "proclaunch-server";
    /// Environment variable that overrides the launcher executable path.
    pub const SERVER_PATH_ENV: &'static str = "PROCLAUNCH_SERVER";
    pub const SOCKET_DIR_PREFIX: &'static str = "proclaunch-";
    pub const SOCKET_FILE_NAME: &'static str = "launcher.sock";
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Longer than the launcher's own teardown (monitor join plus reaper drain).
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(8);
    pub const IN_PROCESS_BUFFER_SIZE: usize = 64 * 1024;
    pub const DEFAULT_TERMINAL: &'static [&'static str] = &["xterm", "-e"];
}

/// Runtime settings for a launcher interface.
#[derive(Debug, Clone)]
pub struct LauncherSettings {
    server_path: Option<PathBuf>,
    connect_timeout: Duration,
    shutdown_timeout: Duration,
    terminal_command: Vec<String>,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            server_path: None,
            connect_timeout: LauncherConfig::CONNECT_TIMEOUT,
            shutdown_timeout: LauncherConfig::SHUTDOWN_TIMEOUT,
            terminal_command: LauncherConfig::DEFAULT_TERMINAL
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl LauncherSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit launcher executable instead of searching for one.
    pub fn with_server_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_path = Some(path.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Terminal emulator prefix used for terminal-hosted processes, e.g. `["xterm", "-e"]`.
    pub fn with_terminal_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.terminal_command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn terminal_command(&self) -> &[String] {
        &self.terminal_command
    }

    /// Locate the launcher executable.
    ///
    /// Order: explicit path, `PROCLAUNCH_SERVER`, then a `proclaunch-server`
    /// next to the current executable (or one directory up, which covers
    /// test binaries under `target/*/deps`).
    pub fn resolve_server_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.server_path {
            return ensure_executable(path);
        }

        if let Some(path) = std::env::var_os(LauncherConfig::SERVER_PATH_ENV) {
            return ensure_executable(Path::new(&path));
        }

        let exe = std::env::current_exe()?;
        let mut dir = exe.parent();
        for _ in 0..2 {
            let Some(current) = dir else { break };
            let candidate = current.join(LauncherConfig::SERVER_BINARY_NAME);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
            dir = current.parent();
        }

        Err(LauncherError::LauncherNotFound(PathBuf::from(
            LauncherConfig::SERVER_BINARY_NAME,
        )))
    }
}

fn ensure_executable(path: &Path) -> Result<PathBuf> {
    if is_executable(path) {
        Ok(path.to_path_buf())
    } else {
        Err(LauncherError::LauncherNotFound(path.to_path_buf()))
    }
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}
