//! Process abstraction shared by all hosting variants.
//!
//! Callers describe a process with a [`ProcessSetup`] and obtain a
//! `Box<dyn ProcessInterface>` from a [`ProcessContext`]. Which variant backs
//! it is decided once, at construction time:
//!
//! 1. **Direct** - a socket handler running inside this process
//! 2. **Launcher** - the external `proclaunch-server` executable
//! 3. **Terminal** - like Launcher, wrapped in a terminal emulator command
//!
//! # Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use proclaunch::process::{ProcessContext, ProcessSetup, ProcessVariant};
//! use proclaunch::LauncherSettings;
//! use std::time::Duration;
//!
//! fn main() -> proclaunch::Result<()> {
//!     let context = ProcessContext::new(LauncherSettings::default());
//!     let setup = ProcessSetup::new(ProcessVariant::Direct).with_env("LANG", "C");
//!     let mut process = context.create_process(&setup)?;
//!
//!     process.start("ls", &["-l".to_string()], Bytes::new())?;
//!     process.wait_for_finished(Duration::from_secs(5));
//!     println!("exit code {}", process.exit_code());
//!
//!     context.shutdown();
//!     Ok(())
//! }
//! ```

mod context;
mod terminal;

pub use context::ProcessContext;
pub use terminal::TerminalProcess;

use crate::client::{CallerHandle, HandleState, ProcessEvent};
use crate::error::Result;
use crate::protocol::{ChannelMode, ExitStatus, ProcessError, ProcessMode};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// How a process is hosted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessVariant {
    /// Served by a socket handler on an in-process worker thread.
    Direct,
    /// Served by the external launcher executable.
    #[default]
    Launcher,
    /// Run inside a terminal emulator started by the external launcher.
    Terminal,
}

/// Operations every process variant supports.
pub trait ProcessInterface: Send {
    /// Request the start. Never blocks; failures show up as state changes.
    fn start(&mut self, program: &str, arguments: &[String], write_data: Bytes) -> Result<()>;
    fn write(&mut self, data: Bytes) -> Result<()>;
    /// Stop the process. Idempotent.
    fn cancel(&mut self);

    fn wait_for_started(&mut self, timeout: Duration) -> bool;
    fn wait_for_ready_read(&mut self, timeout: Duration) -> bool;
    fn wait_for_finished(&mut self, timeout: Duration) -> bool;
    fn process_events(&mut self) -> Vec<ProcessEvent>;

    fn state(&self) -> HandleState;
    fn process_id(&self) -> Option<u64>;
    fn exit_code(&self) -> i32;
    fn exit_status(&self) -> ExitStatus;
    fn error(&self) -> ProcessError;
    fn error_string(&self) -> &str;

    fn read_all_standard_output(&mut self) -> Bytes;
    fn read_all_standard_error(&mut self) -> Bytes;
}

impl ProcessInterface for CallerHandle {
    fn start(&mut self, program: &str, arguments: &[String], write_data: Bytes) -> Result<()> {
        CallerHandle::start(self, program, arguments, write_data)
    }

    fn write(&mut self, data: Bytes) -> Result<()> {
        CallerHandle::write(self, data)
    }

    fn cancel(&mut self) {
        CallerHandle::cancel(self)
    }

    fn wait_for_started(&mut self, timeout: Duration) -> bool {
        CallerHandle::wait_for_started(self, timeout)
    }

    fn wait_for_ready_read(&mut self, timeout: Duration) -> bool {
        CallerHandle::wait_for_ready_read(self, timeout)
    }

    fn wait_for_finished(&mut self, timeout: Duration) -> bool {
        CallerHandle::wait_for_finished(self, timeout)
    }

    fn process_events(&mut self) -> Vec<ProcessEvent> {
        CallerHandle::process_events(self)
    }

    fn state(&self) -> HandleState {
        CallerHandle::state(self)
    }

    fn process_id(&self) -> Option<u64> {
        CallerHandle::process_id(self)
    }

    fn exit_code(&self) -> i32 {
        CallerHandle::exit_code(self)
    }

    fn exit_status(&self) -> ExitStatus {
        CallerHandle::exit_status(self)
    }

    fn error(&self) -> ProcessError {
        CallerHandle::error(self)
    }

    fn error_string(&self) -> &str {
        CallerHandle::error_string(self)
    }

    fn read_all_standard_output(&mut self) -> Bytes {
        CallerHandle::read_all_standard_output(self)
    }

    fn read_all_standard_error(&mut self) -> Bytes {
        CallerHandle::read_all_standard_error(self)
    }
}

/// Everything about a process except the program and its arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSetup {
    pub variant: ProcessVariant,
    pub process_mode: ProcessMode,
    pub channel_mode: ChannelMode,
    /// Empty means inherit the launcher's environment.
    pub environment: BTreeMap<String, String>,
    pub working_directory: Option<PathBuf>,
    pub standard_input_file: Option<PathBuf>,
    pub below_normal_priority: bool,
    pub low_priority: bool,
    pub native_arguments: String,
    pub unix_terminal_disabled: bool,
}

impl ProcessSetup {
    pub fn new(variant: ProcessVariant) -> Self {
        Self {
            variant,
            ..Self::default()
        }
    }

    pub fn with_process_mode(mut self, mode: ProcessMode) -> Self {
        self.process_mode = mode;
        self
    }

    pub fn with_channel_mode(mut self, mode: ChannelMode) -> Self {
        self.channel_mode = mode;
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_standard_input_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.standard_input_file = Some(path.into());
        self
    }

    pub fn with_low_priority(mut self) -> Self {
        self.low_priority = true;
        self
    }

    pub fn with_below_normal_priority(mut self) -> Self {
        self.below_normal_priority = true;
        self
    }

    pub fn with_native_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.native_arguments = arguments.into();
        self
    }

    pub fn with_unix_terminal_disabled(mut self) -> Self {
        self.unix_terminal_disabled = true;
        self
    }

    /// Copy the setup onto a not yet started handle.
    pub fn apply(&self, handle: &mut CallerHandle) {
        handle.set_channel_mode(self.channel_mode);
        handle.set_environment(self.environment.clone());
        if let Some(dir) = &self.working_directory {
            handle.set_working_directory(dir);
        }
        if let Some(path) = &self.standard_input_file {
            handle.set_standard_input_file(path);
        }
        if self.below_normal_priority {
            handle.set_below_normal_priority();
        }
        if self.low_priority {
            handle.set_low_priority();
        }
        if !self.native_arguments.is_empty() {
            handle.set_native_arguments(self.native_arguments.clone());
        }
        if self.unix_terminal_disabled {
            handle.set_unix_terminal_disabled();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_variant_is_launcher() {
        assert_eq!(ProcessSetup::default().variant, ProcessVariant::Launcher);
    }

    #[test]
    fn test_setup_builder() {
        let setup = ProcessSetup::new(ProcessVariant::Direct)
            .with_process_mode(ProcessMode::Writer)
            .with_channel_mode(ChannelMode::MergedChannels)
            .with_env("A", "1")
            .with_env("B", "2")
            .with_working_directory("/tmp")
            .with_low_priority();

        assert_eq!(setup.variant, ProcessVariant::Direct);
        assert_eq!(setup.process_mode, ProcessMode::Writer);
        assert_eq!(setup.environment.len(), 2);
        assert_eq!(setup.working_directory, Some(PathBuf::from("/tmp")));
        assert!(setup.low_priority);
        assert!(!setup.below_normal_priority);
    }
}
