//! Processes hosted in a terminal emulator window.

use super::ProcessInterface;
use crate::client::{CallerHandle, HandleState, ProcessEvent};
use crate::error::{LauncherError, Result};
use crate::protocol::{ExitStatus, ProcessError};
use bytes::Bytes;
use std::time::Duration;

/// Runs the program through a terminal command such as `xterm -e`.
///
/// The launcher starts the terminal; the program's own output goes to the
/// terminal window, so only what the terminal itself prints is captured.
#[derive(Debug)]
pub struct TerminalProcess {
    handle: CallerHandle,
    terminal: Vec<String>,
}

impl TerminalProcess {
    pub fn new(handle: CallerHandle, terminal: Vec<String>) -> Self {
        Self { handle, terminal }
    }

    pub fn terminal_command(&self) -> &[String] {
        &self.terminal
    }

    /// Program and arguments actually sent to the launcher.
    fn wrap(&self, program: &str, arguments: &[String]) -> Result<(String, Vec<String>)> {
        let Some((terminal, prefix)) = self.terminal.split_first() else {
            return Err(LauncherError::InvalidState {
                operation: "start",
                state: "no terminal command configured".to_string(),
            });
        };
        let mut wrapped = prefix.to_vec();
        wrapped.push(program.to_string());
        wrapped.extend_from_slice(arguments);
        Ok((terminal.clone(), wrapped))
    }
}

impl ProcessInterface for TerminalProcess {
    fn start(&mut self, program: &str, arguments: &[String], write_data: Bytes) -> Result<()> {
        let (terminal, wrapped) = self.wrap(program, arguments)?;
        self.handle.start(&terminal, &wrapped, write_data)
    }

    fn write(&mut self, _data: Bytes) -> Result<()> {
        Err(LauncherError::WriteNotAllowed(
            "terminal processes read their input from the terminal".to_string(),
        ))
    }

    fn cancel(&mut self) {
        self.handle.cancel()
    }

    fn wait_for_started(&mut self, timeout: Duration) -> bool {
        self.handle.wait_for_started(timeout)
    }

    fn wait_for_ready_read(&mut self, timeout: Duration) -> bool {
        self.handle.wait_for_ready_read(timeout)
    }

    fn wait_for_finished(&mut self, timeout: Duration) -> bool {
        self.handle.wait_for_finished(timeout)
    }

    fn process_events(&mut self) -> Vec<ProcessEvent> {
        self.handle.process_events()
    }

    fn state(&self) -> HandleState {
        self.handle.state()
    }

    fn process_id(&self) -> Option<u64> {
        self.handle.process_id()
    }

    fn exit_code(&self) -> i32 {
        self.handle.exit_code()
    }

    fn exit_status(&self) -> ExitStatus {
        self.handle.exit_status()
    }

    fn error(&self) -> ProcessError {
        self.handle.error()
    }

    fn error_string(&self) -> &str {
        self.handle.error_string()
    }

    fn read_all_standard_output(&mut self) -> Bytes {
        self.handle.read_all_standard_output()
    }

    fn read_all_standard_error(&mut self) -> Bytes {
        self.handle.read_all_standard_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LauncherInterface;
    use crate::config::LauncherSettings;
    use crate::protocol::ProcessMode;

    fn terminal(command: &[&str]) -> (LauncherInterface, TerminalProcess) {
        let launcher = LauncherInterface::in_process(&LauncherSettings::default()).unwrap();
        let handle = launcher.create_handle(ProcessMode::Reader);
        let process = TerminalProcess::new(handle, command.iter().map(|s| s.to_string()).collect());
        (launcher, process)
    }

    #[test]
    fn test_wraps_program_in_terminal_command() {
        let (_launcher, process) = terminal(&["xterm", "-e"]);
        let (program, args) = process
            .wrap("vim", &["a.txt".to_string()])
            .unwrap();
        assert_eq!(program, "xterm");
        assert_eq!(args, ["-e", "vim", "a.txt"]);
    }

    #[test]
    fn test_empty_terminal_command_rejected() {
        let (_launcher, mut process) = terminal(&[]);
        assert!(process.start("vim", &[], Bytes::new()).is_err());
        assert_eq!(process.state(), HandleState::NotStarted);
    }

    #[test]
    fn test_write_rejected() {
        let (_launcher, mut process) = terminal(&["xterm", "-e"]);
        assert!(matches!(
            process.write(Bytes::from_static(b"x")),
            Err(LauncherError::WriteNotAllowed(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_runs_through_terminal_command() {
        // `sh -c` stands in for a terminal emulator.
        let (_launcher, mut process) = terminal(&["sh", "-c"]);
        process
            .start("echo wrapped", &[], Bytes::new())
            .unwrap();
        assert!(process.wait_for_finished(Duration::from_secs(10)));
        assert_eq!(process.exit_code(), 0);
        assert_eq!(
            process.read_all_standard_output(),
            Bytes::from_static(b"wrapped\n")
        );
    }
}
