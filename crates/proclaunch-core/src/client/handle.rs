//! Client-side proxy for one remote process.
//!
//! A [`CallerHandle`] lives on the caller's thread. It never touches the
//! socket: commands are posted to the launcher interface's worker and
//! results come back over the handle's own event channel. Events are applied
//! when the caller pumps them, either explicitly through
//! [`CallerHandle::process_events`] or while blocked in one of the `wait_for_*`
//! methods.

use super::transport::{HandleEvent, Request, TransportState, TransportStatus};
use crate::error::{LauncherError, Result};
use crate::protocol::{
    ChannelMode, ExitStatus, ProcessError, ProcessFinishedPacket, ProcessMode, ProcessState,
    StartProcessPacket, Token,
};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lifecycle of a caller handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    NotStarted,
    /// Start requested, launcher has not confirmed yet.
    Starting,
    Running,
    /// The process ran and exited (normally or not).
    Finished,
    /// The process never started.
    Failed,
    /// Stopped on request of the caller.
    Canceled,
}

impl HandleState {
    pub fn is_live(self) -> bool {
        matches!(self, HandleState::Starting | HandleState::Running)
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Observable things that happened to a process, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Started,
    ReadyReadStandardOutput,
    ReadyReadStandardError,
    ErrorOccurred(ProcessError),
    Finished {
        exit_code: i32,
        exit_status: ExitStatus,
    },
}

type EventCallback = Box<dyn FnMut(&ProcessEvent) + Send>;

pub(crate) const CANCELED_BEFORE_START: &str = "Process was canceled before it was started.";

pub struct CallerHandle {
    token: Token,
    requests: mpsc::UnboundedSender<Request>,
    transport: Arc<TransportState>,
    events: std_mpsc::Receiver<HandleEvent>,
    setup: StartProcessPacket,
    state: HandleState,
    stop_requested: bool,
    finish_seen: bool,
    pid: Option<u64>,
    exit_code: i32,
    exit_status: ExitStatus,
    error: ProcessError,
    error_string: String,
    standard_output: BytesMut,
    standard_error: BytesMut,
    ready_reads: u64,
    observed: VecDeque<ProcessEvent>,
    callback: Option<EventCallback>,
    registered: bool,
}

impl fmt::Debug for CallerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallerHandle")
            .field("token", &self.token)
            .field("program", &self.setup.command)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .finish()
    }
}

impl CallerHandle {
    pub(crate) fn new(
        token: Token,
        process_mode: ProcessMode,
        requests: mpsc::UnboundedSender<Request>,
        transport: Arc<TransportState>,
        events: std_mpsc::Receiver<HandleEvent>,
    ) -> Self {
        Self {
            token,
            requests,
            transport,
            events,
            setup: StartProcessPacket {
                process_mode,
                ..StartProcessPacket::default()
            },
            state: HandleState::NotStarted,
            stop_requested: false,
            finish_seen: false,
            pid: None,
            exit_code: 0,
            exit_status: ExitStatus::NormalExit,
            error: ProcessError::UnknownError,
            error_string: String::new(),
            standard_output: BytesMut::new(),
            standard_error: BytesMut::new(),
            ready_reads: 0,
            observed: VecDeque::new(),
            callback: None,
            registered: true,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    // Setup, effective for the next start.

    /// Replace the environment. An empty map inherits the launcher's environment.
    pub fn set_environment(&mut self, env: BTreeMap<String, String>) {
        self.setup.env = env;
    }

    pub fn set_working_directory(&mut self, dir: impl AsRef<Path>) {
        self.setup.working_directory = dir.as_ref().to_string_lossy().into_owned();
    }

    pub fn set_channel_mode(&mut self, mode: ChannelMode) {
        self.setup.channel_mode = mode;
    }

    pub fn set_standard_input_file(&mut self, path: impl AsRef<Path>) {
        self.setup.standard_input_file = path.as_ref().to_string_lossy().into_owned();
    }

    pub fn set_below_normal_priority(&mut self) {
        self.setup.below_normal_priority = true;
    }

    pub fn set_native_arguments(&mut self, arguments: impl Into<String>) {
        self.setup.native_arguments = arguments.into();
    }

    pub fn set_low_priority(&mut self) {
        self.setup.low_priority = true;
    }

    pub fn set_unix_terminal_disabled(&mut self) {
        self.setup.unix_terminal_disabled = true;
    }

    /// Called for every event as it is applied, in addition to queueing it.
    pub fn on_event(&mut self, callback: impl FnMut(&ProcessEvent) + Send + 'static) {
        self.callback = Some(Box::new(callback));
    }

    // Queries

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn process_state(&self) -> ProcessState {
        match self.state {
            HandleState::Starting => ProcessState::Starting,
            HandleState::Running => ProcessState::Running,
            _ => ProcessState::NotRunning,
        }
    }

    pub fn process_mode(&self) -> ProcessMode {
        self.setup.process_mode
    }

    pub fn channel_mode(&self) -> ChannelMode {
        self.setup.channel_mode
    }

    pub fn program(&self) -> &str {
        &self.setup.command
    }

    pub fn arguments(&self) -> &[String] {
        &self.setup.arguments
    }

    pub fn process_id(&self) -> Option<u64> {
        self.pid
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.exit_status
    }

    pub fn error(&self) -> ProcessError {
        self.error
    }

    pub fn error_string(&self) -> &str {
        &self.error_string
    }

    pub fn read_all_standard_output(&mut self) -> Bytes {
        self.standard_output.split().freeze()
    }

    pub fn read_all_standard_error(&mut self) -> Bytes {
        self.standard_error.split().freeze()
    }

    // Commands

    /// Ask the launcher to start `program`. Never blocks.
    ///
    /// If the launcher is unavailable the handle moves straight to
    /// [`HandleState::Failed`] with [`ProcessError::FailedToStart`].
    pub fn start(&mut self, program: &str, arguments: &[String], write_data: Bytes) -> Result<()> {
        if self.state != HandleState::NotStarted {
            return Err(LauncherError::InvalidState {
                operation: "start",
                state: self.state.to_string(),
            });
        }

        self.setup.command = program.to_string();
        self.setup.arguments = arguments.to_vec();
        self.setup.write_data = write_data;

        match self.transport.get() {
            TransportStatus::Failed | TransportStatus::Closed => {
                self.fail_to_start("Internal socket error: launcher is not available".to_string());
                return Ok(());
            }
            TransportStatus::Connecting | TransportStatus::Ready => {}
        }

        self.state = HandleState::Starting;
        let request = Request::Start {
            token: self.token,
            packet: self.setup.clone(),
        };
        if self.requests.send(request).is_err() {
            self.fail_to_start("Internal socket error: launcher is not running".to_string());
        }
        Ok(())
    }

    /// Queue `data` for the process's stdin. Only valid for a running writer.
    pub fn write(&mut self, data: impl Into<Bytes>) -> Result<()> {
        if self.setup.process_mode != ProcessMode::Writer {
            return Err(LauncherError::WriteNotAllowed(
                "process was not started in writer mode".to_string(),
            ));
        }
        if self.state != HandleState::Running || self.stop_requested {
            return Err(LauncherError::WriteNotAllowed(format!(
                "process is {}",
                self.state
            )));
        }

        let request = Request::Write {
            token: self.token,
            data: data.into(),
        };
        self.requests
            .send(request)
            .map_err(|_| LauncherError::TransportUnavailable("launcher is not running".to_string()))
    }

    /// Stop the process. Safe to call any number of times in any state.
    pub fn cancel(&mut self) {
        if !self.state.is_live() || self.stop_requested {
            return;
        }
        self.stop_requested = true;

        let usable = matches!(
            self.transport.get(),
            TransportStatus::Connecting | TransportStatus::Ready
        );
        if !usable || self.requests.send(Request::Stop { token: self.token }).is_err() {
            debug!("Token {}: launcher gone, canceling locally", self.token);
            self.state = HandleState::Canceled;
        }
    }

    // Event pumping

    /// Apply everything that arrived so far and return all events observed
    /// since the last call.
    pub fn process_events(&mut self) -> Vec<ProcessEvent> {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.apply(event),
                Err(std_mpsc::TryRecvError::Empty) => break,
                Err(std_mpsc::TryRecvError::Disconnected) => {
                    self.worker_gone();
                    break;
                }
            }
        }
        self.observed.drain(..).collect()
    }

    /// Block until the process started. `false` if it failed or time ran out.
    pub fn wait_for_started(&mut self, timeout: Duration) -> bool {
        if self.state == HandleState::Running {
            return true;
        }
        if self.state != HandleState::Starting {
            return false;
        }
        self.pump_until(timeout, |handle| handle.state != HandleState::Starting);
        self.state == HandleState::Running
    }

    /// Block until new output is available. `false` if the process ended first.
    pub fn wait_for_ready_read(&mut self, timeout: Duration) -> bool {
        if !self.state.is_live() {
            return false;
        }
        let seen = self.ready_reads;
        self.pump_until(timeout, |handle| {
            handle.ready_reads != seen || !handle.state.is_live()
        });
        self.ready_reads != seen
    }

    /// Block until the process finished. `false` if it never ran, failed to
    /// start, or time ran out.
    pub fn wait_for_finished(&mut self, timeout: Duration) -> bool {
        if self.state == HandleState::NotStarted {
            return false;
        }
        self.pump_until(timeout, |handle| !handle.state.is_live());
        self.finish_seen
    }

    fn pump_until(&mut self, timeout: Duration, mut done: impl FnMut(&Self) -> bool) {
        let deadline = Instant::now() + timeout;
        while !done(self) {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            match self.events.recv_timeout(deadline - now) {
                Ok(event) => self.apply(event),
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => {
                    self.worker_gone();
                    return;
                }
            }
        }
    }

    fn worker_gone(&mut self) {
        if self.state.is_live() {
            self.apply(HandleEvent::TransportLost(
                "handle is no longer registered with the launcher".to_string(),
            ));
        }
    }

    fn apply(&mut self, event: HandleEvent) {
        match event {
            HandleEvent::Started { pid } => {
                self.pid = Some(pid);
                if self.state == HandleState::Starting {
                    self.state = HandleState::Running;
                    self.emit(ProcessEvent::Started);
                }
            }
            HandleEvent::StandardOutput(data) => self.deliver_output(data),
            HandleEvent::StandardError(data) => self.deliver_error(data),
            HandleEvent::Error {
                error,
                error_string,
            } => {
                if error == ProcessError::FailedToStart {
                    if self.stop_requested {
                        self.state = HandleState::Canceled;
                        self.exit_code = 255;
                        self.record_error(error, error_string);
                    } else {
                        self.fail_to_start(error_string);
                    }
                } else {
                    self.record_error(error, error_string);
                }
            }
            HandleEvent::Finished(finished) => self.finish(finished),
            HandleEvent::CanceledBeforeStart => {
                self.state = HandleState::Canceled;
                self.exit_code = 255;
                self.record_error(ProcessError::FailedToStart, CANCELED_BEFORE_START.to_string());
            }
            HandleEvent::Unregistered => {
                // The launcher interface already forgot the token and sent the stop.
                self.registered = false;
                if self.state.is_live() {
                    self.stop_requested = true;
                    self.finish(ProcessFinishedPacket::stopped());
                }
            }
            HandleEvent::TransportLost(reason) => {
                let message = format!("Internal socket error: {}", reason);
                match self.state {
                    HandleState::Starting if !self.stop_requested => self.fail_to_start(message),
                    HandleState::Running if !self.stop_requested => {
                        self.state = HandleState::Failed;
                        self.exit_code = -1;
                        self.exit_status = ExitStatus::CrashExit;
                        self.record_error(ProcessError::Crashed, message);
                    }
                    HandleState::Starting | HandleState::Running => {
                        self.state = HandleState::Canceled;
                    }
                    _ => {}
                }
            }
        }
    }

    fn finish(&mut self, finished: ProcessFinishedPacket) {
        if finished.error != ProcessError::UnknownError {
            self.record_error(finished.error, finished.error_string);
        }
        if !finished.standard_output.is_empty() {
            self.deliver_output(finished.standard_output);
        }
        if !finished.standard_error.is_empty() {
            self.deliver_error(finished.standard_error);
        }

        self.exit_code = finished.exit_code;
        self.exit_status = finished.exit_status;
        self.finish_seen = true;
        self.state = if self.stop_requested {
            HandleState::Canceled
        } else {
            HandleState::Finished
        };
        self.emit(ProcessEvent::Finished {
            exit_code: finished.exit_code,
            exit_status: finished.exit_status,
        });
    }

    fn fail_to_start(&mut self, message: String) {
        self.state = HandleState::Failed;
        self.exit_code = 255;
        self.record_error(ProcessError::FailedToStart, message);
    }

    fn record_error(&mut self, error: ProcessError, message: String) {
        debug!("Token {}: {:?}: {}", self.token, error, message);
        self.error = error;
        self.error_string = message;
        self.emit(ProcessEvent::ErrorOccurred(error));
    }

    fn deliver_output(&mut self, data: Bytes) {
        if self.setup.channel_mode.forwards_output() {
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = stdout.write_all(&data).and_then(|_| stdout.flush()) {
                warn!("Forwarding process output failed: {}", e);
            }
            return;
        }
        self.standard_output.extend_from_slice(&data);
        self.ready_reads += 1;
        self.emit(ProcessEvent::ReadyReadStandardOutput);
    }

    fn deliver_error(&mut self, data: Bytes) {
        if self.setup.channel_mode.forwards_error() {
            let mut stderr = std::io::stderr().lock();
            if let Err(e) = stderr.write_all(&data).and_then(|_| stderr.flush()) {
                warn!("Forwarding process error output failed: {}", e);
            }
            return;
        }
        self.standard_error.extend_from_slice(&data);
        self.ready_reads += 1;
        self.emit(ProcessEvent::ReadyReadStandardError);
    }

    fn emit(&mut self, event: ProcessEvent) {
        if let Some(callback) = self.callback.as_mut() {
            callback(&event);
        }
        self.observed.push_back(event);
    }

    /// Detach from the launcher interface, stopping a live process.
    pub(crate) fn unregister(&mut self) {
        if !self.registered {
            return;
        }
        self.cancel();
        self.registered = false;
        // Fails only if the worker is already gone, which is fine.
        let _ = self.requests.send(Request::Unregister { token: self.token });
    }
}

impl Drop for CallerHandle {
    fn drop(&mut self) {
        self.unregister();
    }
}
