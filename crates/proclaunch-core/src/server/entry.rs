//! Server-side process table entry.
//!
//! An entry owns exactly one OS process. A single monitor task owns the
//! child, its stdout and stderr pipes, and waits for it to exit; a second
//! task feeds stdin. Both report back to the socket handler through an
//! [`EntryEvent`] channel tagged with the entry's token and generation, so
//! events of an entry that was already removed can be recognised and dropped.

use crate::config::{PacketConfig, ServerConfig};
use crate::platform::{self, ChildFlags};
use crate::protocol::{
    ChannelMode, ExitStatus, ProcessError, ProcessFinishedPacket, ProcessMode, StartProcessPacket,
    Token,
};
use crate::reaper::Reaper;
use bytes::{Bytes, BytesMut};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Something that happened to a running process.
#[derive(Debug)]
pub(crate) enum EntryEvent {
    StandardOutput(Bytes),
    StandardError(Bytes),
    Error {
        error: ProcessError,
        error_string: String,
    },
    Finished(ProcessFinishedPacket),
}

#[derive(Debug)]
pub(crate) struct EntryMessage {
    pub token: Token,
    pub generation: u64,
    pub event: EntryEvent,
}

/// Posts events for one entry.
#[derive(Clone)]
struct EventSink {
    token: Token,
    generation: u64,
    tx: mpsc::UnboundedSender<EntryMessage>,
}

impl EventSink {
    fn send(&self, event: EntryEvent) {
        let message = EntryMessage {
            token: self.token,
            generation: self.generation,
            event,
        };
        if self.tx.send(message).is_err() {
            debug!("Socket handler gone, dropping event for token {}", self.token);
        }
    }
}

/// A live process in the launcher's process table.
pub(crate) struct ProcessEntry {
    generation: u64,
    pid: u32,
    stdin: Option<mpsc::UnboundedSender<Bytes>>,
    release: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

impl ProcessEntry {
    /// Spawn the process described by `packet`.
    ///
    /// On failure returns the message for a `FailedToStart` error; no entry
    /// exists in that case.
    pub(crate) fn spawn(
        token: Token,
        generation: u64,
        packet: StartProcessPacket,
        events: mpsc::UnboundedSender<EntryMessage>,
        reaper: Reaper,
    ) -> std::result::Result<Self, String> {
        if packet.command.is_empty() {
            return Err("No program defined".to_string());
        }

        let mut command = Command::new(&packet.command);
        command.args(&packet.arguments);
        if !packet.working_directory.is_empty() {
            command.current_dir(&packet.working_directory);
        }
        if !packet.env.is_empty() {
            command.env_clear();
            command.envs(&packet.env);
        }

        let keep_stdin_open = packet.process_mode == ProcessMode::Writer;
        let feeds_stdin = if !packet.standard_input_file.is_empty() {
            let file = std::fs::File::open(&packet.standard_input_file).map_err(|e| {
                format!(
                    "Failed to open standard input file {}: {}",
                    packet.standard_input_file, e
                )
            })?;
            if !packet.write_data.is_empty() || keep_stdin_open {
                warn!(
                    "Token {}: stdin is redirected from {}, ignoring write data",
                    token, packet.standard_input_file
                );
            }
            command.stdin(Stdio::from(file));
            false
        } else if keep_stdin_open || !packet.write_data.is_empty() {
            command.stdin(Stdio::piped());
            true
        } else {
            command.stdin(Stdio::null());
            false
        };

        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if packet.below_normal_priority || !packet.native_arguments.is_empty() {
            debug!(
                "Token {}: below-normal priority and native arguments only apply on Windows",
                token
            );
        }
        platform::configure_child(
            &mut command,
            ChildFlags {
                new_session: packet.unix_terminal_disabled,
                low_priority: packet.low_priority,
                ..ChildFlags::default()
            },
        );

        let mut child = command.spawn().map_err(|e| e.to_string())?;
        let pid = child.id().unwrap_or_default();
        debug!("Token {}: started {} as pid {}", token, packet.command, pid);

        let sink = EventSink {
            token,
            generation,
            tx: events,
        };

        let stdin = match child.stdin.take() {
            Some(pipe) if feeds_stdin => {
                let (sender, receiver) = if keep_stdin_open {
                    let (tx, rx) = mpsc::unbounded_channel();
                    (Some(tx), Some(rx))
                } else {
                    (None, None)
                };
                tokio::spawn(feed_stdin(pipe, packet.write_data, receiver, sink.clone()));
                sender
            }
            _ => None,
        };

        let (release_tx, release_rx) = oneshot::channel();
        let merged = packet.channel_mode == ChannelMode::MergedChannels;
        let monitor = tokio::spawn(monitor(child, release_rx, merged, sink, reaper));

        Ok(Self {
            generation,
            pid,
            stdin,
            release: Some(release_tx),
            monitor,
        })
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Queue `data` for the process's stdin. Returns `false` if stdin is not writable.
    pub(crate) fn write(&self, data: Bytes) -> bool {
        match &self.stdin {
            Some(stdin) => stdin.send(data).is_ok(),
            None => false,
        }
    }

    /// Detach the process from the table and hand it to the reaper.
    ///
    /// Returns the monitor task so teardown can wait for the hand-over.
    pub(crate) fn release(mut self) -> JoinHandle<()> {
        if let Some(release) = self.release.take() {
            let _ = release.send(());
        }
        self.monitor
    }
}

async fn feed_stdin(
    mut stdin: ChildStdin,
    initial: Bytes,
    queue: Option<mpsc::UnboundedReceiver<Bytes>>,
    sink: EventSink,
) {
    if !initial.is_empty() {
        if let Err(e) = write_chunk(&mut stdin, &initial).await {
            report_write_error(&sink, e);
            return;
        }
    }

    // Without a queue (reader mode) stdin is closed once the initial data is written.
    let Some(mut queue) = queue else {
        return;
    };
    while let Some(data) = queue.recv().await {
        if let Err(e) = write_chunk(&mut stdin, &data).await {
            report_write_error(&sink, e);
            return;
        }
    }
}

async fn write_chunk(stdin: &mut ChildStdin, data: &[u8]) -> std::io::Result<()> {
    stdin.write_all(data).await?;
    stdin.flush().await
}

fn report_write_error(sink: &EventSink, err: std::io::Error) {
    debug!("Token {}: writing to stdin failed: {}", sink.token, err);
    sink.send(EntryEvent::Error {
        error: ProcessError::WriteError,
        error_string: format!("Error writing to process: {}", err),
    });
}

fn report_read_error(sink: &EventSink, err: std::io::Error) {
    debug!("Token {}: reading process output failed: {}", sink.token, err);
    sink.send(EntryEvent::Error {
        error: ProcessError::ReadError,
        error_string: format!("Error reading from process: {}", err),
    });
}

/// One output pipe of a child.
struct OutputPipe<R> {
    reader: Option<R>,
    buffer: BytesMut,
    sink: EventSink,
}

impl<R: AsyncRead + Unpin> OutputPipe<R> {
    fn new(reader: Option<R>, sink: EventSink) -> Self {
        Self {
            reader,
            buffer: BytesMut::new(),
            sink,
        }
    }

    fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Next chunk of output, or `None` once the pipe is closed.
    async fn next_chunk(&mut self) -> Option<Bytes> {
        let reader = self.reader.as_mut()?;
        self.buffer.reserve(PacketConfig::READ_CHUNK_SIZE);
        match reader.read_buf(&mut self.buffer).await {
            Ok(0) => {
                self.reader = None;
                None
            }
            Ok(_) => Some(self.buffer.split().freeze()),
            Err(e) => {
                self.reader = None;
                report_read_error(&self.sink, e);
                None
            }
        }
    }

    /// Collect whatever is left, for at most `limit`.
    ///
    /// Keeps at most [`ServerConfig::MAX_TRAILING_OUTPUT`] bytes for the
    /// finished report. Anything older goes to `flush` first, in chunks of
    /// [`PacketConfig::READ_CHUNK_SIZE`].
    async fn drain(&mut self, limit: Duration, mut flush: impl FnMut(Bytes)) -> Bytes {
        let mut rest = BytesMut::new();
        let collect = async {
            while let Some(chunk) = self.next_chunk().await {
                rest.extend_from_slice(&chunk);
                while rest.len() > ServerConfig::MAX_TRAILING_OUTPUT {
                    flush(rest.split_to(PacketConfig::READ_CHUNK_SIZE).freeze());
                }
            }
        };
        if tokio::time::timeout(limit, collect).await.is_err() {
            debug!("Output still open {:?} after exit, giving up", limit);
        }
        rest.freeze()
    }
}

enum Step {
    Release,
    EntryDropped,
    StandardOutput(Option<Bytes>),
    StandardError(Option<Bytes>),
    Exited(std::io::Result<std::process::ExitStatus>),
}

async fn monitor(
    mut child: Child,
    mut release: oneshot::Receiver<()>,
    merged: bool,
    sink: EventSink,
    reaper: Reaper,
) {
    let mut stdout = OutputPipe::new(child.stdout.take(), sink.clone());
    let mut stderr = OutputPipe::new(child.stderr.take(), sink.clone());

    // Dropping the entry without releasing it only closes stdin; the
    // process keeps running and still reports its exit.
    let mut releasable = true;
    let status = loop {
        let step = tokio::select! {
            released = &mut release, if releasable => match released {
                Ok(()) => Step::Release,
                Err(_) => Step::EntryDropped,
            },
            chunk = stdout.next_chunk(), if stdout.is_open() => Step::StandardOutput(chunk),
            chunk = stderr.next_chunk(), if stderr.is_open() => Step::StandardError(chunk),
            status = child.wait() => Step::Exited(status),
        };

        match step {
            Step::Release => {
                debug!("Token {}: handing process to the reaper", sink.token);
                reaper.reap(child);
                return;
            }
            Step::EntryDropped => releasable = false,
            Step::StandardOutput(Some(data)) => sink.send(EntryEvent::StandardOutput(data)),
            Step::StandardError(Some(data)) if merged => {
                sink.send(EntryEvent::StandardOutput(data))
            }
            Step::StandardError(Some(data)) => sink.send(EntryEvent::StandardError(data)),
            Step::StandardOutput(None) | Step::StandardError(None) => {}
            Step::Exited(Ok(status)) => break status,
            Step::Exited(Err(e)) => {
                warn!("Token {}: failed to wait for process: {}", sink.token, e);
                sink.send(EntryEvent::Finished(ProcessFinishedPacket {
                    error: ProcessError::UnknownError,
                    error_string: format!("Failed to wait for process: {}", e),
                    exit_code: -1,
                    exit_status: ExitStatus::CrashExit,
                    ..ProcessFinishedPacket::default()
                }));
                reaper.reap(child);
                return;
            }
        }
    };

    // Output still in the pipes goes into the finished report, never twice.
    let mut standard_output = stdout
        .drain(ServerConfig::OUTPUT_DRAIN_TIMEOUT, |data| {
            sink.send(EntryEvent::StandardOutput(data))
        })
        .await;
    let mut standard_error = stderr
        .drain(ServerConfig::OUTPUT_DRAIN_TIMEOUT, |data| {
            sink.send(if merged {
                EntryEvent::StandardOutput(data)
            } else {
                EntryEvent::StandardError(data)
            })
        })
        .await;
    if merged && !standard_error.is_empty() {
        let mut combined = BytesMut::from(&standard_output[..]);
        combined.extend_from_slice(&standard_error);
        standard_output = combined.freeze();
        standard_error = Bytes::new();
    }

    let mut finished = finished_report(status);
    finished.standard_output = standard_output;
    finished.standard_error = standard_error;
    debug!(
        "Token {}: process exited with code {} ({:?})",
        sink.token, finished.exit_code, finished.exit_status
    );
    sink.send(EntryEvent::Finished(finished));
}

fn finished_report(status: std::process::ExitStatus) -> ProcessFinishedPacket {
    if let Some(code) = status.code() {
        return ProcessFinishedPacket {
            exit_code: code,
            exit_status: ExitStatus::NormalExit,
            ..ProcessFinishedPacket::default()
        };
    }

    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal().unwrap_or(-1)
    };
    #[cfg(not(unix))]
    let signal = -1;

    ProcessFinishedPacket {
        error: ProcessError::Crashed,
        error_string: format!("Process crashed (signal {})", signal),
        exit_code: signal,
        exit_status: ExitStatus::CrashExit,
        ..ProcessFinishedPacket::default()
    }
}
