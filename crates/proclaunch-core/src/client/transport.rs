//! The client's I/O worker.
//!
//! Runs on the launcher interface's dedicated thread. Caller threads talk to
//! it through [`Request`]s; it answers each handle through that handle's own
//! [`HandleEvent`] channel. The worker is the only owner of the socket and of
//! the handle registry.

use crate::error::{LauncherError, Result};
use crate::protocol::{
    serialize, write_frame, Packet, PacketBody, PacketReader, PacketType, ProcessError,
    ProcessFinishedPacket, StartProcessPacket, Token,
};
use crate::server::ExitReason;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::process::{Child, ChildStderr};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection state of a launcher interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// Waiting for the launcher to connect; starts are queued.
    Connecting,
    Ready,
    /// The connection failed or was lost; starts fail immediately.
    Failed,
    /// The interface was shut down.
    Closed,
}

/// Lock-free status cell shared between the worker and caller threads.
#[derive(Debug)]
pub(crate) struct TransportState(AtomicU8);

impl TransportState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(TransportStatus::Connecting as u8))
    }

    pub(crate) fn get(&self) -> TransportStatus {
        match self.0.load(Ordering::Acquire) {
            0 => TransportStatus::Connecting,
            1 => TransportStatus::Ready,
            2 => TransportStatus::Failed,
            _ => TransportStatus::Closed,
        }
    }

    pub(crate) fn set(&self, status: TransportStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

/// Caller thread → worker.
#[derive(Debug)]
pub(crate) enum Request {
    Register {
        token: Token,
        events: std_mpsc::Sender<HandleEvent>,
    },
    Unregister {
        token: Token,
    },
    Start {
        token: Token,
        packet: StartProcessPacket,
    },
    Write {
        token: Token,
        data: Bytes,
    },
    Stop {
        token: Token,
    },
    Shutdown,
}

/// Worker → one caller handle.
#[derive(Debug)]
pub(crate) enum HandleEvent {
    Started { pid: u64 },
    StandardOutput(Bytes),
    StandardError(Bytes),
    Error {
        error: ProcessError,
        error_string: String,
    },
    Finished(ProcessFinishedPacket),
    /// The start request was still queued when the handle was canceled.
    CanceledBeforeStart,
    /// The launcher interface unregistered the handle and stopped its process.
    Unregistered,
    /// The connection to the launcher is gone.
    TransportLost(String),
}

/// Whatever is serving the other end of the connection.
pub(crate) enum ServerHost {
    /// A launcher executable; its stderr is relayed into our log.
    Process { child: Child, relay: JoinHandle<()> },
    /// A socket handler task on the worker's own runtime.
    InProcess(JoinHandle<ExitReason>),
}

impl ServerHost {
    /// Resolves if the server goes away before the connection is up.
    async fn exited(&mut self) -> String {
        match self {
            ServerHost::Process { child, .. } => match child.wait().await {
                Ok(status) => format!("launcher exited before connecting ({})", status),
                Err(e) => format!("failed to wait for launcher: {}", e),
            },
            ServerHost::InProcess(_) => std::future::pending().await,
        }
    }

    /// Wait for the server to go away after a shutdown, killing it if needed.
    async fn finish(self, limit: Duration) {
        match self {
            ServerHost::Process { mut child, relay } => {
                match tokio::time::timeout(limit, child.wait()).await {
                    Ok(Ok(status)) => debug!("Launcher exited ({})", status),
                    Ok(Err(e)) => warn!("Failed to wait for launcher: {}", e),
                    Err(_) => {
                        warn!("Launcher did not exit within {:?}, killing it", limit);
                        if let Err(e) = child.kill().await {
                            warn!("Failed to kill launcher: {}", e);
                        }
                    }
                }
                // stderr reaches EOF once the launcher is gone.
                if tokio::time::timeout(limit, relay).await.is_err() {
                    debug!("Launcher stderr still open after exit");
                }
            }
            ServerHost::InProcess(handler) => match tokio::time::timeout(limit, handler).await {
                Ok(Ok(reason)) => debug!("In-process launcher finished ({:?})", reason),
                Ok(Err(e)) => warn!("In-process launcher task failed: {}", e),
                Err(_) => warn!("In-process launcher did not finish within {:?}", limit),
            },
        }
    }
}

/// Relay the launcher's stderr into the client log.
pub(crate) async fn relay_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!("[launcher] {}", line),
            Ok(None) => break,
            Err(e) => {
                debug!("[launcher] stderr closed: {}", e);
                break;
            }
        }
    }
}

struct Registration {
    events: std_mpsc::Sender<HandleEvent>,
    /// Start packet waiting for the connection to come up.
    pending_start: Option<StartProcessPacket>,
    /// The launcher knows about this token and has not finished it yet.
    live: bool,
    stop_sent: bool,
}

impl Registration {
    fn notify(&self, token: Token, event: HandleEvent) {
        if self.events.send(event).is_err() {
            debug!("Handle for token {} is gone, dropping event", token);
        }
    }
}

struct Worker<W> {
    registrations: HashMap<Token, Registration>,
    writer: Option<W>,
    state: std::sync::Arc<TransportState>,
    failure: Option<String>,
}

impl<W: AsyncWrite + Unpin> Worker<W> {
    fn new(state: std::sync::Arc<TransportState>) -> Self {
        Self {
            registrations: HashMap::new(),
            writer: None,
            state,
            failure: None,
        }
    }

    async fn attach(&mut self, writer: W) {
        self.writer = Some(writer);
        self.state.set(TransportStatus::Ready);
        info!("Launcher connected");

        let queued: Vec<(Token, StartProcessPacket)> = self
            .registrations
            .iter_mut()
            .filter_map(|(token, reg)| reg.pending_start.take().map(|packet| (*token, packet)))
            .collect();
        for (token, packet) in queued {
            self.send_start(token, packet).await;
        }
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Register { token, events } => {
                let previous = self.registrations.insert(
                    token,
                    Registration {
                        events,
                        pending_start: None,
                        live: false,
                        stop_sent: false,
                    },
                );
                if previous.is_some() {
                    warn!("Token {} registered twice, replacing the old handle", token);
                }
            }
            Request::Unregister { token } => {
                let Some(reg) = self.registrations.remove(&token) else {
                    debug!("Unregistering unknown token {}", token);
                    return;
                };
                if reg.pending_start.is_some() {
                    reg.notify(token, HandleEvent::CanceledBeforeStart);
                } else if reg.live {
                    reg.notify(token, HandleEvent::Unregistered);
                    if !reg.stop_sent {
                        self.send(token, PacketBody::StopProcess).await;
                    }
                }
            }
            Request::Start { token, packet } => {
                let status = self.state.get();
                let failure = self.failure.clone();
                let Some(reg) = self.registrations.get_mut(&token) else {
                    warn!("Start requested for unregistered token {}", token);
                    return;
                };
                match status {
                    TransportStatus::Ready => self.send_start(token, packet).await,
                    TransportStatus::Connecting => reg.pending_start = Some(packet),
                    TransportStatus::Failed | TransportStatus::Closed => reg.notify(
                        token,
                        HandleEvent::TransportLost(
                            failure.unwrap_or_else(|| "launcher is not running".to_string()),
                        ),
                    ),
                }
            }
            Request::Write { token, data } => {
                let writable = self
                    .registrations
                    .get(&token)
                    .is_some_and(|reg| reg.live && !reg.stop_sent);
                if writable {
                    self.send(token, PacketBody::WriteIntoProcess(data)).await;
                } else {
                    debug!("Dropping write for token {}: process is not running", token);
                }
            }
            Request::Stop { token } => {
                let Some(reg) = self.registrations.get_mut(&token) else {
                    debug!("Stop requested for unknown token {}", token);
                    return;
                };
                if reg.pending_start.take().is_some() {
                    reg.notify(token, HandleEvent::CanceledBeforeStart);
                } else if reg.live && !reg.stop_sent {
                    reg.stop_sent = true;
                    self.send(token, PacketBody::StopProcess).await;
                }
            }
            Request::Shutdown => {}
        }
    }

    async fn send_start(&mut self, token: Token, packet: StartProcessPacket) {
        if let Some(reg) = self.registrations.get_mut(&token) {
            reg.live = true;
        }
        self.send(token, PacketBody::StartProcess(packet)).await;
    }

    async fn send(&mut self, token: Token, body: PacketBody) {
        if self.writer.is_none() {
            return;
        }
        let packet = Packet::new(token, body);
        let frame = match serialize(&packet) {
            Ok(frame) => frame,
            Err(e) => {
                self.reject(token, packet.packet_type(), e);
                return;
            }
        };

        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(e) = write_frame(writer, &frame).await {
            self.transport_lost(format!("write to launcher failed: {}", e));
        }
    }

    /// A packet that cannot be encoded never reaches the socket, so only its
    /// own handle hears about it.
    fn reject(&mut self, token: Token, packet_type: PacketType, err: LauncherError) {
        warn!("Token {}: cannot send {:?}: {}", token, packet_type, err);
        let Some(reg) = self.registrations.get_mut(&token) else {
            return;
        };
        let error = if packet_type == PacketType::StartProcess {
            reg.live = false;
            ProcessError::FailedToStart
        } else {
            ProcessError::WriteError
        };
        reg.notify(
            token,
            HandleEvent::Error {
                error,
                error_string: err.to_string(),
            },
        );
    }

    /// Deliver one launcher packet to its handle.
    fn route(&mut self, packet: Packet) {
        let token = packet.token;
        let Some(reg) = self.registrations.get_mut(&token) else {
            debug!(
                "Dropping {:?} packet for unregistered token {}",
                packet.packet_type(),
                token
            );
            return;
        };

        let event = match packet.body {
            PacketBody::ProcessStarted { pid } => HandleEvent::Started { pid },
            PacketBody::ReadyReadStandardOutput(data) if data.is_empty() => return,
            PacketBody::ReadyReadStandardOutput(data) => HandleEvent::StandardOutput(data),
            PacketBody::ReadyReadStandardError(data) if data.is_empty() => return,
            PacketBody::ReadyReadStandardError(data) => HandleEvent::StandardError(data),
            PacketBody::ProcessError {
                error,
                error_string,
            } => {
                if error == ProcessError::FailedToStart {
                    reg.live = false;
                }
                HandleEvent::Error {
                    error,
                    error_string,
                }
            }
            PacketBody::ProcessFinished(finished) => {
                reg.live = false;
                HandleEvent::Finished(finished)
            }
            other => {
                error!(
                    "Launcher sent command packet {:?}, dropping connection",
                    other.packet_type()
                );
                self.transport_lost("protocol error".to_string());
                return;
            }
        };
        reg.notify(token, event);
    }

    /// Fail every handle that was waiting on the launcher.
    fn transport_lost(&mut self, reason: String) {
        if self.failure.is_some() {
            return;
        }
        error!("Launcher transport lost: {}", reason);
        self.writer = None;
        self.state.set(TransportStatus::Failed);

        for (token, reg) in self.registrations.iter_mut() {
            let waiting = reg.pending_start.take().is_some() || reg.live;
            reg.live = false;
            if waiting {
                reg.notify(*token, HandleEvent::TransportLost(reason.clone()));
            }
        }
        self.failure = Some(reason);
    }

    async fn shutdown(&mut self) {
        if self.writer.is_some() {
            self.send(Token::NONE, PacketBody::Shutdown).await;
        }
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Closing launcher connection failed: {}", e);
            }
        }

        if !self.registrations.is_empty() {
            warn!(
                "Launcher shut down with {} handle(s) still registered",
                self.registrations.len()
            );
        }
        for (token, reg) in self.registrations.drain() {
            if reg.live || reg.pending_start.is_some() {
                reg.notify(token, HandleEvent::TransportLost("launcher shut down".to_string()));
            }
        }
        self.state.set(TransportStatus::Closed);
    }
}

async fn next_packet<R: AsyncRead + Unpin>(
    reader: &mut Option<PacketReader<R>>,
) -> Result<Option<Packet>> {
    match reader {
        Some(reader) => reader.next_packet().await,
        None => std::future::pending().await,
    }
}

/// Drive one launcher connection until shutdown is requested.
pub(crate) async fn run<S, C>(
    connect: C,
    mut host: ServerHost,
    mut requests: mpsc::UnboundedReceiver<Request>,
    state: std::sync::Arc<TransportState>,
    shutdown_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    C: Future<Output = Result<S>>,
{
    let mut worker: Worker<WriteHalf<S>> = Worker::new(state);
    tokio::pin!(connect);

    // Phase 1: wait for the launcher while queueing requests.
    let stream = loop {
        tokio::select! {
            biased;
            connected = &mut connect => match connected {
                Ok(stream) => break Some(stream),
                Err(e) => {
                    worker.transport_lost(format!("launcher did not connect: {}", e));
                    break None;
                }
            },
            reason = host.exited() => {
                worker.transport_lost(reason);
                break None;
            }
            request = requests.recv() => match request {
                Some(Request::Shutdown) | None => {
                    worker.shutdown().await;
                    host.finish(shutdown_timeout).await;
                    return;
                }
                Some(request) => worker.handle(request).await,
            },
        }
    };

    // Phase 2: serve requests and route launcher packets.
    let mut reader = match stream {
        Some(stream) => {
            let (reader, writer) = tokio::io::split(stream);
            worker.attach(writer).await;
            Some(PacketReader::new(reader))
        }
        None => None,
    };

    loop {
        tokio::select! {
            incoming = next_packet(&mut reader) => {
                match incoming {
                    Ok(Some(packet)) => worker.route(packet),
                    Ok(None) => worker.transport_lost("launcher closed the connection".to_string()),
                    Err(e) => worker.transport_lost(e.to_string()),
                }
                if worker.writer.is_none() {
                    reader = None;
                }
            }
            request = requests.recv() => match request {
                Some(Request::Shutdown) | None => break,
                Some(request) => {
                    worker.handle(request).await;
                    if worker.writer.is_none() {
                        reader = None;
                    }
                }
            },
        }
    }

    worker.shutdown().await;
    drop(reader);
    host.finish(shutdown_timeout).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PacketConfig;
    use std::sync::Arc;
    use tokio::io::DuplexStream;

    fn register(
        requests: &mpsc::UnboundedSender<Request>,
        token: Token,
    ) -> std_mpsc::Receiver<HandleEvent> {
        let (tx, rx) = std_mpsc::channel();
        requests
            .send(Request::Register { token, events: tx })
            .unwrap();
        rx
    }

    fn dummy_host() -> ServerHost {
        ServerHost::InProcess(tokio::spawn(async { ExitReason::Disconnected }))
    }

    async fn next_event(events: &std_mpsc::Receiver<HandleEvent>) -> HandleEvent {
        for _ in 0..200 {
            if let Ok(event) = events.try_recv() {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no handle event");
    }

    #[tokio::test]
    async fn test_cancel_while_connecting_drops_start() {
        let state = Arc::new(TransportState::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run(
            std::future::pending::<Result<DuplexStream>>(),
            dummy_host(),
            rx,
            Arc::clone(&state),
            Duration::from_secs(1),
        ));

        let token = Token::unique();
        let events = register(&tx, token);
        tx.send(Request::Start {
            token,
            packet: StartProcessPacket::default(),
        })
        .unwrap();
        tx.send(Request::Stop { token }).unwrap();

        assert!(matches!(next_event(&events).await, HandleEvent::CanceledBeforeStart));
        assert_eq!(state.get(), TransportStatus::Connecting);

        tx.send(Request::Shutdown).unwrap();
        worker.await.unwrap();
        assert_eq!(state.get(), TransportStatus::Closed);
    }

    #[tokio::test]
    async fn test_connect_failure_fails_queued_starts() {
        let state = Arc::new(TransportState::new());
        let (tx, rx) = mpsc::unbounded_channel();

        let token = Token::unique();
        let events = register(&tx, token);
        tx.send(Request::Start {
            token,
            packet: StartProcessPacket::default(),
        })
        .unwrap();

        let connect = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<DuplexStream, _>(LauncherError::TransportUnavailable("refused".into()))
        };
        let worker = tokio::spawn(run(connect, dummy_host(), rx, Arc::clone(&state), Duration::from_secs(1)));

        assert!(matches!(next_event(&events).await, HandleEvent::TransportLost(_)));
        assert_eq!(state.get(), TransportStatus::Failed);

        // Later starts fail right away.
        let late = Token::unique();
        let late_events = register(&tx, late);
        tx.send(Request::Start {
            token: late,
            packet: StartProcessPacket::default(),
        })
        .unwrap();
        assert!(matches!(next_event(&late_events).await, HandleEvent::TransportLost(_)));

        tx.send(Request::Shutdown).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_start_flushed_on_connect() {
        let state = Arc::new(TransportState::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let (client, server) = tokio::io::duplex(4096);

        let token = Token::unique();
        let _events = register(&tx, token);
        tx.send(Request::Start {
            token,
            packet: StartProcessPacket {
                command: "true".to_string(),
                ..StartProcessPacket::default()
            },
        })
        .unwrap();

        let connect = async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, LauncherError>(client)
        };
        let worker = tokio::spawn(run(connect, dummy_host(), rx, Arc::clone(&state), Duration::from_secs(1)));

        let mut launcher = PacketReader::new(server);
        let packet = launcher.next_packet().await.unwrap().unwrap();
        assert_eq!(packet.token, token);
        assert!(matches!(packet.body, PacketBody::StartProcess(ref start) if start.command == "true"));
        assert_eq!(state.get(), TransportStatus::Ready);

        tx.send(Request::Shutdown).unwrap();
        let packet = launcher.next_packet().await.unwrap().unwrap();
        assert_eq!(packet, Packet::shutdown());
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_launcher_disconnect_fails_live_handles() {
        let state = Arc::new(TransportState::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let (client, server) = tokio::io::duplex(4096);

        let worker = tokio::spawn(run(
            async move { Ok::<_, LauncherError>(client) },
            dummy_host(),
            rx,
            Arc::clone(&state),
            Duration::from_secs(1),
        ));

        let token = Token::unique();
        let events = register(&tx, token);
        tx.send(Request::Start {
            token,
            packet: StartProcessPacket::default(),
        })
        .unwrap();

        let mut launcher = PacketReader::new(server);
        assert!(launcher.next_packet().await.unwrap().is_some());
        drop(launcher);

        assert!(matches!(next_event(&events).await, HandleEvent::TransportLost(_)));
        assert_eq!(state.get(), TransportStatus::Failed);

        tx.send(Request::Shutdown).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_unencodable_write_only_affects_its_token() {
        let state = Arc::new(TransportState::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let (client, server) = tokio::io::duplex(4096);

        let worker = tokio::spawn(run(
            async move { Ok::<_, LauncherError>(client) },
            dummy_host(),
            rx,
            Arc::clone(&state),
            Duration::from_secs(1),
        ));

        let writer = Token::unique();
        let bystander = Token::unique();
        let writer_events = register(&tx, writer);
        let bystander_events = register(&tx, bystander);
        for token in [writer, bystander] {
            tx.send(Request::Start {
                token,
                packet: StartProcessPacket::default(),
            })
            .unwrap();
        }

        let mut launcher = PacketReader::new(server);
        for _ in 0..2 {
            let packet = launcher.next_packet().await.unwrap().unwrap();
            assert_eq!(packet.packet_type(), PacketType::StartProcess);
        }

        tx.send(Request::Write {
            token: writer,
            data: Bytes::from(vec![b'x'; PacketConfig::MAX_PACKET_SIZE + 1]),
        })
        .unwrap();
        match next_event(&writer_events).await {
            HandleEvent::Error { error, .. } => assert_eq!(error, ProcessError::WriteError),
            other => panic!("expected a write error, got {:?}", other),
        }
        assert_eq!(state.get(), TransportStatus::Ready);

        // The connection keeps working for both tokens.
        tx.send(Request::Stop { token: bystander }).unwrap();
        let packet = launcher.next_packet().await.unwrap().unwrap();
        assert_eq!(packet, Packet::new(bystander, PacketBody::StopProcess));
        assert!(bystander_events.try_recv().is_err());

        tx.send(Request::Write {
            token: writer,
            data: Bytes::from_static(b"small"),
        })
        .unwrap();
        let packet = launcher.next_packet().await.unwrap().unwrap();
        assert_eq!(packet.token, writer);
        assert_eq!(packet.packet_type(), PacketType::WriteIntoProcess);

        tx.send(Request::Shutdown).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_of_live_handle_stops_process() {
        let state = Arc::new(TransportState::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let (client, server) = tokio::io::duplex(4096);

        let worker = tokio::spawn(run(
            async move { Ok::<_, LauncherError>(client) },
            dummy_host(),
            rx,
            Arc::clone(&state),
            Duration::from_secs(1),
        ));

        let token = Token::unique();
        let events = register(&tx, token);
        tx.send(Request::Start {
            token,
            packet: StartProcessPacket::default(),
        })
        .unwrap();

        let mut launcher = PacketReader::new(server);
        assert!(launcher.next_packet().await.unwrap().is_some());

        tx.send(Request::Unregister { token }).unwrap();
        assert!(matches!(next_event(&events).await, HandleEvent::Unregistered));
        let packet = launcher.next_packet().await.unwrap().unwrap();
        assert_eq!(packet, Packet::new(token, PacketBody::StopProcess));

        tx.send(Request::Shutdown).unwrap();
        worker.await.unwrap();
    }
}
