//! Launcher side of one client connection.
//!
//! The handler owns the process table. It runs as a single task that
//! alternates between packets from the client and events from the entries'
//! monitor tasks, so the table is never shared.
//!
//! # Lifecycle
//!
//! `Connected` until the client sends `Shutdown`, closes the socket, or
//! violates the protocol. In every case all remaining processes are handed
//! to the reaper and the handler returns the [`ExitReason`].

use super::entry::{EntryEvent, EntryMessage, ProcessEntry};
use crate::config::{ReaperConfig, ServerConfig};
use crate::error::{LauncherError, Result};
use crate::protocol::{
    serialize, write_frame, Packet, PacketBody, PacketReader, ProcessError,
    ProcessFinishedPacket, StartProcessPacket, Token,
};
use crate::reaper::Reaper;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The client sent `Shutdown`.
    Shutdown,
    /// The client closed the connection or it failed.
    Disconnected,
    /// The client sent something that is not a valid command packet.
    ProtocolError,
}

/// Serves one client connection.
pub struct SocketHandler<S> {
    stream: S,
    reaper: Reaper,
}

impl<S> SocketHandler<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S) -> Self {
        Self::with_reaper(stream, Reaper::new())
    }

    pub fn with_reaper(stream: S, reaper: Reaper) -> Self {
        Self { stream, reaper }
    }

    /// Run until the connection ends, then tear down every process.
    pub async fn run(self) -> ExitReason {
        let (reader, writer) = tokio::io::split(self.stream);
        let mut reader = PacketReader::new(reader);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut table = ProcessTable {
            writer,
            entries: HashMap::new(),
            next_generation: 0,
            events_tx,
            reaper: self.reaper,
            retired: Vec::new(),
        };

        info!("Launcher connection established");
        let reason = loop {
            tokio::select! {
                incoming = reader.next_packet() => match incoming {
                    Ok(Some(packet)) => {
                        if let Some(reason) = table.dispatch(packet).await {
                            break reason;
                        }
                    }
                    Ok(None) => {
                        if !table.entries.is_empty() {
                            warn!(
                                "Client closed connection while {} process(es) still running",
                                table.entries.len()
                            );
                        }
                        break ExitReason::Disconnected;
                    }
                    Err(e) if e.is_protocol_error() => {
                        error!("Protocol error, closing connection: {}", e);
                        break ExitReason::ProtocolError;
                    }
                    Err(e) => {
                        warn!("Reading from client failed: {}", e);
                        break ExitReason::Disconnected;
                    }
                },
                Some(message) = events_rx.recv() => {
                    if let Err(e) = table.on_entry_event(message).await {
                        warn!("Writing to client failed: {}", e);
                        break ExitReason::Disconnected;
                    }
                }
            }
        };

        table.teardown().await;
        info!("Launcher connection closed ({:?})", reason);
        reason
    }
}

struct ProcessTable<W> {
    writer: W,
    entries: HashMap<Token, ProcessEntry>,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<EntryMessage>,
    reaper: Reaper,
    /// Monitor tasks of released entries that may still be handing over.
    retired: Vec<JoinHandle<()>>,
}

impl<S> ProcessTable<WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite,
{
    /// Handle one client packet. Returns `Some` when the connection must end.
    async fn dispatch(&mut self, packet: Packet) -> Option<ExitReason> {
        let token = packet.token;
        let sent = match packet.body {
            PacketBody::StartProcess(start) => self.start(token, start).await,
            PacketBody::WriteIntoProcess(data) => {
                self.write(token, data);
                Ok(())
            }
            PacketBody::StopProcess => self.stop(token).await,
            PacketBody::Shutdown => {
                info!("Shutdown requested by client");
                return Some(ExitReason::Shutdown);
            }
            other => {
                let err = LauncherError::UnexpectedPacket {
                    packet_type: other.packet_type(),
                    side: "launcher",
                };
                error!("Protocol error, closing connection: {}", err);
                return Some(ExitReason::ProtocolError);
            }
        };

        match sent {
            Ok(()) => None,
            Err(e) => {
                warn!("Writing to client failed: {}", e);
                Some(ExitReason::Disconnected)
            }
        }
    }

    async fn start(&mut self, token: Token, start: StartProcessPacket) -> Result<()> {
        if self.entries.contains_key(&token) {
            warn!("Got start request for token {} while its process was running", token);
            return Ok(());
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let command = start.command.clone();
        match ProcessEntry::spawn(
            token,
            generation,
            start,
            self.events_tx.clone(),
            self.reaper.clone(),
        ) {
            Ok(entry) => {
                let pid = entry.pid();
                self.entries.insert(token, entry);
                self.send(token, PacketBody::ProcessStarted { pid: pid as u64 })
                    .await
            }
            Err(message) => {
                debug!("Token {}: failed to start {}: {}", token, command, message);
                self.send(
                    token,
                    PacketBody::ProcessError {
                        error: ProcessError::FailedToStart,
                        error_string: message,
                    },
                )
                .await
            }
        }
    }

    fn write(&mut self, token: Token, data: Bytes) {
        match self.entries.get(&token) {
            None => warn!("Got write request for unknown token {}", token),
            Some(entry) => {
                if !entry.write(data) {
                    debug!("Ignoring write for token {}: stdin is not open", token);
                }
            }
        }
    }

    async fn stop(&mut self, token: Token) -> Result<()> {
        let Some(entry) = self.entries.remove(&token) else {
            debug!("Got stop request for unknown token {}", token);
            return Ok(());
        };

        self.retire(entry);
        self.send(token, PacketBody::ProcessFinished(ProcessFinishedPacket::stopped()))
            .await
    }

    async fn on_entry_event(&mut self, message: EntryMessage) -> Result<()> {
        let token = message.token;
        let live = self
            .entries
            .get(&token)
            .is_some_and(|entry| entry.generation() == message.generation);
        if !live {
            debug!("Dropping event of removed entry for token {}", token);
            return Ok(());
        }

        let body = match message.event {
            EntryEvent::StandardOutput(data) => PacketBody::ReadyReadStandardOutput(data),
            EntryEvent::StandardError(data) => PacketBody::ReadyReadStandardError(data),
            EntryEvent::Error {
                error,
                error_string,
            } => PacketBody::ProcessError {
                error,
                error_string,
            },
            EntryEvent::Finished(finished) => {
                self.entries.remove(&token);
                PacketBody::ProcessFinished(finished)
            }
        };
        self.send(token, body).await
    }

    fn retire(&mut self, entry: ProcessEntry) {
        self.retired.retain(|monitor| !monitor.is_finished());
        self.retired.push(entry.release());
    }

    /// Send one packet. Only a failing socket is an error; a packet that
    /// cannot be encoded is replaced by a small report for its token.
    async fn send(&mut self, token: Token, body: PacketBody) -> Result<()> {
        let packet = Packet::new(token, body);
        let frame = match serialize(&packet) {
            Ok(frame) => frame,
            Err(e) => {
                error!(
                    "Token {}: cannot encode {:?} packet: {}",
                    token,
                    packet.packet_type(),
                    e
                );
                serialize(&Packet::new(token, unencodable_fallback(packet.body, &e)))?
            }
        };
        write_frame(&mut self.writer, &frame).await
    }

    /// Hand every remaining process to the reaper and wait for it.
    async fn teardown(mut self) {
        let remaining: Vec<ProcessEntry> = self.entries.drain().map(|(_, entry)| entry).collect();
        if !remaining.is_empty() {
            debug!("Terminating {} remaining process(es)", remaining.len());
        }
        for entry in remaining {
            self.retire(entry);
        }

        for monitor in self.retired.drain(..) {
            match tokio::time::timeout(ServerConfig::MONITOR_JOIN_TIMEOUT, monitor).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Process monitor task failed: {}", e),
                Err(_) => warn!("Process monitor did not finish hand-over in time"),
            }
        }

        self.reaper.drain(ReaperConfig::DRAIN_TIMEOUT).await;

        if let Err(e) = self.writer.shutdown().await {
            debug!("Closing client connection failed: {}", e);
        }
    }
}

/// What the client gets instead of a packet that does not fit on the wire.
fn unencodable_fallback(body: PacketBody, err: &LauncherError) -> PacketBody {
    match body {
        // The client must still see the process finish.
        PacketBody::ProcessFinished(mut finished) => {
            finished.standard_output = Bytes::new();
            finished.standard_error = Bytes::new();
            PacketBody::ProcessFinished(finished)
        }
        _ => PacketBody::ProcessError {
            error: ProcessError::ReadError,
            error_string: format!("Process output could not be delivered: {}", err),
        },
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::PacketConfig;
    use crate::protocol::{write_packet, ExitStatus, PacketType, ProcessMode};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf};

    struct Client {
        reader: PacketReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        handler: JoinHandle<ExitReason>,
    }

    impl Client {
        fn connect() -> Self {
            let (client, server) = tokio::io::duplex(4096);
            let handler = tokio::spawn(SocketHandler::new(server).run());
            let (reader, writer) = tokio::io::split(client);
            Self {
                reader: PacketReader::new(reader),
                writer,
                handler,
            }
        }

        async fn send(&mut self, token: Token, body: PacketBody) {
            write_packet(&mut self.writer, &Packet::new(token, body))
                .await
                .unwrap();
        }

        async fn start(&mut self, token: Token, command: &str, args: &[&str]) {
            self.send(
                token,
                PacketBody::StartProcess(StartProcessPacket {
                    command: command.to_string(),
                    arguments: args.iter().map(|a| a.to_string()).collect(),
                    ..StartProcessPacket::default()
                }),
            )
            .await;
        }

        async fn recv(&mut self) -> Packet {
            tokio::time::timeout(Duration::from_secs(10), self.reader.next_packet())
                .await
                .expect("packet in time")
                .unwrap()
                .expect("connection open")
        }

        /// Read packets for `token` until its ProcessFinished or ProcessError arrives.
        async fn until_done(&mut self, token: Token) -> Vec<PacketBody> {
            let mut bodies = Vec::new();
            loop {
                let packet = self.recv().await;
                assert_eq!(packet.token, token);
                let done = matches!(
                    packet.body,
                    PacketBody::ProcessFinished(_)
                        | PacketBody::ProcessError {
                            error: ProcessError::FailedToStart,
                            ..
                        }
                );
                bodies.push(packet.body);
                if done {
                    return bodies;
                }
            }
        }

        async fn shutdown(mut self) -> ExitReason {
            write_packet(&mut self.writer, &Packet::shutdown()).await.unwrap();
            self.handler.await.unwrap()
        }
    }

    fn stdout_of(bodies: &[PacketBody]) -> Vec<u8> {
        let mut out = Vec::new();
        for body in bodies {
            match body {
                PacketBody::ReadyReadStandardOutput(data) => out.extend_from_slice(data),
                PacketBody::ProcessFinished(finished) => {
                    out.extend_from_slice(&finished.standard_output)
                }
                _ => {}
            }
        }
        out
    }

    #[tokio::test]
    async fn test_echo_runs_to_completion() {
        let mut client = Client::connect();
        let token = Token::from_raw(1);
        client.start(token, "echo", &["hi"]).await;

        let bodies = client.until_done(token).await;
        assert!(matches!(bodies[0], PacketBody::ProcessStarted { pid } if pid > 0));
        assert_eq!(stdout_of(&bodies), b"hi\n");
        match bodies.last() {
            Some(PacketBody::ProcessFinished(finished)) => {
                assert_eq!(finished.exit_code, 0);
                assert_eq!(finished.exit_status, ExitStatus::NormalExit);
                assert_eq!(finished.error, ProcessError::UnknownError);
            }
            other => panic!("expected ProcessFinished, got {:?}", other),
        }

        assert_eq!(client.shutdown().await, ExitReason::Shutdown);
    }

    #[tokio::test]
    async fn test_missing_program_reports_failed_to_start() {
        let mut client = Client::connect();
        let token = Token::from_raw(2);
        client.start(token, "/nonexistent/program", &[]).await;

        let bodies = client.until_done(token).await;
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].packet_type(), PacketType::ProcessError);

        // The token is free again after a failed start.
        client.start(token, "true", &[]).await;
        let bodies = client.until_done(token).await;
        assert!(matches!(bodies[0], PacketBody::ProcessStarted { .. }));

        assert_eq!(client.shutdown().await, ExitReason::Shutdown);
    }

    #[tokio::test]
    async fn test_stop_synthesizes_crash_report() {
        let mut client = Client::connect();
        let token = Token::from_raw(3);
        client.start(token, "sleep", &["30"]).await;
        assert!(matches!(client.recv().await.body, PacketBody::ProcessStarted { .. }));

        client.send(token, PacketBody::StopProcess).await;
        let packet = client.recv().await;
        match packet.body {
            PacketBody::ProcessFinished(finished) => {
                assert_eq!(finished.error, ProcessError::Crashed);
                assert_eq!(finished.exit_status, ExitStatus::CrashExit);
                assert_eq!(finished.exit_code, -1);
            }
            other => panic!("expected ProcessFinished, got {:?}", other),
        }

        assert_eq!(client.shutdown().await, ExitReason::Shutdown);
    }

    #[tokio::test]
    async fn test_duplicate_start_is_ignored() {
        let mut client = Client::connect();
        let token = Token::from_raw(4);
        client.start(token, "sleep", &["30"]).await;
        client.start(token, "echo", &["second"]).await;
        client.send(token, PacketBody::StopProcess).await;

        // Exactly one start and one finish; the second start never ran.
        assert!(matches!(client.recv().await.body, PacketBody::ProcessStarted { .. }));
        assert!(matches!(client.recv().await.body, PacketBody::ProcessFinished(_)));

        assert_eq!(client.shutdown().await, ExitReason::Shutdown);
    }

    #[tokio::test]
    async fn test_stale_tokens_are_tolerated() {
        let mut client = Client::connect();
        let stale = Token::from_raw(99);
        client.send(stale, PacketBody::WriteIntoProcess(Bytes::from_static(b"x"))).await;
        client.send(stale, PacketBody::StopProcess).await;

        // The connection is still usable afterwards.
        let token = Token::from_raw(5);
        client.start(token, "echo", &["alive"]).await;
        let bodies = client.until_done(token).await;
        assert_eq!(stdout_of(&bodies), b"alive\n");

        // Stopping a finished process is a no-op as well.
        client.send(token, PacketBody::StopProcess).await;
        assert_eq!(client.shutdown().await, ExitReason::Shutdown);
    }

    #[tokio::test]
    async fn test_writer_mode_round_trip() {
        let mut client = Client::connect();
        let token = Token::from_raw(6);
        client
            .send(
                token,
                PacketBody::StartProcess(StartProcessPacket {
                    command: "head".to_string(),
                    arguments: vec!["-n".to_string(), "1".to_string()],
                    process_mode: ProcessMode::Writer,
                    ..StartProcessPacket::default()
                }),
            )
            .await;
        assert!(matches!(client.recv().await.body, PacketBody::ProcessStarted { .. }));

        client
            .send(token, PacketBody::WriteIntoProcess(Bytes::from_static(b"ping\n")))
            .await;
        let bodies = client.until_done(token).await;
        assert_eq!(stdout_of(&bodies), b"ping\n");

        assert_eq!(client.shutdown().await, ExitReason::Shutdown);
    }

    #[tokio::test]
    async fn test_batched_commands_in_one_write() {
        let (client, server) = tokio::io::duplex(4096);
        let handler = tokio::spawn(SocketHandler::new(server).run());
        let (reader, mut writer) = tokio::io::split(client);
        let mut reader = PacketReader::new(reader);

        let first = Token::from_raw(10);
        let second = Token::from_raw(11);
        let mut batch = bytes::BytesMut::new();
        for token in [first, second] {
            crate::protocol::encode(
                &Packet::new(
                    token,
                    PacketBody::StartProcess(StartProcessPacket {
                        command: "true".to_string(),
                        ..StartProcessPacket::default()
                    }),
                ),
                &mut batch,
            )
            .unwrap();
        }
        writer.write_all(&batch).await.unwrap();

        let mut finished = Vec::new();
        while finished.len() < 2 {
            let packet = reader.next_packet().await.unwrap().unwrap();
            if let PacketBody::ProcessFinished(_) = packet.body {
                finished.push(packet.token);
            }
        }
        finished.sort();
        assert_eq!(finished, vec![first, second]);

        write_packet(&mut writer, &Packet::shutdown()).await.unwrap();
        assert_eq!(handler.await.unwrap(), ExitReason::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_running_processes() {
        let mut client = Client::connect();
        let token = Token::from_raw(7);
        client.start(token, "sleep", &["30"]).await;
        let pid = match client.recv().await.body {
            PacketBody::ProcessStarted { pid } => pid as u32,
            other => panic!("expected ProcessStarted, got {:?}", other),
        };

        assert_eq!(client.shutdown().await, ExitReason::Shutdown);
        assert!(!crate::platform::is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_disconnect_terminates_running_processes() {
        let mut client = Client::connect();
        let token = Token::from_raw(8);
        client.start(token, "sleep", &["30"]).await;
        let pid = match client.recv().await.body {
            PacketBody::ProcessStarted { pid } => pid as u32,
            other => panic!("expected ProcessStarted, got {:?}", other),
        };

        let Client {
            reader,
            writer,
            handler,
        } = client;
        drop(writer);
        drop(reader);

        assert_eq!(handler.await.unwrap(), ExitReason::Disconnected);
        assert!(!crate::platform::is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_oversized_packet_is_a_protocol_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        let handler = tokio::spawn(SocketHandler::new(server).run());

        let mut header = Vec::new();
        header.extend_from_slice(&u32::MAX.to_le_bytes());
        header.push(PacketType::WriteIntoProcess.as_u8());
        header.extend_from_slice(&1u64.to_le_bytes());
        client.write_all(&header).await.unwrap();

        assert_eq!(handler.await.unwrap(), ExitReason::ProtocolError);
    }

    #[tokio::test]
    async fn test_status_packet_from_client_is_a_protocol_error() {
        let mut client = Client::connect();
        client
            .send(Token::from_raw(1), PacketBody::ProcessStarted { pid: 1 })
            .await;
        assert_eq!(client.handler.await.unwrap(), ExitReason::ProtocolError);
    }

    #[test]
    fn test_unencodable_finish_still_finishes() {
        let finished = ProcessFinishedPacket {
            exit_code: 4,
            standard_output: Bytes::from(vec![0u8; PacketConfig::MAX_PACKET_SIZE + 1]),
            ..ProcessFinishedPacket::default()
        };
        let token = Token::from_raw(20);
        let err = serialize(&Packet::new(token, PacketBody::ProcessFinished(finished.clone())))
            .unwrap_err();
        assert!(err.is_protocol_error());

        let body = unencodable_fallback(PacketBody::ProcessFinished(finished), &err);
        match &body {
            PacketBody::ProcessFinished(report) => {
                assert_eq!(report.exit_code, 4);
                assert!(report.standard_output.is_empty());
            }
            other => panic!("expected ProcessFinished, got {:?}", other),
        }
        assert!(serialize(&Packet::new(token, body)).is_ok());

        let body = unencodable_fallback(
            PacketBody::ReadyReadStandardOutput(Bytes::from(vec![0u8; PacketConfig::MAX_PACKET_SIZE + 1])),
            &err,
        );
        assert!(matches!(
            body,
            PacketBody::ProcessError {
                error: ProcessError::ReadError,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_running_process_alone() {
        let mut client = Client::connect();
        let running = Token::from_raw(21);
        client.start(running, "sleep", &["30"]).await;
        assert!(matches!(client.recv().await.body, PacketBody::ProcessStarted { .. }));

        let missing = Token::from_raw(22);
        client.start(missing, "/nonexistent/program", &[]).await;
        let bodies = client.until_done(missing).await;
        assert_eq!(bodies.len(), 1);

        client.send(running, PacketBody::StopProcess).await;
        let packet = client.recv().await;
        assert_eq!(packet.token, running);
        assert!(matches!(packet.body, PacketBody::ProcessFinished(_)));

        assert_eq!(client.shutdown().await, ExitReason::Shutdown);
    }
}
