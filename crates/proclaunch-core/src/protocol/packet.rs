//! Typed packets exchanged between a client and the launcher.

use super::types::{ChannelMode, ExitStatus, PacketType, ProcessError, ProcessMode, Token};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Everything the launcher needs to start one process.
///
/// Empty `working_directory` and an empty `env` mean "inherit from the
/// launcher". An empty `standard_input_file` means no stdin redirection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartProcessPacket {
    pub command: String,
    pub arguments: Vec<String>,
    pub working_directory: String,
    pub env: BTreeMap<String, String>,
    pub channel_mode: ChannelMode,
    pub standard_input_file: String,
    pub process_mode: ProcessMode,
    pub write_data: Bytes,
    /// Windows only; ignored on Unix.
    pub below_normal_priority: bool,
    /// Windows only; ignored on Unix.
    pub native_arguments: String,
    pub low_priority: bool,
    pub unix_terminal_disabled: bool,
}

/// Final report for a process. Sent exactly once per started process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessFinishedPacket {
    pub error: ProcessError,
    pub error_string: String,
    pub exit_code: i32,
    pub exit_status: ExitStatus,
    /// Output that had not been reported through ReadyRead packets yet.
    pub standard_output: Bytes,
    pub standard_error: Bytes,
}

impl ProcessFinishedPacket {
    /// The report synthesized when a client stops a running process.
    pub fn stopped() -> Self {
        Self {
            error: ProcessError::Crashed,
            error_string: "Process was stopped by the client".to_string(),
            exit_code: -1,
            exit_status: ExitStatus::CrashExit,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    StartProcess(StartProcessPacket),
    WriteIntoProcess(Bytes),
    StopProcess,
    Shutdown,
    ProcessError {
        error: ProcessError,
        error_string: String,
    },
    ProcessStarted {
        pid: u64,
    },
    ReadyReadStandardOutput(Bytes),
    ReadyReadStandardError(Bytes),
    ProcessFinished(ProcessFinishedPacket),
}

impl PacketBody {
    pub fn packet_type(&self) -> PacketType {
        match self {
            PacketBody::StartProcess(_) => PacketType::StartProcess,
            PacketBody::WriteIntoProcess(_) => PacketType::WriteIntoProcess,
            PacketBody::StopProcess => PacketType::StopProcess,
            PacketBody::Shutdown => PacketType::Shutdown,
            PacketBody::ProcessError { .. } => PacketType::ProcessError,
            PacketBody::ProcessStarted { .. } => PacketType::ProcessStarted,
            PacketBody::ReadyReadStandardOutput(_) => PacketType::ReadyReadStandardOutput,
            PacketBody::ReadyReadStandardError(_) => PacketType::ReadyReadStandardError,
            PacketBody::ProcessFinished(_) => PacketType::ProcessFinished,
        }
    }
}

/// A token-addressed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub token: Token,
    pub body: PacketBody,
}

impl Packet {
    pub fn new(token: Token, body: PacketBody) -> Self {
        Self { token, body }
    }

    pub fn shutdown() -> Self {
        Self::new(Token::NONE, PacketBody::Shutdown)
    }

    pub fn packet_type(&self) -> PacketType {
        self.body.packet_type()
    }
}
