//! Error types for the process launcher.
//!
//! Protocol errors (oversized, malformed or misdirected packets) are fatal for
//! the connection that produced them. Everything else is scoped to a single
//! operation.

use crate::protocol::PacketType;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the launcher library.
#[derive(Debug, Error)]
pub enum LauncherError {
    // Protocol errors
    #[error("Packet size {size} exceeds maximum {max}")]
    InvalidPacketSize { size: usize, max: usize },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("Unexpected {packet_type:?} packet received by the {side}")]
    UnexpectedPacket {
        packet_type: PacketType,
        side: &'static str,
    },

    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Launcher executable not found or not executable: {0}")]
    LauncherNotFound(PathBuf),

    #[error("Launcher transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    // Handle misuse
    #[error("Cannot {operation} while process is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Write rejected: {0}")]
    WriteNotAllowed(String),
}

/// Result type alias for launcher operations.
pub type Result<T> = std::result::Result<T, LauncherError>;

impl From<std::io::Error> for LauncherError {
    fn from(err: std::io::Error) -> Self {
        LauncherError::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl LauncherError {
    /// Create an IO error with a short description of what was attempted.
    pub fn io_with_context(err: std::io::Error, context: impl Into<String>) -> Self {
        LauncherError::Io {
            message: format!("{}: {}", context.into(), err),
            source: err,
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        LauncherError::MalformedPacket(message.into())
    }

    /// Whether this error means the peer violated the wire protocol.
    ///
    /// A connection that produced a protocol error cannot be resynchronized
    /// and must be torn down.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            LauncherError::InvalidPacketSize { .. }
                | LauncherError::MalformedPacket(_)
                | LauncherError::UnknownPacketType(_)
                | LauncherError::UnexpectedPacket { .. }
        )
    }
}
