//! Launcher wire protocol.
//!
//! A connection carries a stream of length-prefixed, type-tagged packets.
//! Clients send commands (`StartProcess`, `WriteIntoProcess`, `StopProcess`,
//! `Shutdown`); the launcher answers with status packets addressed by the
//! same [`Token`].

mod codec;
mod packet;
mod types;

pub use codec::{decode, encode, serialize, write_frame, write_packet, PacketReader};
pub use packet::{Packet, PacketBody, ProcessFinishedPacket, StartProcessPacket};
pub use types::{ChannelMode, ExitStatus, PacketType, ProcessError, ProcessMode, ProcessState, Token};
