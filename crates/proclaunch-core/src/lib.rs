//! proclaunch - out-of-process launcher for child processes.
//!
//! A client hands process creation to a separate launcher process and talks
//! to it over a local socket with a small length-prefixed binary protocol.
//! The launcher owns the real OS processes and reports their lifecycle back.
//!
//! - [`protocol`]: packet types and the wire codec
//! - [`server`]: the launcher side (socket handler and process table)
//! - [`client`]: launcher interface and caller handles
//! - [`process`]: one trait over the direct, launcher and terminal variants
//!
//! # Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use proclaunch::{LauncherInterface, LauncherSettings, ProcessMode};
//! use std::time::Duration;
//!
//! fn main() -> proclaunch::Result<()> {
//!     let launcher = LauncherInterface::in_process(&LauncherSettings::default())?;
//!     let mut handle = launcher.create_handle(ProcessMode::Reader);
//!
//!     handle.start("echo", &["hi".to_string()], Bytes::new())?;
//!     handle.wait_for_finished(Duration::from_secs(5));
//!     assert_eq!(handle.read_all_standard_output(), "hi\n");
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod platform;
pub mod process;
pub mod protocol;
pub mod reaper;
pub mod server;

// Re-export commonly used types
pub use client::{CallerHandle, HandleState, LauncherInterface, ProcessEvent, TransportStatus};
pub use config::LauncherSettings;
pub use error::{LauncherError, Result};
pub use process::{ProcessContext, ProcessInterface, ProcessSetup, ProcessVariant};
pub use protocol::{
    ChannelMode, ExitStatus, Packet, PacketBody, PacketType, ProcessError, ProcessMode,
    ProcessState, Token,
};
pub use reaper::Reaper;
pub use server::{ExitReason, SocketHandler};
