//! Client side of the launcher protocol.
//!
//! A [`LauncherInterface`] owns the connection to one launcher and a worker
//! thread that does all socket I/O. Each remote process is represented by a
//! [`CallerHandle`] that stays on the caller's thread.
//!
//! # Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use proclaunch::client::LauncherInterface;
//! use proclaunch::{LauncherSettings, ProcessMode};
//! use std::time::Duration;
//!
//! fn main() -> proclaunch::Result<()> {
//!     let launcher = LauncherInterface::start(&LauncherSettings::default())?;
//!     let mut handle = launcher.create_handle(ProcessMode::Reader);
//!     handle.start("echo", &["hi".to_string()], Bytes::new())?;
//!
//!     if handle.wait_for_finished(Duration::from_secs(5)) {
//!         println!("{:?}", handle.read_all_standard_output());
//!     }
//!     Ok(())
//! }
//! ```

mod handle;
mod interface;
mod transport;

pub use handle::{CallerHandle, HandleState, ProcessEvent};
pub use interface::LauncherInterface;
pub use transport::TransportStatus;
