//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific process behavior live here rather
//! than being scattered through the server and client code.
//!
//! # Supported Platforms
//!
//! - **Linux**: Full support
//! - **macOS**: Full support
//! - **Windows**: Builds, but signals and child flags are no-ops

pub mod process;

pub use process::{configure_child, is_process_alive, request_terminate, ChildFlags};
