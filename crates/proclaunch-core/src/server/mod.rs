//! Launcher (server) side: one [`SocketHandler`] per client connection,
//! owning a table of running processes.

mod entry;
mod handler;

pub use handler::{ExitReason, SocketHandler};

#[cfg(unix)]
use crate::error::{LauncherError, Result};
#[cfg(unix)]
use std::path::Path;

/// Connect to the client listening at `socket_path` and serve it until the
/// connection ends.
#[cfg(unix)]
pub async fn serve_unix(socket_path: &Path) -> Result<ExitReason> {
    let stream = tokio::net::UnixStream::connect(socket_path)
        .await
        .map_err(|e| {
            LauncherError::io_with_context(e, format!("connect to {}", socket_path.display()))
        })?;
    Ok(SocketHandler::new(stream).run().await)
}
