//! Owner of the launcher connection.

use super::handle::CallerHandle;
use super::transport::{self, Request, ServerHost, TransportState, TransportStatus};
use crate::config::{LauncherConfig, LauncherSettings};
use crate::error::{LauncherError, Result};
use crate::protocol::{ProcessMode, Token};
use crate::server::SocketHandler;
use std::future::Future;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Connection to one launcher plus the `launcher-io` thread driving it.
///
/// Caller threads never do socket I/O themselves. Every [`CallerHandle`]
/// created here posts its commands to the worker thread and receives events
/// back on its own channel.
pub struct LauncherInterface {
    requests: mpsc::UnboundedSender<Request>,
    state: Arc<TransportState>,
    worker: Option<JoinHandle<()>>,
    terminal_command: Vec<String>,
    // Removed after the worker is joined, taking the socket file with it.
    socket_dir: Option<TempDir>,
}

impl std::fmt::Debug for LauncherInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LauncherInterface")
            .field("status", &self.status())
            .field("socket_dir", &self.socket_dir.as_ref().map(TempDir::path))
            .finish()
    }
}

impl LauncherInterface {
    /// Spawn the launcher executable and connect to it over a Unix socket.
    ///
    /// Returns once the launcher was spawned; the connection completes in the
    /// background and handles started before that are queued.
    #[cfg(unix)]
    pub fn start(settings: &LauncherSettings) -> Result<Self> {
        use crate::platform::{configure_child, ChildFlags};
        use std::process::Stdio;
        use tokio::net::UnixListener;

        let server = settings.resolve_server_path()?;
        let socket_dir = tempfile::Builder::new()
            .prefix(LauncherConfig::SOCKET_DIR_PREFIX)
            .tempdir()
            .map_err(|e| LauncherError::io_with_context(e, "create launcher socket directory"))?;
        let socket_path = socket_dir.path().join(LauncherConfig::SOCKET_FILE_NAME);

        let runtime = build_runtime()?;
        let guard = runtime.enter();

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            LauncherError::io_with_context(e, format!("bind {}", socket_path.display()))
        })?;

        let mut command = tokio::process::Command::new(&server);
        command
            .arg(&socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        configure_child(
            &mut command,
            ChildFlags {
                new_process_group: true,
                ..ChildFlags::default()
            },
        );
        let mut child = command.spawn().map_err(|e| {
            LauncherError::io_with_context(e, format!("spawn launcher {}", server.display()))
        })?;
        info!(
            "Spawned launcher {} (pid {:?})",
            server.display(),
            child.id()
        );

        let relay = match child.stderr.take() {
            Some(stderr) => runtime.spawn(transport::relay_stderr(stderr)),
            None => runtime.spawn(async {}),
        };

        let connect_timeout = settings.connect_timeout();
        let connect = async move {
            match tokio::time::timeout(connect_timeout, listener.accept()).await {
                Ok(Ok((stream, _))) => Ok(stream),
                Ok(Err(e)) => Err(LauncherError::io_with_context(
                    e,
                    "accept launcher connection",
                )),
                Err(_) => Err(LauncherError::Timeout(connect_timeout)),
            }
        };

        drop(guard);
        Self::launch(
            runtime,
            connect,
            ServerHost::Process { child, relay },
            settings,
            Some(socket_dir),
        )
    }

    /// Serve processes from a socket handler running on the worker thread
    /// itself, over an in-memory stream. Uses the same protocol and process
    /// table as an external launcher.
    pub fn in_process(settings: &LauncherSettings) -> Result<Self> {
        let runtime = build_runtime()?;
        let (client, server) = tokio::io::duplex(LauncherConfig::IN_PROCESS_BUFFER_SIZE);
        let handler = runtime.spawn(SocketHandler::new(server).run());

        Self::launch(
            runtime,
            std::future::ready(Ok(client)),
            ServerHost::InProcess(handler),
            settings,
            None,
        )
    }

    fn launch<S, C>(
        runtime: Runtime,
        connect: C,
        host: ServerHost,
        settings: &LauncherSettings,
        socket_dir: Option<TempDir>,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        C: Future<Output = Result<S>> + Send + 'static,
    {
        let state = Arc::new(TransportState::new());
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let worker_state = Arc::clone(&state);
        let shutdown_timeout = settings.shutdown_timeout();

        let worker = std::thread::Builder::new()
            .name("launcher-io".to_string())
            .spawn(move || {
                runtime.block_on(transport::run(
                    connect,
                    host,
                    requests_rx,
                    worker_state,
                    shutdown_timeout,
                ));
                debug!("Launcher worker finished");
            })
            .map_err(|e| LauncherError::io_with_context(e, "spawn launcher-io thread"))?;

        Ok(Self {
            requests,
            state,
            worker: Some(worker),
            terminal_command: settings.terminal_command().to_vec(),
            socket_dir,
        })
    }

    pub fn status(&self) -> TransportStatus {
        self.state.get()
    }

    /// Command prefix used for terminal-hosted processes.
    pub fn terminal_command(&self) -> &[String] {
        &self.terminal_command
    }

    /// Create a handle bound to `token`. Tokens must be unique per interface.
    pub fn register_handle(&self, token: Token, process_mode: ProcessMode) -> CallerHandle {
        let (events_tx, events_rx) = std_mpsc::channel();
        let request = Request::Register {
            token,
            events: events_tx,
        };
        if self.requests.send(request).is_err() {
            debug!("Registering token {} after the launcher worker exited", token);
        }
        CallerHandle::new(
            token,
            process_mode,
            self.requests.clone(),
            Arc::clone(&self.state),
            events_rx,
        )
    }

    /// [`register_handle`](Self::register_handle) with a fresh token.
    pub fn create_handle(&self, process_mode: ProcessMode) -> CallerHandle {
        self.register_handle(Token::unique(), process_mode)
    }

    /// Forget `token`, stopping its process if it is still running. Unknown
    /// tokens are ignored.
    pub fn unregister_handle(&self, token: Token) {
        if self.requests.send(Request::Unregister { token }).is_err() {
            debug!("Unregistering token {} after the launcher worker exited", token);
        }
    }

    /// Ask the launcher to shut down, wait for it and join the worker thread.
    /// Calling this more than once is harmless.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        info!("Shutting down launcher");
        if self.requests.send(Request::Shutdown).is_err() {
            debug!("Launcher worker already exited");
        }
        if worker.join().is_err() {
            warn!("Launcher worker thread panicked");
        }
        if let Some(dir) = self.socket_dir.take() {
            if let Err(e) = dir.close() {
                debug!("Failed to remove launcher socket directory: {}", e);
            }
        }
    }
}

impl Drop for LauncherInterface {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| LauncherError::io_with_context(e, "build launcher runtime"))
}
