//! Process-wide owner of launcher interfaces.

use super::{ProcessInterface, ProcessSetup, ProcessVariant, TerminalProcess};
use crate::client::{CallerHandle, LauncherInterface, TransportStatus};
use crate::config::LauncherSettings;
use crate::error::{LauncherError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

/// Creates processes and owns the interfaces that serve them.
///
/// Interfaces are created lazily, on the first process of their variant. An
/// interface whose transport failed is replaced on the next request.
///
/// Teardown happens in [`shutdown`](Self::shutdown) (also run on drop): the
/// in-process interface is shut down first, then the external launcher.
/// Afterwards no new processes can be created.
///
/// Reaping belongs to the socket handler serving each interface, so an
/// interface can only finish shutting down after its reaper did. For the
/// in-process variant the handler runs on the interface's own worker, which
/// waits for it before the thread is joined. For the external launcher the
/// worker waits for the launcher process to exit, which it does after its
/// reaper drained. [`LauncherConfig::SHUTDOWN_TIMEOUT`] covers the handler's
/// monitor join and reaper drain, so that wait is not cut short by default.
///
/// [`LauncherConfig::SHUTDOWN_TIMEOUT`]: crate::config::LauncherConfig::SHUTDOWN_TIMEOUT
pub struct ProcessContext {
    settings: LauncherSettings,
    direct: Mutex<Option<LauncherInterface>>,
    launcher: Mutex<Option<LauncherInterface>>,
    closed: AtomicBool,
}

impl ProcessContext {
    pub fn new(settings: LauncherSettings) -> Self {
        Self {
            settings,
            direct: Mutex::new(None),
            launcher: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &LauncherSettings {
        &self.settings
    }

    /// Create a not yet started process of the variant named in `setup`.
    pub fn create_process(&self, setup: &ProcessSetup) -> Result<Box<dyn ProcessInterface>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LauncherError::TransportUnavailable(
                "process context was shut down".to_string(),
            ));
        }

        let process: Box<dyn ProcessInterface> = match setup.variant {
            ProcessVariant::Direct => {
                let (mut handle, _) =
                    self.handle_from(&self.direct, setup, LauncherInterface::in_process)?;
                setup.apply(&mut handle);
                Box::new(handle)
            }
            ProcessVariant::Launcher => {
                let (mut handle, _) = self.handle_from(&self.launcher, setup, start_launcher)?;
                setup.apply(&mut handle);
                Box::new(handle)
            }
            ProcessVariant::Terminal => {
                let (mut handle, terminal) =
                    self.handle_from(&self.launcher, setup, start_launcher)?;
                setup.apply(&mut handle);
                Box::new(TerminalProcess::new(handle, terminal))
            }
        };
        Ok(process)
    }

    fn handle_from(
        &self,
        slot: &Mutex<Option<LauncherInterface>>,
        setup: &ProcessSetup,
        create: impl FnOnce(&LauncherSettings) -> Result<LauncherInterface>,
    ) -> Result<(CallerHandle, Vec<String>)> {
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let interface = match slot.take() {
            Some(interface) if interface.status() != TransportStatus::Failed => interface,
            stale => {
                if stale.is_some() {
                    warn!("Launcher transport failed, starting a new one");
                }
                drop(stale);
                create(&self.settings)?
            }
        };

        let handle = interface.create_handle(setup.process_mode);
        let terminal = interface.terminal_command().to_vec();
        *slot = Some(interface);
        Ok((handle, terminal))
    }

    /// Shut down every interface. Later calls are no-ops.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down process context");
        for slot in [&self.direct, &self.launcher] {
            let interface = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(mut interface) = interface {
                interface.shutdown();
            }
        }
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(unix)]
fn start_launcher(settings: &LauncherSettings) -> Result<LauncherInterface> {
    LauncherInterface::start(settings)
}

#[cfg(not(unix))]
fn start_launcher(_settings: &LauncherSettings) -> Result<LauncherInterface> {
    Err(LauncherError::TransportUnavailable(
        "the external launcher needs Unix domain sockets".to_string(),
    ))
}
