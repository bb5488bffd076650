//! Cancellation Coordinator
//!
//! Turns SIGINT/SIGTERM/SIGQUIT into cooperative cancellation:
//!
//! ```text
//! Armed -> SignalReceived -> Cancelling -> ForceKilled | CleanExit
//! ```
//!
//! The first signal cancels the shared token and arms a watchdog that
//! force-kills every tool process group if the run has not wound down
//! in time. A second signal exits immediately.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::process::{kill_own_process_group, ActiveProcesses};

/// Exit status for a user-cancelled run.
pub const CANCELLED_EXIT_CODE: i32 = 130;

pub const DEFAULT_PRIVILEGED_WATCHDOG: Duration = Duration::from_secs(2);
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Armed,
    SignalReceived,
    Cancelling,
    ForceKilled,
    CleanExit,
}

/// What the signal listener must do for one received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Cancel the token and force-kill after `watchdog`
    Graceful { watchdog: Duration },
    /// Exit now; also kill our own process group when privileged
    ForceExit { kill_process_group: bool },
    Ignore,
}

#[derive(Debug)]
pub struct CancellationCoordinator {
    state: Mutex<CancelState>,
    token: CancellationToken,
    processes: ActiveProcesses,
    privileged: bool,
    privileged_watchdog: Duration,
    watchdog: Duration,
}

impl CancellationCoordinator {
    pub fn new(token: CancellationToken, processes: ActiveProcesses, privileged: bool) -> Self {
        Self {
            state: Mutex::new(CancelState::Armed),
            token,
            processes,
            privileged,
            privileged_watchdog: DEFAULT_PRIVILEGED_WATCHDOG,
            watchdog: DEFAULT_WATCHDOG,
        }
    }

    pub fn with_watchdogs(mut self, privileged: Duration, normal: Duration) -> Self {
        self.privileged_watchdog = privileged;
        self.watchdog = normal;
        self
    }

    fn lock(&self) -> MutexGuard<'_, CancelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CancelState {
        *self.lock()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn watchdog_delay(&self) -> Duration {
        if self.privileged {
            self.privileged_watchdog
        } else {
            self.watchdog
        }
    }

    /// Advances the state machine for one received signal.
    pub fn on_signal(&self) -> SignalAction {
        let mut state = self.lock();
        match *state {
            CancelState::Armed => {
                *state = CancelState::SignalReceived;
                SignalAction::Graceful {
                    watchdog: self.watchdog_delay(),
                }
            }
            CancelState::SignalReceived | CancelState::Cancelling => {
                *state = CancelState::ForceKilled;
                SignalAction::ForceExit {
                    kill_process_group: self.privileged,
                }
            }
            CancelState::ForceKilled | CancelState::CleanExit => SignalAction::Ignore,
        }
    }

    /// Cancels the shared token.
    pub fn begin_cancelling(&self) {
        {
            let mut state = self.lock();
            if *state == CancelState::SignalReceived {
                *state = CancelState::Cancelling;
            }
        }
        self.token.cancel();
    }

    /// Records that the run returned on its own. False if already force-killed.
    pub fn mark_clean_exit(&self) -> bool {
        let mut state = self.lock();
        if *state == CancelState::ForceKilled {
            return false;
        }
        *state = CancelState::CleanExit;
        true
    }

    /// Kills every tracked tool process group.
    pub fn force_kill(&self, kill_process_group: bool) {
        *self.lock() = CancelState::ForceKilled;
        self.processes.kill_all();
        if kill_process_group {
            kill_own_process_group();
        }
    }

    /// Watchdog body: force-kill unless the run already exited cleanly.
    /// Returns true when it killed.
    pub fn expire_watchdog(&self) -> bool {
        {
            let mut state = self.lock();
            if *state != CancelState::Cancelling && *state != CancelState::SignalReceived {
                return false;
            }
            *state = CancelState::ForceKilled;
        }
        error!("Shutdown timed out, force-killing remaining processes");
        self.processes.kill_all();
        true
    }

    /// Listens for SIGINT/SIGTERM/SIGQUIT for the rest of the process.
    ///
    /// Exits the process with [`CANCELLED_EXIT_CODE`] on a second signal
    /// or when the watchdog fires.
    pub fn install(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;
        let coordinator = Arc::clone(self);

        Ok(tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = sigint.recv() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                    _ = sigquit.recv() => "SIGQUIT",
                };

                match coordinator.on_signal() {
                    SignalAction::Graceful { watchdog } => {
                        warn!(
                            "Received {}, cancelling running scans (signal again to force)",
                            name
                        );
                        coordinator.begin_cancelling();

                        let watchdog_owner = Arc::clone(&coordinator);
                        tokio::spawn(async move {
                            tokio::time::sleep(watchdog).await;
                            if watchdog_owner.expire_watchdog() {
                                std::process::exit(CANCELLED_EXIT_CODE);
                            }
                        });
                    }
                    SignalAction::ForceExit { kill_process_group } => {
                        warn!("Received {} again, exiting immediately", name);
                        coordinator.force_kill(kill_process_group);
                        std::process::exit(CANCELLED_EXIT_CODE);
                    }
                    SignalAction::Ignore => info!("Ignoring {} during shutdown", name),
                }
            }
        }))
    }
}
