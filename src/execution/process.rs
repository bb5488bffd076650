//! Process-Group Termination
//!
//! Tools are launched as leaders of their own process group so a scan
//! and everything it forks can be stopped together. Signal delivery
//! sits behind [`Signaller`] so the escalation sequence can be tested
//! without touching real processes.

use std::collections::HashMap;
use std::io;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};

/// Signals used during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Term => "TERM",
            Self::Kill => "KILL",
        }
    }
}

/// Delivers signals to a process or a whole process group.
pub trait Signaller: Send + Sync {
    fn signal_process(&self, pid: i32, signal: Signal) -> io::Result<()>;
    fn signal_group(&self, pgid: i32, signal: Signal) -> io::Result<()>;
}

/// Direct `kill(2)`; used when we own the target processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcSignaller;

impl Signaller for LibcSignaller {
    fn signal_process(&self, pid: i32, signal: Signal) -> io::Result<()> {
        raw_kill(pid, signal)
    }

    fn signal_group(&self, pgid: i32, signal: Signal) -> io::Result<()> {
        raw_kill(-pgid, signal)
    }
}

fn raw_kill(pid: i32, signal: Signal) -> io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal.as_raw()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Goes through `sudo -n kill` for children started with sudo while
/// this process is unprivileged.
#[derive(Debug, Default, Clone, Copy)]
pub struct SudoSignaller;

impl SudoSignaller {
    fn sudo_kill(target: &str, signal: Signal) -> io::Result<()> {
        let status = Command::new("sudo")
            .args(["-n", "kill", "-s", signal.name(), "--", target])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("sudo kill -s {} {} failed: {}", signal.name(), target, status),
            ))
        }
    }
}

impl Signaller for SudoSignaller {
    fn signal_process(&self, pid: i32, signal: Signal) -> io::Result<()> {
        Self::sudo_kill(&pid.to_string(), signal)
    }

    fn signal_group(&self, pgid: i32, signal: Signal) -> io::Result<()> {
        Self::sudo_kill(&format!("-{}", pgid), signal)
    }
}

static LIBC_SIGNALLER: LibcSignaller = LibcSignaller;
static SUDO_SIGNALLER: SudoSignaller = SudoSignaller;

/// True when running with an effective uid of 0.
pub fn is_root() -> bool {
    // SAFETY: geteuid(2) cannot fail and touches no memory.
    unsafe { libc::geteuid() == 0 }
}

/// Picks the signaller able to reach a child.
pub fn signaller_for(launched_with_sudo: bool) -> &'static dyn Signaller {
    if launched_with_sudo && !is_root() {
        &SUDO_SIGNALLER
    } else {
        &LIBC_SIGNALLER
    }
}

fn report(result: io::Result<()>, what: &str, pid: i32) {
    if let Err(e) = result {
        // ESRCH just means it is already gone.
        debug!("{} {} failed: {}", what, pid, e);
    }
}

/// Stops a process-group leader and its group.
///
/// Sequence: hard-kill the leader, SIGTERM the group, wait `grace`,
/// then hard-kill the group and the leader again.
pub async fn terminate_process_tree(
    signaller: &dyn Signaller,
    pid: u32,
    grace: Duration,
    hard_kill: Signal,
) {
    let Ok(pid) = i32::try_from(pid) else {
        warn!("Refusing to signal out-of-range pid {}", pid);
        return;
    };

    debug!("Terminating process group {}", pid);
    report(signaller.signal_process(pid, hard_kill), "kill", pid);
    report(signaller.signal_group(pid, Signal::Term), "SIGTERM group", pid);

    tokio::time::sleep(grace).await;

    report(signaller.signal_group(pid, hard_kill), "hard-kill group", pid);
    report(signaller.signal_process(pid, hard_kill), "hard-kill leader", pid);
}

/// SIGKILLs this process's own group, including the caller.
pub fn kill_own_process_group() {
    // kill(0, sig) targets the caller's process group.
    report(raw_kill(0, Signal::Kill), "kill own group", 0);
}

/// Process groups currently owned by tool invocations.
///
/// The cancellation watchdog uses this to force-kill everything still
/// running when a graceful stop takes too long.
#[derive(Debug, Clone, Default)]
pub struct ActiveProcesses {
    inner: Arc<Mutex<HashMap<u32, bool>>>,
}

impl ActiveProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, bool>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tracks `pid` until the returned guard is dropped.
    pub fn register(&self, pid: u32, launched_with_sudo: bool) -> ProcessGuard {
        self.lock().insert(pid, launched_with_sudo);
        ProcessGuard {
            registry: self.clone(),
            pid,
        }
    }

    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// SIGKILLs every registered group and leader.
    pub fn kill_all(&self) {
        let entries: Vec<(u32, bool)> = self.lock().iter().map(|(p, s)| (*p, *s)).collect();
        for (pid, sudo) in entries {
            let Ok(pid) = i32::try_from(pid) else {
                continue;
            };
            let signaller = signaller_for(sudo);
            warn!("Force-killing process group {}", pid);
            report(signaller.signal_group(pid, Signal::Kill), "kill group", pid);
            report(signaller.signal_process(pid, Signal::Kill), "kill leader", pid);
        }
    }
}

/// Removes its pid from the registry on drop.
#[derive(Debug)]
pub struct ProcessGuard {
    registry: ActiveProcesses,
    pid: u32,
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.pid);
    }
}
