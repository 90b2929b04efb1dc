//! OS process table access.
//!
//! The reaper reaches foreign processes only through the [`ProcessTable`]
//! trait, so tests can substitute an in-memory table. The signal helpers
//! below are shared with the engine, which stops its own children directly.
//! [`SystemProcessTable`] enumerates processes with `sysinfo` and sends
//! signals with `nix` on unix.

use sysinfo::System;

use crate::{AppError, Result};

/// One entry of the OS process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    /// OS process id.
    pub pid: u32,
    /// Executable name.
    pub name: String,
    /// Full command line, arguments joined by spaces.
    pub cmdline: String,
}

/// Read and signal access to the OS process table.
pub trait ProcessTable: Send + Sync {
    /// Snapshot of every visible process.
    fn list(&self) -> Vec<ProcessEntry>;

    /// Whether `pid` currently refers to a live process.
    fn is_alive(&self, pid: u32) -> bool;

    /// Ask the process to exit (SIGTERM on unix).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the signal cannot be delivered.
    fn terminate(&self, pid: u32) -> Result<()>;

    /// Force the process to exit (SIGKILL on unix).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the signal cannot be delivered.
    fn kill(&self, pid: u32) -> Result<()>;
}

/// Process table backed by the running operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl SystemProcessTable {
    /// Construct the system-backed table.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ProcessTable for SystemProcessTable {
    fn list(&self) -> Vec<ProcessEntry> {
        let mut system = System::new();
        system.refresh_processes();
        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_owned(),
                cmdline: process.cmd().join(" "),
            })
            .collect()
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid_alive(pid)
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        send_terminate(pid)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        send_kill(pid)
    }
}

/// Whether `pid` refers to a live process.
#[cfg(unix)]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(nix::unistd::Pid::from_raw(raw), None::<Signal>) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether `pid` refers to a live process.
#[cfg(not(unix))]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_process(sysinfo::Pid::from_u32(pid))
}

/// Send SIGTERM to `pid`. A process that is already gone is not an error.
///
/// # Errors
///
/// Returns `AppError::Io` if the signal cannot be delivered.
#[cfg(unix)]
pub fn send_terminate(pid: u32) -> Result<()> {
    signal(pid, nix::sys::signal::Signal::SIGTERM)
}

/// Send SIGKILL to `pid`. A process that is already gone is not an error.
///
/// # Errors
///
/// Returns `AppError::Io` if the signal cannot be delivered.
#[cfg(unix)]
pub fn send_kill(pid: u32) -> Result<()> {
    signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn signal(pid: u32, sig: nix::sys::signal::Signal) -> Result<()> {
    use nix::errno::Errno;

    let raw = i32::try_from(pid).map_err(|_| AppError::Io(format!("pid {pid} out of range")))?;
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(AppError::Io(format!("failed to send {sig:?} to pid {pid}: {err}"))),
    }
}

/// Stop `pid`. Windows has no graceful signal, so this kills outright.
///
/// # Errors
///
/// Returns `AppError::Io` if the process cannot be killed.
#[cfg(not(unix))]
pub fn send_terminate(pid: u32) -> Result<()> {
    send_kill(pid)
}

/// Kill `pid`. A process that is already gone is not an error.
///
/// # Errors
///
/// Returns `AppError::Io` if the process cannot be killed.
#[cfg(not(unix))]
pub fn send_kill(pid: u32) -> Result<()> {
    let mut system = System::new();
    let sys_pid = sysinfo::Pid::from_u32(pid);
    if !system.refresh_process(sys_pid) {
        return Ok(());
    }
    match system.process(sys_pid) {
        Some(process) if !process.kill() => {
            Err(AppError::Io(format!("failed to kill pid {pid}")))
        }
        _ => Ok(()),
    }
}
