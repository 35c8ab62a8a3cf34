//! Signal delivery: STOP to suspend, CONT to resume, TERM to terminate. An
//! injectable capability (same seam as `ProcessInspector`) so the
//! controller's state machine can be driven in tests without touching real
//! pids.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    /// ESRCH: the pid no longer exists. Not fatal — the in-flight record is
    /// cleared regardless.
    NoSuchProcess,
    Other,
}

pub trait Signaler: Send + Sync {
    fn stop(&self, pid: i32) -> Result<(), SignalError>;
    fn cont(&self, pid: i32) -> Result<(), SignalError>;
    fn term(&self, pid: i32) -> Result<(), SignalError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KillSignaler;

impl KillSignaler {
    fn send(&self, pid: i32, sig: Signal) -> Result<(), SignalError> {
        match signal::kill(Pid::from_raw(pid), sig) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => Err(SignalError::NoSuchProcess),
            Err(_) => Err(SignalError::Other),
        }
    }
}

impl Signaler for KillSignaler {
    fn stop(&self, pid: i32) -> Result<(), SignalError> {
        self.send(pid, Signal::SIGSTOP)
    }

    fn cont(&self, pid: i32) -> Result<(), SignalError> {
        self.send(pid, Signal::SIGCONT)
    }

    fn term(&self, pid: i32) -> Result<(), SignalError> {
        self.send(pid, Signal::SIGTERM)
    }
}
