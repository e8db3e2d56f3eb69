//! Handle for the spawned child: signalling, group kill, and a wait4
//! wrapper that surfaces the kernel's rusage alongside the decoded status.

use log::{debug, trace};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

/// The spawned process, owned by the supervisor. The done flag avoids
/// signalling a pid that has already been reaped (and possibly reused).
#[derive(Debug)]
pub struct ChildProc {
    pid: Pid,
    done: AtomicBool,
}

impl ChildProc {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            done: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn set_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    /// Signal the child itself. A child that is already gone is not an
    /// error.
    pub fn signal(&self, sig: Signal) -> nix::Result<()> {
        if self.done() {
            return Ok(());
        }
        match kill(self.pid, sig) {
            Err(Errno::ESRCH) => Ok(()),
            other => other,
        }
    }

    /// Signal the child's whole process group, falling back to the child
    /// alone when no group exists (setsid disabled).
    pub fn signal_group(&self, sig: Signal) -> nix::Result<()> {
        if self.done() {
            return Ok(());
        }
        match killpg(self.pid, sig) {
            Err(Errno::ESRCH) | Err(Errno::EPERM) => self.signal(sig),
            other => other,
        }
    }

    /// SIGKILL the group, best effort.
    pub fn kill_group(&self) {
        if let Err(e) = self.signal_group(Signal::SIGKILL) {
            debug!("kill group {} failed: {e}", self.pid);
        } else {
            trace!("killed process group {}", self.pid);
        }
    }
}

/// Outcome of one wait4 call: the decoded status, the raw kernel status
/// word, and the accumulated rusage of the waited process.
pub fn wait4(pid: Pid) -> nix::Result<(WaitStatus, i32, libc::rusage)> {
    let mut status: i32 = 0;
    let mut rusage: libc::rusage = unsafe { mem::zeroed() };
    loop {
        let rc = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut rusage) };
        if rc < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                continue;
            }
            return Err(errno);
        }
        let decoded = WaitStatus::from_raw(Pid::from_raw(rc), status)?;
        return Ok((decoded, status, rusage));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signalling_a_done_child_is_a_no_op() {
        // A pid that certainly does not belong to us; done short-circuits
        // before any kill reaches the kernel.
        let proc_ = ChildProc::new(Pid::from_raw(1));
        proc_.set_done();
        assert!(proc_.signal(Signal::SIGKILL).is_ok());
        assert!(proc_.signal_group(Signal::SIGKILL).is_ok());
    }

    #[test]
    fn signalling_a_vanished_pid_reports_finished() {
        // Huge pid far beyond pid_max: kill returns ESRCH, mapped to Ok.
        let proc_ = ChildProc::new(Pid::from_raw(i32::MAX - 1));
        assert!(proc_.signal(Signal::SIGCONT).is_ok());
    }
}
