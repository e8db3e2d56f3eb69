//! Process primitive: clone + exec with a scripted, async-signal-safe
//! post-fork setup, reporting exactly which step failed if one did.

mod child;
mod step;

pub use self::step::{ChildError, SetupStep};

use log::debug;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::{pipe, pipe2, Pid};
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::RwLock;
use thiserror::Error;

use crate::filter::CompiledFilter;
use crate::violation::Violation;

/// Exit code reserved for the in-child failure path. Callers must not use it
/// for their own semantics.
pub const CHILD_SETUP_EXIT_CODE: i32 = 253;

/// Serializes the clone against any descriptor-creation path that has to
/// mark close-on-exec non-atomically. Descriptor creators take the read
/// side; the clone takes the write side.
pub(crate) static FORK_LOCK: RwLock<()> = RwLock::new(());

// Resource numbers, stable across Linux architectures.
pub const RLIMIT_CPU: usize = 0;
pub const RLIMIT_FSIZE: usize = 1;
pub const RLIMIT_DATA: usize = 2;
pub const RLIMIT_STACK: usize = 3;
pub const RLIMIT_CORE: usize = 4;
pub const RLIMIT_NPROC: usize = 6;
pub const RLIMIT_NOFILE: usize = 7;
pub const RLIMIT_AS: usize = 9;
pub(crate) const RLIMIT_SLOTS: usize = 16;

/// Slot value meaning "leave this resource alone".
pub const RLIM_UNSET: u64 = u64::MAX;

/// One rlimit slot per resource; set slots are applied in the child with
/// cur = max = value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitTable([u64; RLIMIT_SLOTS]);

impl Default for RlimitTable {
    fn default() -> Self {
        Self([RLIM_UNSET; RLIMIT_SLOTS])
    }
}

impl RlimitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, resource: usize, value: u64) {
        if resource < RLIMIT_SLOTS {
            self.0[resource] = value;
        }
    }

    pub fn get(&self, resource: usize) -> Option<u64> {
        self.0
            .get(resource)
            .copied()
            .filter(|&v| v != RLIM_UNSET)
    }

    pub(crate) fn raw(&self) -> [u64; RLIMIT_SLOTS] {
        self.0
    }
}

/// Everything the child needs, fully materialized in the parent before the
/// clone: C strings for every path, the fd triple, the rlimit table, the
/// rendered BPF program. The string conversions all happen here so the child
/// performs only raw syscalls.
pub struct ChildSpec {
    pub(crate) path: CString,
    pub(crate) argv: Vec<CString>,
    pub(crate) env: Vec<CString>,
    pub(crate) chroot: Option<CString>,
    pub(crate) chdir: Option<CString>,
    pub(crate) setsid: bool,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) umask: u32,
    pub(crate) pdeathsig: i32,
    /// `None` slots are closed in the child.
    pub(crate) stdio: [Option<OwnedFd>; 3],
    pub(crate) rlimits: RlimitTable,
    pub(crate) trace_me: bool,
    pub(crate) no_new_privs: bool,
    pub(crate) filter: Option<CompiledFilter>,
    pub(crate) clone_flags: u64,
}

impl ChildSpec {
    /// Pointer to the target path bytes. Stable while this value is alive;
    /// the seccomp compiler pins its exec rule to this exact pointer.
    pub fn path_ptr(&self) -> *const libc::c_char {
        self.path.as_ptr()
    }

    /// Drop the child-side stdio descriptors (called in the parent right
    /// after a successful spawn).
    pub(crate) fn close_stdio(&mut self) {
        for slot in &mut self.stdio {
            *slot = None;
        }
    }
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("pipe setup failed: {0}")]
    Pipe(Errno),
    #[error("clone failed: {0}")]
    Clone(Errno),
    #[error(transparent)]
    Child(ChildError),
    #[error("status pipe protocol error: {0}")]
    Protocol(Errno),
}

impl SpawnError {
    /// Render the spawn failure as the run's violation. Child failures keep
    /// the exact (step, errno) pair in the detail.
    pub fn violation(&self) -> Violation {
        match self {
            SpawnError::Child(e) => Violation::InternalError {
                detail: format!("{e} (step={}, errno={})", e.step.code(), e.errno as i32),
            },
            other => Violation::InternalError {
                detail: other.to_string(),
            },
        }
    }
}

/// Clone and exec the prepared child, returning its pid once the exec is
/// known to have happened (the close-on-exec status pipe reports EOF), or
/// the exact failure otherwise.
///
/// Must be called from the thread that will later wait on (and, in ptrace
/// mode, trace) the child.
pub fn fork_exec(spec: &ChildSpec) -> Result<Pid, SpawnError> {
    let guard = FORK_LOCK.write().unwrap_or_else(|e| e.into_inner());

    let (err_r, err_w) = pipe_cloexec_unlocked().map_err(SpawnError::Pipe)?;
    let (step_r, step_w) = pipe_cloexec_unlocked().map_err(SpawnError::Pipe)?;

    let mut argv_ptrs: Vec<*const libc::c_char> =
        spec.argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(ptr::null());
    let mut env_ptrs: Vec<*const libc::c_char> = spec.env.iter().map(|e| e.as_ptr()).collect();
    env_ptrs.push(ptr::null());

    let fds = [
        spec.stdio[0].as_ref().map_or(-1, |fd| fd.as_raw_fd()),
        spec.stdio[1].as_ref().map_or(-1, |fd| fd.as_raw_fd()),
        spec.stdio[2].as_ref().map_or(-1, |fd| fd.as_raw_fd()),
    ];
    let fprog = spec.filter.as_ref().map(|f| f.fprog());

    let args = child::ChildArgs {
        path: spec.path.as_ptr(),
        argv: argv_ptrs.as_ptr(),
        envp: env_ptrs.as_ptr(),
        chroot: spec.chroot.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
        chdir: spec.chdir.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
        setsid: spec.setsid,
        uid: spec.uid,
        gid: spec.gid,
        umask: spec.umask,
        pdeathsig: spec.pdeathsig,
        ppid: unsafe { libc::getpid() },
        fds,
        rlimits: spec.rlimits.raw(),
        trace_me: spec.trace_me,
        no_new_privs: spec.no_new_privs,
        fprog: fprog.as_ref().map_or(ptr::null(), |p| p as *const libc::sock_fprog),
        err_fd: err_w.as_raw_fd(),
        step_fd: step_w.as_raw_fd(),
    };

    let rc = unsafe {
        libc::syscall(
            libc::SYS_clone,
            libc::SIGCHLD as libc::c_ulong | spec.clone_flags,
            0usize,
            0usize,
            0usize,
            0usize,
        )
    };
    if rc == 0 {
        // Child. Diverges: execs or exits through the status pipes.
        unsafe { child::enter(&args) }
    }
    drop(guard);
    if rc < 0 {
        return Err(SpawnError::Clone(Errno::last()));
    }
    let pid = Pid::from_raw(rc as i32);
    debug!("cloned child pid {pid}");

    // Close our copies of the write ends so EOF means "exec happened".
    drop(err_w);
    drop(step_w);

    match read_i32(err_r.as_raw_fd()) {
        Ok(None) => Ok(pid),
        Ok(Some(errno)) => {
            let step = match read_i32(step_r.as_raw_fd()) {
                Ok(Some(code)) => SetupStep::from_raw(code),
                _ => SetupStep::ReadPipe,
            };
            reap(pid);
            Err(SpawnError::Child(ChildError {
                step,
                errno: Errno::from_raw(errno),
            }))
        }
        Err(errno) => {
            reap(pid);
            Err(SpawnError::Protocol(errno))
        }
    }
}

/// Atomic close-on-exec pipe for parent-side bridges. The fallback for
/// kernels without pipe2 marks the flags under the fork lock's read side so
/// a concurrent clone cannot leak the raw descriptors.
pub(crate) fn pipe_cloexec() -> nix::Result<(OwnedFd, OwnedFd)> {
    match pipe2(OFlag::O_CLOEXEC) {
        Err(Errno::ENOSYS) => {
            let _guard = FORK_LOCK.read().unwrap_or_else(|e| e.into_inner());
            pipe_then_mark()
        }
        other => other,
    }
}

// Variant for use inside fork_exec, which already holds the write lock.
fn pipe_cloexec_unlocked() -> nix::Result<(OwnedFd, OwnedFd)> {
    match pipe2(OFlag::O_CLOEXEC) {
        Err(Errno::ENOSYS) => pipe_then_mark(),
        other => other,
    }
}

fn pipe_then_mark() -> nix::Result<(OwnedFd, OwnedFd)> {
    let (r, w) = pipe()?;
    mark_cloexec(r.as_raw_fd())?;
    mark_cloexec(w.as_raw_fd())?;
    Ok((r, w))
}

fn mark_cloexec(fd: RawFd) -> nix::Result<()> {
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc < 0 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

/// Read a whole i32 off the status pipe. `Ok(None)` on immediate EOF (the
/// success case), a protocol error on a short read.
fn read_i32(fd: RawFd) -> Result<Option<i32>, Errno> {
    let mut buf = [0u8; 4];
    let mut filled = 0usize;
    while filled < 4 {
        let rc = unsafe {
            libc::read(
                fd,
                buf[filled..].as_mut_ptr() as *mut libc::c_void,
                4 - filled,
            )
        };
        if rc < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                continue;
            }
            return Err(errno);
        }
        if rc == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Errno::EPIPE);
        }
        filled += rc as usize;
    }
    Ok(Some(i32::from_ne_bytes(buf)))
}

/// Wait out a child that failed setup so no zombie accumulates.
fn reap(pid: Pid) {
    let mut status = 0;
    loop {
        let rc = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
        if rc >= 0 || Errno::last() != Errno::EINTR {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rlimit_table_tracks_set_slots() {
        let mut table = RlimitTable::new();
        assert_eq!(table.get(RLIMIT_CPU), None);
        table.set(RLIMIT_CPU, 2);
        table.set(RLIMIT_FSIZE, 1025);
        assert_eq!(table.get(RLIMIT_CPU), Some(2));
        assert_eq!(table.get(RLIMIT_FSIZE), Some(1025));
        assert_eq!(table.get(RLIMIT_AS), None);
    }

    #[test]
    fn out_of_range_resources_are_ignored() {
        let mut table = RlimitTable::new();
        table.set(99, 7);
        assert_eq!(table.get(99), None);
    }

    #[test]
    fn child_failure_violation_keeps_step_and_errno() {
        let err = SpawnError::Child(ChildError {
            step: SetupStep::Chdir,
            errno: Errno::ENOENT,
        });
        match err.violation() {
            Violation::InternalError { detail } => {
                assert!(detail.contains("chdir"), "{detail}");
                assert!(detail.contains("ENOENT"), "{detail}");
                assert!(detail.contains("step=8"), "{detail}");
                assert!(detail.contains("errno=2"), "{detail}");
            }
            other => panic!("unexpected violation {other:?}"),
        }
    }
}
