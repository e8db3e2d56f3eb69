//! The child side of the clone.
//!
//! Everything in this module runs between clone and execve, where the
//! parent's memory is shared: only direct syscalls are allowed, no
//! allocation, no locking, no library state. All buffers (path, argv, env,
//! the rlimit table, the BPF program) were materialized by the parent before
//! the clone; the status and step pipes are the sole channel out.

use libc::{c_char, c_int, c_ulong, c_void};

use super::step::SetupStep;
use super::{CHILD_SETUP_EXIT_CODE, RLIMIT_SLOTS, RLIM_UNSET};

const SECCOMP_MODE_FILTER: c_ulong = 2;

/// Plain-data view of a `ChildSpec`, flattened to raw pointers and integers
/// so the child never touches an owned type.
pub(super) struct ChildArgs {
    pub path: *const c_char,
    pub argv: *const *const c_char,
    pub envp: *const *const c_char,
    pub chroot: *const c_char,
    pub chdir: *const c_char,
    pub setsid: bool,
    pub uid: u32,
    pub gid: u32,
    pub umask: u32,
    pub pdeathsig: c_int,
    pub ppid: libc::pid_t,
    pub fds: [c_int; 3],
    pub rlimits: [u64; RLIMIT_SLOTS],
    pub trace_me: bool,
    pub no_new_privs: bool,
    pub fprog: *const libc::sock_fprog,
    pub err_fd: c_int,
    pub step_fd: c_int,
}

/// Run the setup script and exec. Steps whose input is not configured are
/// skipped. On any failure the current errno and step are written to the
/// pipes and the child exits with the reserved code.
///
/// # Safety
///
/// Must be called exactly once, in the child, immediately after clone. All
/// pointers in `args` must stay valid in the parent until the clone returns
/// (the parent keeps them alive across the whole call).
pub(super) unsafe fn enter(a: &ChildArgs) -> ! {
    let mut err_fd = a.err_fd;
    let mut step_fd = a.step_fd;
    let mut step = SetupStep::Clone.code();

    macro_rules! die {
        () => {{
            let errno: c_int = *libc::__errno_location();
            let _ = libc::write(err_fd, &errno as *const c_int as *const c_void, 4);
            let _ = libc::write(step_fd, &step as *const c_int as *const c_void, 4);
            loop {
                libc::_exit(CHILD_SETUP_EXIT_CODE);
            }
        }};
    }

    if a.setsid {
        step = SetupStep::SetSid.code();
        if libc::setsid() < 0 {
            die!();
        }
    }

    if !a.chroot.is_null() {
        step = SetupStep::Chroot.code();
        if libc::chroot(a.chroot) < 0 {
            die!();
        }
    }

    // Privilege drop: group first, then user, then umask. IDs of zero are
    // not applied.
    if a.gid != 0 {
        step = SetupStep::SetGid.code();
        if libc::setgid(a.gid) < 0 {
            die!();
        }
    }
    if a.uid != 0 {
        step = SetupStep::SetUid.code();
        if libc::setuid(a.uid) < 0 {
            die!();
        }
    }
    if a.umask != 0 {
        step = SetupStep::SetUmask.code();
        libc::umask(a.umask as libc::mode_t);
    }

    if !a.chdir.is_null() {
        step = SetupStep::Chdir.code();
        if libc::chdir(a.chdir) < 0 {
            die!();
        }
    }

    if a.pdeathsig != 0 {
        step = SetupStep::SetPdeathsig.code();
        if libc::prctl(libc::PR_SET_PDEATHSIG, a.pdeathsig as c_ulong, 0, 0, 0) < 0 {
            die!();
        }
        // The parent may already be gone, in which case the death signal
        // will never fire; deliver it by hand. A duplicate signal is
        // harmless for SIGKILL.
        if libc::getppid() != a.ppid {
            step = SetupStep::ParentGoneSelfKill.code();
            if libc::kill(libc::getpid(), a.pdeathsig) < 0 {
                die!();
            }
        }
    }

    step = SetupStep::DupFd.code();
    let mut fd = a.fds;
    let mut nextfd: c_int = 3;
    for f in fd {
        if f >= nextfd {
            nextfd = f + 1;
        }
    }
    // Lift both pipes above the working range so the shuffle below cannot
    // stomp them.
    if err_fd < nextfd {
        while nextfd == step_fd {
            nextfd += 1;
        }
        if libc::dup2(err_fd, nextfd) < 0 {
            die!();
        }
        libc::fcntl(nextfd, libc::F_SETFD, libc::FD_CLOEXEC);
        err_fd = nextfd;
        nextfd += 1;
    }
    if step_fd < nextfd {
        while nextfd == err_fd {
            nextfd += 1;
        }
        if libc::dup2(step_fd, nextfd) < 0 {
            die!();
        }
        libc::fcntl(nextfd, libc::F_SETFD, libc::FD_CLOEXEC);
        step_fd = nextfd;
        nextfd += 1;
    }
    // Pass 1: any source that collides with a lower target number moves up
    // above the current ceiling so pass 2 cannot overwrite it early.
    let mut i: usize = 0;
    while i < 3 {
        if fd[i] >= 0 && fd[i] < i as c_int {
            while nextfd == err_fd || nextfd == step_fd {
                nextfd += 1;
            }
            if libc::dup2(fd[i], nextfd) < 0 {
                die!();
            }
            libc::fcntl(nextfd, libc::F_SETFD, libc::FD_CLOEXEC);
            fd[i] = nextfd;
            nextfd += 1;
        }
        i += 1;
    }
    // Pass 2: dup each source down onto its final slot. dup2 creates the
    // target without close-on-exec, which is what the exec needs.
    i = 0;
    while i < 3 {
        let target = i as c_int;
        if fd[i] < 0 {
            libc::close(target);
        } else if fd[i] == target {
            // dup2(n, n) leaves close-on-exec alone; clear it explicitly.
            if libc::fcntl(target, libc::F_SETFD, 0) < 0 {
                die!();
            }
        } else if libc::dup2(fd[i], target) < 0 {
            die!();
        }
        i += 1;
    }

    step = SetupStep::SetRlimit.code();
    let mut res: usize = 0;
    while res < RLIMIT_SLOTS {
        let value = a.rlimits[res];
        if value != RLIM_UNSET {
            let rl = libc::rlimit {
                rlim_cur: value,
                rlim_max: value,
            };
            if libc::syscall(libc::SYS_setrlimit, res as c_ulong, &rl as *const libc::rlimit) < 0 {
                die!();
            }
        }
        res += 1;
    }

    if a.trace_me {
        step = SetupStep::SetPtrace.code();
        if libc::ptrace(libc::PTRACE_TRACEME, 0, 0, 0) < 0 {
            die!();
        }
    }

    // Unprivileged seccomp requires no_new_privs before the filter loads.
    if a.no_new_privs {
        step = SetupStep::SetNoNewPrivs.code();
        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) < 0 {
            die!();
        }
    }

    if !a.fprog.is_null() {
        step = SetupStep::SetSeccomp.code();
        if libc::prctl(libc::PR_SET_SECCOMP, SECCOMP_MODE_FILTER, a.fprog as c_ulong) < 0 {
            die!();
        }
    }

    step = SetupStep::Exec.code();
    libc::execve(a.path, a.argv, a.envp);
    die!();
}
