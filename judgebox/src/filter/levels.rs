//! Allow-list data for the run levels. Levels are cumulative: level N
//! permits the union of the first N groups. The tables are data, not logic;
//! names unknown to the running architecture are skipped at compile time.

/// Group 1: pure computation: memory, IO on already-open descriptors,
/// clocks, signal plumbing, and the handful of calls libc needs to start a
/// static binary.
const BASE: &[&str] = &[
    "read",
    "write",
    "readv",
    "writev",
    "lseek",
    "close",
    "fstat",
    "brk",
    "mmap",
    "munmap",
    "mprotect",
    "madvise",
    "mremap",
    "arch_prctl",
    "exit",
    "exit_group",
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "sigaltstack",
    "gettid",
    "getpid",
    "getppid",
    "getrandom",
    "clock_gettime",
    "clock_getres",
    "gettimeofday",
    "time",
    "nanosleep",
    "clock_nanosleep",
    "restart_syscall",
    "pause",
    "futex",
    "set_tid_address",
    "set_robust_list",
    "rseq",
    "sched_yield",
    "prlimit64",
    "getrlimit",
    "uname",
];

/// Group 2: read-only filesystem access (opens, stats, directory walks).
const FS_READ: &[&str] = &[
    "open",
    "openat",
    "openat2",
    "access",
    "faccessat",
    "faccessat2",
    "stat",
    "lstat",
    "newfstatat",
    "statx",
    "readlink",
    "readlinkat",
    "getdents",
    "getdents64",
    "getcwd",
    "statfs",
    "fstatfs",
    "fadvise64",
    "pread64",
    "preadv",
    "preadv2",
];

/// Group 3: filesystem mutation. The output rlimit still caps how much can
/// actually be written.
const FS_WRITE: &[&str] = &[
    "creat",
    "truncate",
    "ftruncate",
    "mkdir",
    "mkdirat",
    "unlink",
    "unlinkat",
    "rename",
    "renameat",
    "renameat2",
    "chmod",
    "fchmod",
    "fchmodat",
    "link",
    "linkat",
    "symlink",
    "symlinkat",
    "pwrite64",
    "pwritev",
    "pwritev2",
    "fsync",
    "fdatasync",
    "fallocate",
    "utimensat",
    "umask",
];

/// Group 4: descriptor plumbing and process introspection.
const PLUMBING: &[&str] = &[
    "dup",
    "dup2",
    "dup3",
    "fcntl",
    "pipe",
    "pipe2",
    "poll",
    "ppoll",
    "select",
    "pselect6",
    "epoll_create",
    "epoll_create1",
    "epoll_ctl",
    "epoll_wait",
    "epoll_pwait",
    "eventfd",
    "eventfd2",
    "ioctl",
    "getuid",
    "geteuid",
    "getgid",
    "getegid",
    "getgroups",
    "getpgid",
    "getpgrp",
    "getsid",
    "getrusage",
    "times",
    "sysinfo",
    "sched_getaffinity",
    "sched_getparam",
    "sched_getscheduler",
    "getpriority",
    "getcpu",
    "capget",
];

/// Group 5: threads and memory-management extras.
const THREADS: &[&str] = &[
    "clone",
    "clone3",
    "tkill",
    "tgkill",
    "membarrier",
    "get_robust_list",
    "msync",
    "mlock",
    "munlock",
    "mlockall",
    "munlockall",
    "mincore",
    "sched_setaffinity",
    "setpriority",
    "sched_setscheduler",
    "sched_setparam",
    "sched_get_priority_max",
    "sched_get_priority_min",
];

/// Group 6: subprocesses.
const SUBPROCESS: &[&str] = &[
    "fork",
    "vfork",
    "execve",
    "execveat",
    "wait4",
    "waitid",
    "kill",
    "setpgid",
    "setsid",
    "prctl",
    "pidfd_open",
    "pidfd_send_signal",
];

/// Group 7: sockets (local IPC and networking both ride on these; anything
/// beyond level 7 is no filter at all).
const SOCKETS: &[&str] = &[
    "socket",
    "socketpair",
    "connect",
    "bind",
    "listen",
    "accept",
    "accept4",
    "getsockname",
    "getpeername",
    "getsockopt",
    "setsockopt",
    "sendto",
    "recvfrom",
    "sendmsg",
    "recvmsg",
    "sendmmsg",
    "recvmmsg",
    "shutdown",
];

const GROUPS: [&[&str]; 7] = [
    BASE, FS_READ, FS_WRITE, PLUMBING, THREADS, SUBPROCESS, SOCKETS,
];

/// Names allowed at `level`, i.e. the union of the first `level` groups.
pub(crate) fn allowed_for(level: u8) -> impl Iterator<Item = &'static str> {
    let n = (level as usize).min(GROUPS.len());
    GROUPS[..n].iter().flat_map(|group| group.iter().copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn levels_are_strictly_cumulative() {
        let mut previous = 0;
        for level in 1..=7u8 {
            let count = allowed_for(level).count();
            assert!(count > previous, "level {level} did not grow");
            previous = count;
        }
    }

    #[test]
    fn level_zero_allows_nothing() {
        assert_eq!(allowed_for(0).count(), 0);
    }

    #[test]
    fn no_name_appears_twice() {
        let mut seen = HashSet::new();
        for name in allowed_for(7) {
            assert!(seen.insert(name), "duplicate syscall name {name}");
        }
    }

    #[test]
    fn base_level_stays_pure_compute() {
        let base: HashSet<_> = allowed_for(1).collect();
        for forbidden in ["openat", "clone", "fork", "execve", "socket", "unlink"] {
            assert!(!base.contains(forbidden), "{forbidden} leaked into level 1");
        }
    }

    #[test]
    fn levels_above_the_table_clamp() {
        assert_eq!(allowed_for(7).count(), allowed_for(99).count());
    }
}
