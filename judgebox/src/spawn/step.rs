use nix::errno::Errno;
use std::fmt;
use thiserror::Error;

/// Phases of the child setup script, in execution order. The child reports
/// the phase it was in over the step pipe when a syscall fails, so failures
/// stay diagnosable without strings or allocations on the child side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SetupStep {
    NotStarted = 0,
    PreparePipe = 1,
    Clone = 2,
    SetSid = 3,
    Chroot = 4,
    SetGid = 5,
    SetUid = 6,
    SetUmask = 7,
    Chdir = 8,
    SetPdeathsig = 9,
    ParentGoneSelfKill = 10,
    DupFd = 11,
    SetRlimit = 12,
    SetPtrace = 13,
    SetNoNewPrivs = 14,
    SetSeccomp = 15,
    Exec = 16,
    ReadPipe = 17,
}

impl SetupStep {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_raw(code: i32) -> Self {
        match code {
            1 => SetupStep::PreparePipe,
            2 => SetupStep::Clone,
            3 => SetupStep::SetSid,
            4 => SetupStep::Chroot,
            5 => SetupStep::SetGid,
            6 => SetupStep::SetUid,
            7 => SetupStep::SetUmask,
            8 => SetupStep::Chdir,
            9 => SetupStep::SetPdeathsig,
            10 => SetupStep::ParentGoneSelfKill,
            11 => SetupStep::DupFd,
            12 => SetupStep::SetRlimit,
            13 => SetupStep::SetPtrace,
            14 => SetupStep::SetNoNewPrivs,
            15 => SetupStep::SetSeccomp,
            16 => SetupStep::Exec,
            17 => SetupStep::ReadPipe,
            _ => SetupStep::NotStarted,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SetupStep::NotStarted => "no start",
            SetupStep::PreparePipe => "prepare pipe",
            SetupStep::Clone => "clone",
            SetupStep::SetSid => "setsid",
            SetupStep::Chroot => "chroot",
            SetupStep::SetGid => "set gid",
            SetupStep::SetUid => "set uid",
            SetupStep::SetUmask => "set umask",
            SetupStep::Chdir => "chdir",
            SetupStep::SetPdeathsig => "set pdeathsig",
            SetupStep::ParentGoneSelfKill => "parent died, kill myself",
            SetupStep::DupFd => "dup files",
            SetupStep::SetRlimit => "set rlimit",
            SetupStep::SetPtrace => "set ptrace",
            SetupStep::SetNoNewPrivs => "set no_new_privs",
            SetupStep::SetSeccomp => "set seccomp",
            SetupStep::Exec => "exec",
            SetupStep::ReadPipe => "read error status from pipe",
        }
    }
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed step in the child, transported as (errno, step) over the status
/// pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("child setup step [{step}] failed: {errno}")]
pub struct ChildError {
    pub step: SetupStep,
    pub errno: Errno,
}
