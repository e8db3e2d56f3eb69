//! The supervisor owns a run end to end: it wires stdio, compiles the
//! syscall filter, spawns the child, starts the usage tracer, enforces the
//! wall clock and the sampled limits, runs the wait loop that matches the
//! policy mode, and hands everything to the result assembler.

mod stdio;

use anyhow::{ensure, Context, Result};
use log::{debug, error, info, trace, warn};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::{Pid, Uid};
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::{self, JoinHandle};

use crate::config::{Credential, ExecConfig, ResourceLimits, SandboxConfig, UNLIMITED};
use crate::filter;
use crate::process::{self, ChildProc};
use crate::report::{self, RunReport};
use crate::spawn::{self, ChildSpec, RlimitTable, RLIMIT_CPU, RLIMIT_FSIZE};
use crate::tracer::{UsagePeaks, UsageSnapshot, UsageTracer};
use crate::violation::{Violation, ViolationCell};

use self::stdio::BridgeKind;

/// How the wait loop runs: a single reap, or a ptrace conversation that can
/// name the denied syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitMode {
    Normal,
    Ptrace,
}

/// What the wait loop hands to the result assembler.
pub(crate) struct WaitOutcome {
    pub status: Option<WaitStatus>,
    pub raw_status: i32,
    pub rusage: libc::rusage,
}

impl WaitOutcome {
    fn faulted() -> Self {
        Self {
            status: None,
            raw_status: -1,
            rusage: unsafe { mem::zeroed() },
        }
    }
}

/// Limits after derivation: the wall clock picked up from the cpu limit
/// when absent, and the in-kernel rlimit backstops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EffectiveLimits {
    pub wall_ms: u64,
    pub cpu_ms: u64,
    pub memory_bytes: u64,
    pub threads: u64,
    pub rlimits: RlimitTable,
}

impl EffectiveLimits {
    pub(crate) fn derive(limits: &ResourceLimits) -> Self {
        let mut rlimits = RlimitTable::new();
        let mut wall_ms = limits.wall_ms;
        if limits.cpu_ms != UNLIMITED {
            let secs = limits.cpu_ms.div_ceil(1000) + 1;
            debug!("cpu rlimit derived from the cpu limit: {secs}s");
            rlimits.set(RLIMIT_CPU, secs);
            if wall_ms == UNLIMITED {
                wall_ms = limits.cpu_ms.saturating_mul(10);
                info!("no wall clock limit set; derived {wall_ms}ms from the cpu limit");
            }
            if wall_ms < limits.cpu_ms {
                info!(
                    "wall clock limit below the cpu limit; raising it to {}ms",
                    limits.cpu_ms
                );
                wall_ms = limits.cpu_ms;
            }
        }
        if limits.output_bytes != UNLIMITED {
            rlimits.set(RLIMIT_FSIZE, limits.output_bytes.saturating_add(1));
        }
        Self {
            wall_ms,
            cpu_ms: limits.cpu_ms,
            memory_bytes: limits.memory_bytes,
            threads: limits.threads,
            rlimits,
        }
    }
}

/// Run one sandboxed program to completion and report what it consumed and
/// why it stopped.
///
/// A malformed configuration (missing or non-executable target, nul bytes
/// in strings) is an `Err`; everything that goes wrong after that point
/// comes back as a report whose violation explains the failure, so callers
/// always get exactly one result per accepted run.
pub async fn spawn_and_supervise(cfg: SandboxConfig) -> Result<RunReport> {
    validate_target(&cfg.exec)?;
    let effective = EffectiveLimits::derive(&cfg.limits);

    let SandboxConfig {
        exec,
        io,
        limits: _,
        credential,
        syscall,
        setsid,
        pdeathsig,
        clone_flags,
        sample_interval,
    } = cfg;

    let stdio_set = stdio::wire(io)?;
    let credential = gate_credential(credential);
    let mut spec = build_child_spec(
        &exec,
        stdio_set.child,
        effective.rlimits,
        setsid,
        pdeathsig,
        credential,
        clone_flags,
    )?;

    let compiled = match filter::compile(syscall, spec.path_ptr() as u64) {
        Ok(compiled) => compiled,
        Err(e) => {
            error!("syscall filter compilation failed: {e:#}");
            return Ok(RunReport::internal(format!(
                "syscall filter compilation failed: {e:#}"
            )));
        }
    };
    let mode = if syscall.trace_denied && compiled.is_some() {
        WaitMode::Ptrace
    } else {
        WaitMode::Normal
    };
    spec.trace_me = mode == WaitMode::Ptrace;
    spec.no_new_privs = compiled.as_ref().is_some_and(|f| f.needs_no_new_privs);
    spec.filter = compiled;

    let latch = Arc::new(ViolationCell::new());

    // The clone and the whole wait conversation stay on one dedicated
    // thread: a ptrace tracee only answers the thread that it attached to.
    let (pid_tx, pid_rx) = oneshot::channel();
    let wait_latch = Arc::clone(&latch);
    let wait_thread = task::spawn_blocking(move || {
        let pid = match spawn::fork_exec(&spec) {
            Ok(pid) => pid,
            Err(e) => {
                let _ = pid_tx.send(Err(e));
                return None;
            }
        };
        // Child-side descriptors close now; the parent's copy of the BPF
        // program goes with the spec below.
        spec.close_stdio();
        drop(spec);
        let proc_ = Arc::new(ChildProc::new(pid));
        if pid_tx.send(Ok(Arc::clone(&proc_))).is_err() {
            proc_.kill_group();
        }
        let outcome = match mode {
            WaitMode::Normal => normal_wait(&proc_, &wait_latch),
            WaitMode::Ptrace => ptrace_wait(&proc_, &wait_latch),
        };
        proc_.set_done();
        Some(outcome)
    });

    let start = Instant::now();
    let proc_ = match pid_rx.await {
        Ok(Ok(proc_)) => proc_,
        Ok(Err(spawn_err)) => {
            warn!("spawn failed: {spawn_err}");
            let _ = wait_thread.await;
            return Ok(RunReport::internal_violation(spawn_err.violation()));
        }
        Err(_) => {
            let _ = wait_thread.await;
            return Ok(RunReport::internal(
                "spawn thread ended before reporting a pid".to_string(),
            ));
        }
    };
    info!("supervising pid {}", proc_.pid());

    let (done_tx, done_rx) = watch::channel(false);
    let tracer = UsageTracer::spawn(proc_.pid().as_raw(), sample_interval);
    let peaks = Arc::new(UsagePeaks::default());

    let guard = tokio::spawn(guard_limits(
        tracer.subscribe(),
        Arc::clone(&peaks),
        effective,
        Arc::clone(&latch),
        Arc::clone(&proc_),
        done_rx.clone(),
    ));
    if effective.wall_ms != UNLIMITED {
        tokio::spawn(wall_timer(
            Duration::from_millis(effective.wall_ms),
            Arc::clone(&latch),
            Arc::clone(&proc_),
            done_rx.clone(),
        ));
    }
    tokio::spawn(forward_cancellation(Arc::clone(&proc_), done_rx));

    let bridge_tasks: Vec<(BridgeKind, JoinHandle<io::Result<u64>>)> = stdio_set
        .bridges
        .into_iter()
        .map(|bridge| (bridge.kind, task::spawn_blocking(bridge.run)))
        .collect();

    let outcome = match wait_thread.await {
        Ok(Some(outcome)) => outcome,
        Ok(None) => {
            // fork_exec failed after the pid was already delivered; cannot
            // happen, but never leave the caller without a result
            latch.set(Violation::InternalError {
                detail: "wait loop produced no outcome".to_string(),
            });
            WaitOutcome::faulted()
        }
        Err(join_err) => {
            error!("wait thread panicked: {join_err}");
            proc_.kill_group();
            latch.set(Violation::InternalError {
                detail: format!("wait thread panicked: {join_err}"),
            });
            WaitOutcome::faulted()
        }
    };
    let wall_time_ms = start.elapsed().as_millis() as u64;

    proc_.set_done();
    let _ = done_tx.send(true);
    tracer.destroy();
    let _ = guard.await;
    // one last look so a burst right before exit still counts
    if let Some(final_snapshot) = tracer.get_snapshot() {
        peaks.observe(&final_snapshot);
    }

    let bridge_error = collect_bridges(bridge_tasks, outcome.status).await;

    Ok(report::assemble(
        &outcome,
        peaks.snapshot(),
        wall_time_ms,
        latch.get().cloned(),
        bridge_error,
    ))
}

fn validate_target(exec: &ExecConfig) -> Result<()> {
    ensure!(
        exec.path.is_absolute(),
        "target path {:?} is not absolute",
        exec.path
    );
    let meta = std::fs::metadata(&exec.path)
        .with_context(|| format!("target {:?}", exec.path))?;
    ensure!(
        meta.is_file(),
        "target {:?} is not a regular file",
        exec.path
    );
    ensure!(
        meta.permissions().mode() & 0o111 != 0,
        "target {:?} has no execute bit",
        exec.path
    );
    Ok(())
}

/// Credentials only apply when the sandbox itself is privileged; otherwise
/// they are dropped with a warning rather than failing the run.
fn gate_credential(credential: Option<Credential>) -> Option<Credential> {
    match credential {
        Some(cred) if Uid::effective().is_root() => Some(cred),
        Some(_) => {
            warn!("credentials requested but the sandbox is not privileged; ignoring them");
            None
        }
        None => None,
    }
}

fn build_child_spec(
    exec: &ExecConfig,
    stdio: [Option<OwnedFd>; 3],
    rlimits: RlimitTable,
    setsid: bool,
    pdeathsig: Option<Signal>,
    credential: Option<Credential>,
    clone_flags: u64,
) -> Result<ChildSpec> {
    let path = cstring(exec.path.as_os_str().as_bytes(), "target path")?;
    let argv = if exec.args.is_empty() {
        vec![path.clone()]
    } else {
        exec.args
            .iter()
            .map(|arg| cstring(arg.as_bytes(), "argv"))
            .collect::<Result<Vec<_>>>()?
    };
    let env_strings: Vec<String> = if exec.env.is_empty() {
        std::env::vars().map(|(k, v)| format!("{k}={v}")).collect()
    } else {
        exec.env.clone()
    };
    let env = env_strings
        .iter()
        .map(|pair| cstring(pair.as_bytes(), "environment"))
        .collect::<Result<Vec<_>>>()?;
    let chroot = exec
        .chroot
        .as_ref()
        .map(|p| cstring(p.as_os_str().as_bytes(), "chroot path"))
        .transpose()?;
    let chdir = exec
        .chdir
        .as_ref()
        .map(|p| cstring(p.as_os_str().as_bytes(), "chdir path"))
        .transpose()?;
    let (uid, gid, umask) = credential.map_or((0, 0, 0), |c| (c.uid, c.gid, c.umask));

    Ok(ChildSpec {
        path,
        argv,
        env,
        chroot,
        chdir,
        setsid,
        uid,
        gid,
        umask,
        pdeathsig: pdeathsig.map_or(0, |sig| sig as i32),
        stdio,
        rlimits,
        trace_me: false,
        no_new_privs: false,
        filter: None,
        clone_flags,
    })
}

fn cstring(bytes: &[u8], what: &str) -> Result<CString> {
    CString::new(bytes).with_context(|| format!("{what} contains a nul byte"))
}

/// Compare each fresh snapshot's peaks against the limits, in the order
/// memory, threads, cpu; the first to trip latches its violation and kills
/// the group. Nothing is checked before the first snapshot arrives.
async fn guard_limits(
    mut samples: watch::Receiver<Option<UsageSnapshot>>,
    peaks: Arc<UsagePeaks>,
    limits: EffectiveLimits,
    latch: Arc<ViolationCell>,
    proc_: Arc<ChildProc>,
    mut done: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = done.changed() => break,
            changed = samples.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let Some(snapshot) = *samples.borrow() else {
            continue;
        };
        peaks.observe(&snapshot);
        let peak = peaks.snapshot();
        let tripped = if limits.memory_bytes != UNLIMITED
            && peak.virtual_memory_bytes > limits.memory_bytes
        {
            Some(Violation::MemoryExceeded)
        } else if limits.threads != UNLIMITED && peak.thread_count > limits.threads {
            Some(Violation::ThreadCountExceeded)
        } else if limits.cpu_ms != UNLIMITED && peak.cpu_time_ms() > limits.cpu_ms {
            Some(Violation::CpuTimeExceeded)
        } else {
            None
        };
        if let Some(violation) = tripped {
            if latch.set(violation.clone()) {
                warn!("{violation}; killing process group");
            }
            proc_.kill_group();
            break;
        }
    }
}

async fn wall_timer(
    limit: Duration,
    latch: Arc<ViolationCell>,
    proc_: Arc<ChildProc>,
    mut done: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = done.changed() => {}
        _ = tokio::time::sleep(limit) => {
            if latch.set(Violation::WallClockExceeded) {
                warn!(
                    "wall clock limit hit after {}ms; killing process group",
                    limit.as_millis()
                );
            }
            proc_.kill_group();
        }
    }
}

/// An external cancel of the sandbox itself is forwarded to the child's
/// group once; shutdown then proceeds through the normal wait path.
async fn forward_cancellation(proc_: Arc<ChildProc>, mut done: watch::Receiver<bool>) {
    use tokio::signal::unix::{signal, SignalKind};
    let (Ok(mut interrupt), Ok(mut terminate)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        debug!("signal handlers unavailable; cancellation forwarding disabled");
        return;
    };
    tokio::select! {
        _ = done.changed() => {}
        _ = interrupt.recv() => {
            info!("interrupted; forwarding SIGINT to the child group");
            let _ = proc_.signal_group(Signal::SIGINT);
        }
        _ = terminate.recv() => {
            info!("terminated; forwarding SIGTERM to the child group");
            let _ = proc_.signal_group(Signal::SIGTERM);
        }
    }
}

/// Join the bridge tasks. Bridge failures never abort the run; the first
/// one lands in the report's secondary error. A broken pipe on the stdin
/// bridge is expected when the child finished without draining its input.
async fn collect_bridges(
    tasks: Vec<(BridgeKind, JoinHandle<io::Result<u64>>)>,
    status: Option<WaitStatus>,
) -> Option<String> {
    let exited = matches!(status, Some(WaitStatus::Exited(_, _)));
    let mut first_error = None;
    for (kind, handle) in tasks {
        let joined = if kind == BridgeKind::Stdin {
            // An undrained reader can block past the child's death; detach
            // instead of hanging the result.
            match tokio::time::timeout(Duration::from_millis(500), handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    debug!("stdin bridge still blocked after exit; detaching");
                    continue;
                }
            }
        } else {
            handle.await
        };
        match joined {
            Ok(Ok(copied)) => trace!("{kind} bridge copied {copied} bytes"),
            Ok(Err(e)) => {
                if kind == BridgeKind::Stdin && e.kind() == io::ErrorKind::BrokenPipe && exited {
                    debug!("stdin bridge broken pipe suppressed after clean exit");
                    continue;
                }
                warn!("{kind} bridge failed: {e}");
                if first_error.is_none() {
                    first_error = Some(format!("{kind} bridge: {e}"));
                }
            }
            Err(join_err) => {
                warn!("{kind} bridge panicked: {join_err}");
                if first_error.is_none() {
                    first_error = Some(format!("{kind} bridge panicked: {join_err}"));
                }
            }
        }
    }
    first_error
}

fn wait_failure(proc_: &ChildProc, latch: &ViolationCell, errno: nix::errno::Errno) -> WaitOutcome {
    error!("wait failed: {errno}; killing process group");
    latch.set(Violation::InternalError {
        detail: format!("wait failed: {errno}"),
    });
    proc_.kill_group();
    WaitOutcome::faulted()
}

/// Plain supervision: reap the child once it exits or is killed.
fn normal_wait(proc_: &ChildProc, latch: &ViolationCell) -> WaitOutcome {
    debug!("wait loop up for pid {}", proc_.pid());
    loop {
        match process::wait4(proc_.pid()) {
            Ok((status, raw_status, rusage)) => match status {
                WaitStatus::Exited(_, code) => {
                    info!("normal termination, exit status = {code}");
                    return WaitOutcome {
                        status: Some(status),
                        raw_status,
                        rusage,
                    };
                }
                WaitStatus::Signaled(_, sig, core) => {
                    info!(
                        "abnormal termination, signal = {sig}{}",
                        if core { " (core dumped)" } else { "" }
                    );
                    return WaitOutcome {
                        status: Some(status),
                        raw_status,
                        rusage,
                    };
                }
                other => debug!("intermediate wait status {other:?}"),
            },
            Err(errno) => return wait_failure(proc_, latch, errno),
        }
    }
}

/// Ptrace supervision: absorb the traceme stop, ask only for seccomp
/// events, then resume-and-wait until the child is gone. On a seccomp stop
/// the denied syscall number is read out of the registers before the group
/// is killed.
fn ptrace_wait(proc_: &ChildProc, latch: &ViolationCell) -> WaitOutcome {
    let pid = proc_.pid();
    debug!("ptrace wait loop up for pid {pid}");

    let (status, raw_status, rusage) = match process::wait4(pid) {
        Ok(first) => first,
        Err(errno) => return wait_failure(proc_, latch, errno),
    };
    if matches!(
        status,
        WaitStatus::Exited(..) | WaitStatus::Signaled(..)
    ) {
        return WaitOutcome {
            status: Some(status),
            raw_status,
            rusage,
        };
    }
    trace!("traceme stop consumed: {status:?}");
    if let Err(e) = ptrace::setoptions(pid, ptrace::Options::PTRACE_O_TRACESECCOMP) {
        debug!("ptrace setoptions failed: {e}");
    }

    loop {
        if let Err(e) = ptrace::cont(pid, None) {
            debug!("ptrace cont failed: {e}");
        }
        let (status, raw_status, rusage) = match process::wait4(pid) {
            Ok(step) => step,
            Err(errno) => return wait_failure(proc_, latch, errno),
        };
        match status {
            WaitStatus::Exited(_, code) => {
                info!("normal termination, exit status = {code}");
                return WaitOutcome {
                    status: Some(status),
                    raw_status,
                    rusage,
                };
            }
            WaitStatus::Signaled(_, sig, _) => {
                info!("abnormal termination, signal = {sig}");
                return WaitOutcome {
                    status: Some(status),
                    raw_status,
                    rusage,
                };
            }
            WaitStatus::PtraceEvent(_, _, event) if event == libc::PTRACE_EVENT_SECCOMP => {
                match read_syscall_number(pid) {
                    Some(nr) => {
                        if latch.set(Violation::BadSyscall { nr }) {
                            info!("denied syscall {nr}; killing process group");
                        }
                    }
                    None => warn!("seccomp stop but the registers were unreadable"),
                }
                proc_.kill_group();
            }
            WaitStatus::Stopped(_, sig) => trace!("child stopped by {sig}"),
            other => {
                warn!("unexpected wait status {other:?}; killing process group");
                proc_.kill_group();
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
fn read_syscall_number(pid: Pid) -> Option<u64> {
    ptrace::getregs(pid).ok().map(|regs| regs.orig_rax)
}

#[cfg(target_arch = "aarch64")]
fn read_syscall_number(pid: Pid) -> Option<u64> {
    ptrace::getregset::<ptrace::regset::NT_PRSTATUS>(pid)
        .ok()
        .map(|regs| regs.regs[8])
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn read_syscall_number(_pid: Pid) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawn::RLIMIT_CPU;

    #[test]
    fn cpu_limit_derives_rlimit_and_wall_clock() {
        let effective = EffectiveLimits::derive(&ResourceLimits {
            cpu_ms: 500,
            ..Default::default()
        });
        assert_eq!(effective.rlimits.get(RLIMIT_CPU), Some(2));
        assert_eq!(effective.wall_ms, 5000);
    }

    #[test]
    fn wall_clock_is_raised_to_the_cpu_limit() {
        let effective = EffectiveLimits::derive(&ResourceLimits {
            cpu_ms: 2000,
            wall_ms: 1000,
            ..Default::default()
        });
        assert_eq!(effective.wall_ms, 2000);
    }

    #[test]
    fn huge_cpu_limit_saturates_the_derived_wall_clock() {
        let effective = EffectiveLimits::derive(&ResourceLimits {
            cpu_ms: u64::MAX - 1,
            ..Default::default()
        });
        assert_eq!(effective.wall_ms, UNLIMITED);
    }

    #[test]
    fn output_limit_becomes_fsize_plus_one() {
        let effective = EffectiveLimits::derive(&ResourceLimits {
            output_bytes: 1024,
            ..Default::default()
        });
        assert_eq!(effective.rlimits.get(RLIMIT_FSIZE), Some(1025));
        let forbid_all = EffectiveLimits::derive(&ResourceLimits {
            output_bytes: 0,
            ..Default::default()
        });
        assert_eq!(forbid_all.rlimits.get(RLIMIT_FSIZE), Some(1));
    }

    #[test]
    fn unlimited_limits_derive_nothing() {
        let effective = EffectiveLimits::derive(&ResourceLimits::default());
        assert_eq!(effective.wall_ms, UNLIMITED);
        assert_eq!(effective.rlimits.get(RLIMIT_CPU), None);
        assert_eq!(effective.rlimits.get(RLIMIT_FSIZE), None);
    }

    #[test]
    fn relative_targets_are_rejected() {
        let exec = ExecConfig::new("bin/true");
        assert!(validate_target(&exec).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn directories_are_rejected_as_targets() {
        let exec = ExecConfig::new("/tmp");
        assert!(validate_target(&exec).is_err());
    }
}
