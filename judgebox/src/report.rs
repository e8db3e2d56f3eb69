//! Result assembly: fuse the wait status, the kernel's rusage, the sampled
//! peaks, and the latched violation into the final report.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use serde::Serialize;

use crate::supervisor::WaitOutcome;
use crate::tracer::UsageSnapshot;
use crate::violation::Violation;

/// What one run produced. Times are milliseconds, memory is KiB of peak
/// virtual size across the subtree; `status_code` is the kernel's wait
/// status word verbatim and `exit_code` is −1 when the child was signaled.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub kernel_time_ms: u64,
    pub user_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_kb: u64,
    pub exit_code: i32,
    pub status_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<Violation>,
    /// First IO-bridge failure, if any. Never fatal on its own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_error: Option<String>,
}

impl RunReport {
    pub(crate) fn internal(detail: String) -> Self {
        Self::internal_violation(Violation::InternalError { detail })
    }

    pub(crate) fn internal_violation(violation: Violation) -> Self {
        Self {
            kernel_time_ms: 0,
            user_time_ms: 0,
            wall_time_ms: 0,
            memory_kb: 0,
            exit_code: -1,
            status_code: -1,
            violation: Some(violation),
            bridge_error: None,
        }
    }
}

pub(crate) fn assemble(
    outcome: &WaitOutcome,
    peaks: UsageSnapshot,
    wall_time_ms: u64,
    latched: Option<Violation>,
    bridge_error: Option<String>,
) -> RunReport {
    let (exit_code, violation) = classify(outcome.status, latched);
    RunReport {
        kernel_time_ms: timeval_ms(outcome.rusage.ru_stime),
        user_time_ms: timeval_ms(outcome.rusage.ru_utime),
        wall_time_ms,
        memory_kb: peaks.virtual_memory_bytes / 1024,
        exit_code,
        status_code: outcome.raw_status,
        violation,
        bridge_error,
    }
}

/// Pick the reported cause. The latch always wins; with no latched cause, a
/// signaled child is promoted to the violation its signal implies: the cpu
/// and file-size rlimits announce themselves as SIGXCPU/SIGXFSZ, anything
/// else is a runtime error of the target.
fn classify(status: Option<WaitStatus>, latched: Option<Violation>) -> (i32, Option<Violation>) {
    let exit_code = match status {
        Some(WaitStatus::Exited(_, code)) => code,
        _ => -1,
    };
    let violation = latched.or(match status {
        Some(WaitStatus::Signaled(_, Signal::SIGXCPU, _)) => Some(Violation::CpuTimeExceeded),
        Some(WaitStatus::Signaled(_, Signal::SIGXFSZ, _)) => Some(Violation::OutputSizeExceeded),
        Some(WaitStatus::Signaled(_, _, _)) => Some(Violation::RuntimeError),
        _ => None,
    });
    (exit_code, violation)
}

fn timeval_ms(tv: libc::timeval) -> u64 {
    tv.tv_sec.max(0) as u64 * 1000 + tv.tv_usec.max(0) as u64 / 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    fn pid() -> Pid {
        Pid::from_raw(1234)
    }

    #[test]
    fn clean_exit_keeps_the_code_and_no_violation() {
        let (code, violation) = classify(Some(WaitStatus::Exited(pid(), 7)), None);
        assert_eq!(code, 7);
        assert_eq!(violation, None);
    }

    #[test]
    fn latched_violation_always_wins() {
        let (code, violation) = classify(
            Some(WaitStatus::Signaled(pid(), Signal::SIGKILL, false)),
            Some(Violation::WallClockExceeded),
        );
        assert_eq!(code, -1);
        assert_eq!(violation, Some(Violation::WallClockExceeded));
    }

    #[test]
    fn rlimit_signals_promote_to_their_violations() {
        let (_, cpu) = classify(Some(WaitStatus::Signaled(pid(), Signal::SIGXCPU, false)), None);
        assert_eq!(cpu, Some(Violation::CpuTimeExceeded));
        let (_, output) =
            classify(Some(WaitStatus::Signaled(pid(), Signal::SIGXFSZ, true)), None);
        assert_eq!(output, Some(Violation::OutputSizeExceeded));
    }

    #[test]
    fn other_signals_promote_to_runtime_error() {
        let (code, violation) =
            classify(Some(WaitStatus::Signaled(pid(), Signal::SIGSEGV, true)), None);
        assert_eq!(code, -1);
        assert_eq!(violation, Some(Violation::RuntimeError));
    }

    #[test]
    fn timeval_truncates_to_whole_milliseconds() {
        let tv = libc::timeval {
            tv_sec: 2,
            tv_usec: 345_678,
        };
        assert_eq!(timeval_ms(tv), 2345);
    }

    #[test]
    fn reports_serialize_without_empty_fields() {
        let report = RunReport {
            kernel_time_ms: 1,
            user_time_ms: 2,
            wall_time_ms: 3,
            memory_kb: 4,
            exit_code: 0,
            status_code: 0,
            violation: None,
            bridge_error: None,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("violation"));
        assert!(!json.contains("bridge_error"));
    }
}
