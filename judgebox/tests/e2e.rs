//! End-to-end runs against real binaries. Linux only: everything here
//! clones, execs, and reaps actual processes.
#![cfg(target_os = "linux")]

use judgebox::{
    spawn_and_supervise, ExecConfig, OutputSink, ResourceLimits, RunReport, SandboxConfig,
    StdinSource, SyscallPolicy, Violation,
};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

fn sh(script: &str) -> SandboxConfig {
    let mut exec = ExecConfig::new("/bin/sh");
    exec.args = vec!["sh".into(), "-c".into(), script.into()];
    SandboxConfig::new(exec)
}

async fn run(cfg: SandboxConfig) -> RunReport {
    spawn_and_supervise(cfg).await.expect("run was accepted")
}

/// A Write sink the test can read back after the supervisor is done with it.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn true_runs_clean_without_limits() {
    let report = run(SandboxConfig::new(ExecConfig::new("/bin/true"))).await;
    assert_eq!(report.exit_code, 0);
    assert_eq!(report.violation, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn exit_codes_pass_through() {
    let report = run(sh("exit 7")).await;
    assert_eq!(report.exit_code, 7);
    assert_eq!(report.violation, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn busy_loop_trips_the_cpu_limit() {
    let mut cfg = sh("while :; do :; done");
    cfg.limits = ResourceLimits {
        cpu_ms: 500,
        wall_ms: 3000,
        ..Default::default()
    };
    let report = run(cfg).await;
    assert_eq!(report.violation, Some(Violation::CpuTimeExceeded));
    assert!(report.wall_time_ms < 3000, "wall {}", report.wall_time_ms);
    let cpu = report.kernel_time_ms + report.user_time_ms;
    assert!(cpu >= 200, "cpu only {cpu}ms");
    assert!(cpu < 2500, "cpu ran away to {cpu}ms");
}

#[tokio::test(flavor = "multi_thread")]
async fn sleeper_trips_the_wall_clock() {
    let mut cfg = sh("sleep 10");
    cfg.limits = ResourceLimits {
        wall_ms: 200,
        ..Default::default()
    };
    let report = run(cfg).await;
    assert_eq!(report.violation, Some(Violation::WallClockExceeded));
    assert_eq!(report.exit_code, -1);
    assert!(report.wall_time_ms >= 150, "wall {}", report.wall_time_ms);
    assert!(report.wall_time_ms < 5000, "wall {}", report.wall_time_ms);
}

#[tokio::test(flavor = "multi_thread")]
async fn allocation_trips_the_memory_limit() {
    // dd keeps a 256 MiB buffer alive for several reads
    let mut cfg = sh("dd if=/dev/zero of=/dev/null bs=268435456 count=8 2>/dev/null");
    cfg.limits = ResourceLimits {
        memory_bytes: 64 * 1024 * 1024,
        wall_ms: 10_000,
        ..Default::default()
    };
    let report = run(cfg).await;
    assert_eq!(report.violation, Some(Violation::MemoryExceeded));
    assert!(
        report.memory_kb >= 64 * 1024,
        "peak only {} kb",
        report.memory_kb
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn fork_storm_trips_the_thread_limit() {
    let mut cfg = sh("i=0; while [ $i -lt 200 ]; do sleep 2 & i=$((i+1)); done; wait");
    cfg.limits = ResourceLimits {
        threads: 32,
        wall_ms: 10_000,
        ..Default::default()
    };
    let report = run(cfg).await;
    assert_eq!(report.violation, Some(Violation::ThreadCountExceeded));
}

#[tokio::test(flavor = "multi_thread")]
async fn output_cap_kills_the_writer() {
    let mut cfg = sh("while :; do echo xxxxxxxxxxxxxxxx; done");
    cfg.io.stdout = OutputSink::File(tempfile::tempfile().unwrap());
    cfg.limits = ResourceLimits {
        output_bytes: 1024,
        wall_ms: 10_000,
        ..Default::default()
    };
    let report = run(cfg).await;
    assert_eq!(report.violation, Some(Violation::OutputSizeExceeded));
}

#[tokio::test(flavor = "multi_thread")]
async fn stdin_round_trips_through_cat() {
    let payload = b"hello sandbox\n".to_vec();
    let captured = SharedBuf::default();
    let mut exec = ExecConfig::new("/bin/cat");
    exec.args = vec!["cat".into()];
    let mut cfg = SandboxConfig::new(exec);
    cfg.io.stdin = StdinSource::Piped(Box::new(io::Cursor::new(payload.clone())));
    cfg.io.stdout = OutputSink::Piped(Box::new(captured.clone()));
    let report = run(cfg).await;
    assert_eq!(report.exit_code, 0);
    assert_eq!(report.violation, None);
    assert_eq!(report.bridge_error, None);
    assert_eq!(captured.contents(), payload);
}

#[tokio::test(flavor = "multi_thread")]
async fn chdir_failure_surfaces_the_step_and_errno() {
    let mut exec = ExecConfig::new("/bin/true");
    exec.chdir = Some("/definitely/not/a/real/directory".into());
    let report = run(SandboxConfig::new(exec)).await;
    match report.violation {
        Some(Violation::InternalError { ref detail }) => {
            assert!(detail.contains("chdir"), "{detail}");
            assert!(detail.contains("ENOENT"), "{detail}");
        }
        ref other => panic!("unexpected violation {other:?}"),
    }
    assert_eq!(report.exit_code, -1);
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[tokio::test(flavor = "multi_thread")]
async fn traced_filter_names_the_denied_syscall() {
    // level 1 has no filesystem opens, so the dynamic loader faults early
    let mut cfg = SandboxConfig::new(ExecConfig::new("/bin/true"));
    cfg.syscall = SyscallPolicy {
        level: 1,
        trace_denied: true,
    };
    cfg.limits = ResourceLimits {
        wall_ms: 5000,
        ..Default::default()
    };
    let report = run(cfg).await;
    assert!(
        matches!(report.violation, Some(Violation::BadSyscall { .. })),
        "unexpected violation {:?}",
        report.violation
    );
    assert_eq!(report.exit_code, -1);
}

#[tokio::test(flavor = "multi_thread")]
async fn identical_runs_agree_on_exit_and_violation() {
    let first = run(sh("exit 3")).await;
    let second = run(sh("exit 3")).await;
    assert_eq!(first.exit_code, second.exit_code);
    assert_eq!(first.violation, second.violation);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_targets_are_rejected_up_front() {
    let cfg = SandboxConfig::new(ExecConfig::new("/definitely/not/a/binary"));
    assert!(spawn_and_supervise(cfg).await.is_err());
}
