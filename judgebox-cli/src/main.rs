//! Command-line front end: flag parsing, unit conversion, $PATH lookup, and
//! report printing. Everything that actually sandboxes lives in the
//! `judgebox` library.

mod lookup;
mod units;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use judgebox::config::Defaults;
use judgebox::{
    spawn_and_supervise, Credential, ExecConfig, OutputSink, ResourceLimits, RunReport,
    SandboxConfig, StdinSource, SyscallPolicy,
};
use log::warn;
use std::fs::File;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "judgebox",
    version,
    about = "Run an untrusted program under resource and syscall limits"
)]
struct Args {
    /// Program to run: a path, or a name searched on $PATH
    program: String,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// CPU time limit in milliseconds (kernel + user, whole subtree)
    #[arg(long)]
    cpu_ms: Option<u64>,

    /// Wall clock limit in milliseconds
    #[arg(long)]
    wall_ms: Option<u64>,

    /// Peak virtual memory across the subtree, e.g. "64m"
    #[arg(long)]
    memory: Option<String>,

    /// Output byte cap, e.g. "16k"; 0 forbids writes entirely
    #[arg(long)]
    output: Option<String>,

    /// Thread count cap across the subtree
    #[arg(long)]
    threads: Option<u64>,

    /// Syscall run level, 0 (no filter) to 7
    #[arg(long)]
    level: Option<u8>,

    /// Capture the denied syscall number over ptrace instead of just
    /// killing on it
    #[arg(long)]
    trace_bad_syscall: bool,

    /// Read the child's stdin from this file (default: inherit ours)
    #[arg(long)]
    stdin: Option<PathBuf>,

    /// Write the child's stdout to this file (default: inherit ours)
    #[arg(long)]
    stdout: Option<PathBuf>,

    /// Write the child's stderr to this file (default: inherit ours)
    #[arg(long)]
    stderr: Option<PathBuf>,

    /// Working directory for the child
    #[arg(long)]
    chdir: Option<PathBuf>,

    /// Chroot for the child (requires privileges)
    #[arg(long)]
    chroot: Option<PathBuf>,

    /// Run the child as this uid (root only)
    #[arg(long)]
    uid: Option<u32>,

    /// Run the child as this gid (root only)
    #[arg(long)]
    gid: Option<u32>,

    /// Umask for the child (root only)
    #[arg(long)]
    umask: Option<u32>,

    /// KEY=VALUE entry for the child environment (repeatable); the
    /// sandbox's own environment is inherited when none are given
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();
    let json = args.json;
    match run(args).await {
        Ok(report) => {
            print_report(&report, json);
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("judgebox: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<RunReport> {
    let defaults = Defaults::load();

    let program = lookup::resolve(&args.program)?;
    let mut exec = ExecConfig::new(program);
    exec.args = std::iter::once(args.program.clone())
        .chain(args.args.iter().cloned())
        .collect();
    exec.chdir = args.chdir;
    exec.chroot = args.chroot;
    for entry in &args.env {
        ensure!(entry.contains('='), "malformed --env entry {entry:?}");
    }
    exec.env = args.env;

    let mut limits: ResourceLimits = defaults.limits;
    if let Some(cpu_ms) = args.cpu_ms {
        limits.cpu_ms = cpu_ms;
    }
    if let Some(wall_ms) = args.wall_ms {
        limits.wall_ms = wall_ms;
    }
    if let Some(memory) = &args.memory {
        limits.memory_bytes = units::parse_bytes(memory).context("--memory")?;
    }
    if let Some(output) = &args.output {
        limits.output_bytes = units::parse_bytes(output).context("--output")?;
    }
    if let Some(threads) = args.threads {
        limits.threads = threads;
    }

    let mut syscall: SyscallPolicy = defaults.syscall;
    if let Some(level) = args.level {
        ensure!(level <= 7, "--level must be between 0 and 7");
        syscall.level = level;
    }
    if args.trace_bad_syscall {
        syscall.trace_denied = true;
    }

    let credential = if args.uid.is_some() || args.gid.is_some() || args.umask.is_some() {
        Some(Credential {
            uid: args.uid.unwrap_or(0),
            gid: args.gid.unwrap_or(0),
            umask: args.umask.unwrap_or(0),
        })
    } else {
        None
    };

    let mut cfg = SandboxConfig::new(exec);
    cfg.limits = limits;
    cfg.syscall = syscall;
    cfg.credential = credential;
    cfg.io.stdin = match args.stdin {
        Some(path) => StdinSource::File(
            File::open(&path).with_context(|| format!("--stdin {path:?}"))?,
        ),
        None => StdinSource::File(inherit_fd(libc::STDIN_FILENO)?),
    };
    cfg.io.stdout = match args.stdout {
        Some(path) => OutputSink::File(
            File::create(&path).with_context(|| format!("--stdout {path:?}"))?,
        ),
        None => OutputSink::File(inherit_fd(libc::STDOUT_FILENO)?),
    };
    cfg.io.stderr = match args.stderr {
        Some(path) => OutputSink::File(
            File::create(&path).with_context(|| format!("--stderr {path:?}"))?,
        ),
        None => OutputSink::File(inherit_fd(libc::STDERR_FILENO)?),
    };

    spawn_and_supervise(cfg).await
}

/// Hand the child a duplicate of one of our own stdio descriptors.
fn inherit_fd(fd: RawFd) -> Result<File> {
    let duped = unsafe { libc::dup(fd) };
    ensure!(duped >= 0, "dup of stdio fd {fd} failed");
    Ok(unsafe { File::from_raw_fd(duped) })
}

fn print_report(report: &RunReport, json: bool) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => warn!("report serialization failed: {e}"),
        }
        return;
    }
    match &report.violation {
        Some(violation) => println!("verdict:  {violation}"),
        None => println!("verdict:  ok"),
    }
    println!("exit:     {} (status {:#06x})", report.exit_code, report.status_code);
    println!(
        "cpu:      {}ms kernel + {}ms user",
        report.kernel_time_ms, report.user_time_ms
    );
    println!("wall:     {}ms", report.wall_time_ms);
    println!("memory:   {}kb", report.memory_kb);
    if let Some(err) = &report.bridge_error {
        println!("io:       {err}");
    }
}
