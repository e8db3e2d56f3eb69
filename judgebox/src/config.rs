use nix::sys::signal::Signal;
use serde::Deserialize;
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

/// Sentinel for "no limit" on any `u64` limit field.
pub const UNLIMITED: u64 = u64::MAX;

const DEFAULT_CONFIG_PATH: &str = "/etc/judgebox/judgebox.toml";
const ENV_CONFIG_PATH: &str = "JUDGEBOX_CONFIG";

/// Identity of the program to execute. Frozen once the supervisor starts.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Absolute path to an existing regular file with an execute bit.
    pub path: PathBuf,
    /// Full argv, argv[0] included. Empty argv is replaced by `[path]`.
    pub args: Vec<String>,
    /// `KEY=VALUE` strings. Empty inherits the sandbox's own environment.
    pub env: Vec<String>,
    pub chroot: Option<PathBuf>,
    pub chdir: Option<PathBuf>,
}

impl ExecConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            env: Vec::new(),
            chroot: None,
            chdir: None,
        }
    }
}

/// Where the child's fd 0 comes from.
pub enum StdinSource {
    /// The platform null device.
    Null,
    /// A pre-opened file, handed to the child as-is.
    File(fs::File),
    /// An in-process reader bridged through an anonymous pipe.
    Piped(Box<dyn Read + Send>),
}

/// Where the child's fd 1 / fd 2 go.
pub enum OutputSink {
    Null,
    File(fs::File),
    Piped(Box<dyn Write + Send>),
}

/// The three stdio bindings. The mapping always produces exactly fds 0/1/2
/// in the child.
pub struct IoConfig {
    pub stdin: StdinSource,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            stdin: StdinSource::Null,
            stdout: OutputSink::Null,
            stderr: OutputSink::Null,
        }
    }
}

/// Resource caps for the whole process subtree. Times are milliseconds,
/// sizes are bytes. CPU time is kernel+user summed across descendants.
///
/// `output_bytes` is enforced in-kernel through an `RLIMIT_FSIZE` of
/// `output_bytes + 1`, so 0 means "no writes allowed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "unlimited")]
    pub wall_ms: u64,
    #[serde(default = "unlimited")]
    pub cpu_ms: u64,
    #[serde(default = "unlimited")]
    pub memory_bytes: u64,
    #[serde(default = "unlimited")]
    pub output_bytes: u64,
    #[serde(default = "unlimited")]
    pub threads: u64,
}

fn unlimited() -> u64 {
    UNLIMITED
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_ms: UNLIMITED,
            cpu_ms: UNLIMITED,
            memory_bytes: UNLIMITED,
            output_bytes: UNLIMITED,
            threads: UNLIMITED,
        }
    }
}

impl ResourceLimits {
    /// Typical contest settings: 1 s of each clock, 16 MiB of memory, 1 KiB
    /// of output, 8 threads.
    pub fn contest_default() -> Self {
        Self {
            wall_ms: 1000,
            cpu_ms: 1000,
            memory_bytes: 16 * 1024 * 1024,
            output_bytes: 1024,
            threads: 8,
        }
    }
}

/// Identity the child assumes before exec. Only honored when the sandbox
/// itself is privileged; IDs are applied only if non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    #[serde(default)]
    pub umask: u32,
}

impl Credential {
    /// The classic unprivileged identity, the default when running as root.
    pub fn nobody() -> Self {
        Self {
            uid: 65534,
            gid: 65534,
            umask: 0,
        }
    }
}

/// Syscall filtering policy. Level 0 installs no filter; levels 1..=7 are
/// increasingly permissive allow-lists. `trace_denied` switches the wait
/// loop to ptrace mode so the denied syscall number can be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SyscallPolicy {
    #[serde(default)]
    pub level: u8,
    #[serde(default)]
    pub trace_denied: bool,
}

impl Default for SyscallPolicy {
    fn default() -> Self {
        Self {
            level: 0,
            trace_denied: false,
        }
    }
}

/// Everything the supervisor needs for one run.
pub struct SandboxConfig {
    pub exec: ExecConfig,
    pub io: IoConfig,
    pub limits: ResourceLimits,
    pub credential: Option<Credential>,
    pub syscall: SyscallPolicy,
    /// Put the child in a new session (and thereby its own process group).
    pub setsid: bool,
    /// Signal delivered to the child when the sandbox dies.
    pub pdeathsig: Option<Signal>,
    /// Extra flags for the clone call (namespace flags and the like).
    pub clone_flags: u64,
    /// How often the usage tracer rescans /proc.
    pub sample_interval: Duration,
}

impl SandboxConfig {
    pub fn new(exec: ExecConfig) -> Self {
        Self {
            exec,
            io: IoConfig::default(),
            limits: ResourceLimits::default(),
            credential: None,
            syscall: SyscallPolicy::default(),
            setsid: true,
            pdeathsig: Some(Signal::SIGKILL),
            clone_flags: 0,
            sample_interval: Duration::from_millis(2),
        }
    }
}

/// Site-wide defaults, loaded from a TOML file. The path can be overridden
/// with the `JUDGEBOX_CONFIG` environment variable. A missing or unparsable
/// file yields the built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub syscall: SyscallPolicy,
}

impl Defaults {
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        match fs::read_to_string(PathBuf::from(path)) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Defaults::default(),
        }
    }
}
