//! Core of the judgebox sandbox: spawn an untrusted program in a tightly
//! controlled state, account for everything its process subtree consumes,
//! and report why it stopped.

pub mod config;
pub mod filter;
pub mod process;
pub mod report;
pub mod spawn;
pub mod supervisor;
pub mod tracer;
pub mod violation;

pub use config::{
    Credential, ExecConfig, IoConfig, OutputSink, ResourceLimits, SandboxConfig, StdinSource,
    SyscallPolicy, UNLIMITED,
};
pub use report::RunReport;
pub use supervisor::spawn_and_supervise;
pub use tracer::UsageSnapshot;
pub use violation::Violation;
