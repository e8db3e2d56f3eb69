//! Seccomp policy compiler: turns a run level into a classic-BPF program
//! ready for `prctl(PR_SET_SECCOMP)` in the child.
//!
//! The filter unconditionally allows the one `execve` whose first argument
//! is the pointer to the target path, so the exec that enters the sandboxed
//! program is never blocked by its own policy; every later syscall falls
//! under the level's rules. The default action is Trace when the supervisor
//! wants to read the denied syscall number over ptrace, Kill otherwise.

mod levels;

use anyhow::{bail, Context, Result};
use libseccomp::{
    ScmpAction, ScmpArgCompare, ScmpCompareOp, ScmpFilterContext, ScmpSyscall,
};
use log::{debug, trace};
use std::io::{Read, Seek, SeekFrom};

use crate::config::SyscallPolicy;

/// A rendered BPF program plus what its installation requires. The parent
/// keeps this alive until the clone; the kernel copies it on load.
pub struct CompiledFilter {
    prog: Vec<libc::sock_filter>,
    /// Loading a filter without CAP_SYS_ADMIN requires no_new_privs first.
    pub needs_no_new_privs: bool,
}

impl CompiledFilter {
    pub fn instruction_count(&self) -> usize {
        self.prog.len()
    }

    /// The {length, instruction-array} pair `prctl` consumes. Valid only
    /// while `self` is alive.
    pub(crate) fn fprog(&self) -> libc::sock_fprog {
        libc::sock_fprog {
            len: self.prog.len() as libc::c_ushort,
            filter: self.prog.as_ptr() as *mut libc::sock_filter,
        }
    }
}

/// Compile the policy against the exec-path pointer the child will pass to
/// execve. Level 0 yields no filter. Failures never leave a partial filter
/// behind; the working context is released before returning either way.
pub fn compile(policy: SyscallPolicy, exec_path_ptr: u64) -> Result<Option<CompiledFilter>> {
    if policy.level == 0 {
        return Ok(None);
    }

    let default_action = if policy.trace_denied {
        ScmpAction::Trace(0)
    } else {
        ScmpAction::KillThread
    };
    let mut ctx = ScmpFilterContext::new_filter(default_action)
        .context("create seccomp context")?;

    let execve = ScmpSyscall::from_name("execve").context("resolve execve")?;
    ctx.add_rule_conditional(
        ScmpAction::Allow,
        execve,
        &[ScmpArgCompare::new(0, ScmpCompareOp::Equal, exec_path_ptr)],
    )
    .context("allow the sandboxed exec")?;

    let mut allowed = 0usize;
    for name in levels::allowed_for(policy.level) {
        match ScmpSyscall::from_name(name) {
            Ok(syscall) => {
                ctx.add_rule(ScmpAction::Allow, syscall)
                    .with_context(|| format!("allow {name}"))?;
                allowed += 1;
            }
            // Not every name exists on every architecture.
            Err(_) => trace!("syscall {name} unknown on this architecture, skipped"),
        }
    }

    let prog = render(&ctx)?;
    debug!(
        "compiled level {} filter: {} syscalls allowed, {} bpf instructions",
        policy.level,
        allowed,
        prog.len()
    );
    Ok(Some(CompiledFilter {
        prog,
        needs_no_new_privs: true,
    }))
}

/// Render the context to raw filter instructions and decode them in host
/// byte order into the array `prctl` expects.
fn render(ctx: &ScmpFilterContext) -> Result<Vec<libc::sock_filter>> {
    let mut file = tempfile::tempfile().context("bpf scratch file")?;
    ctx.export_bpf(&mut file).context("export bpf")?;
    file.seek(SeekFrom::Start(0)).context("rewind bpf scratch")?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw).context("read bpf back")?;

    if raw.is_empty() || raw.len() % 8 != 0 {
        bail!("rendered bpf has bad length {}", raw.len());
    }
    let mut prog = Vec::with_capacity(raw.len() / 8);
    for chunk in raw.chunks_exact(8) {
        prog.push(libc::sock_filter {
            code: u16::from_ne_bytes([chunk[0], chunk[1]]),
            jt: chunk[2],
            jf: chunk[3],
            k: u32::from_ne_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
        });
    }
    Ok(prog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_zero_compiles_to_no_filter() {
        let policy = SyscallPolicy {
            level: 0,
            trace_denied: false,
        };
        assert!(compile(policy, 0x1000).unwrap().is_none());
    }

    #[test]
    fn filters_render_to_whole_instructions() {
        let policy = SyscallPolicy {
            level: 1,
            trace_denied: false,
        };
        let filter = compile(policy, 0xdead_beef).unwrap().unwrap();
        assert!(filter.instruction_count() > 0);
        assert!(filter.needs_no_new_privs);
        let fprog = filter.fprog();
        assert_eq!(fprog.len as usize, filter.instruction_count());
    }

    #[test]
    fn higher_levels_render_larger_programs() {
        let compile_at = |level| {
            compile(
                SyscallPolicy {
                    level,
                    trace_denied: true,
                },
                0x1000,
            )
            .unwrap()
            .unwrap()
            .instruction_count()
        };
        assert!(compile_at(7) > compile_at(1));
    }
}
