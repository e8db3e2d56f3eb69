use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;

/// Why a run was ended (or flagged) by the sandbox rather than by the
/// program's own logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    CpuTimeExceeded,
    WallClockExceeded,
    MemoryExceeded,
    ThreadCountExceeded,
    OutputSizeExceeded,
    /// A syscall denied by the filter, with the syscall number read from the
    /// tracee's registers.
    BadSyscall { nr: u64 },
    /// The target died abnormally without tripping any configured limit.
    RuntimeError,
    /// A fault of the sandbox itself, never of the target.
    InternalError { detail: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::CpuTimeExceeded => write!(f, "cpu time exceeded"),
            Violation::WallClockExceeded => write!(f, "wall clock time exceeded"),
            Violation::MemoryExceeded => write!(f, "memory exceeded"),
            Violation::ThreadCountExceeded => write!(f, "thread count exceeded"),
            Violation::OutputSizeExceeded => write!(f, "output size exceeded"),
            Violation::BadSyscall { nr } => write!(f, "bad syscall: {nr}"),
            Violation::RuntimeError => write!(f, "runtime error"),
            Violation::InternalError { detail } => write!(f, "sandbox error: {detail}"),
        }
    }
}

/// Single-assignment cell for the run's violation.
///
/// The wall-clock timer, the usage guard, and the wait loop can all try to
/// record a cause near-simultaneously; only the first write sticks, which
/// keeps the reported cause stable.
#[derive(Debug, Default)]
pub struct ViolationCell(OnceLock<Violation>);

impl ViolationCell {
    pub fn new() -> Self {
        Self(OnceLock::new())
    }

    /// Record a violation. Returns true if this call won the race.
    pub fn set(&self, violation: Violation) -> bool {
        self.0.set(violation).is_ok()
    }

    pub fn get(&self) -> Option<&Violation> {
        self.0.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn first_write_wins() {
        let cell = ViolationCell::new();
        assert!(cell.set(Violation::WallClockExceeded));
        assert!(!cell.set(Violation::CpuTimeExceeded));
        assert_eq!(cell.get(), Some(&Violation::WallClockExceeded));
    }

    #[test]
    fn concurrent_writers_leave_exactly_one_value() {
        let cell = Arc::new(ViolationCell::new());
        let mut handles = Vec::new();
        for nr in 0..16u64 {
            let cell = Arc::clone(&cell);
            handles.push(std::thread::spawn(move || {
                cell.set(Violation::BadSyscall { nr })
            }));
        }
        let winners: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
        assert!(matches!(cell.get(), Some(Violation::BadSyscall { .. })));
    }

    #[test]
    fn display_carries_the_syscall_number() {
        assert_eq!(Violation::BadSyscall { nr: 41 }.to_string(), "bad syscall: 41");
    }
}
