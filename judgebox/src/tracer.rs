//! Usage tracer: keeps a concurrently-readable snapshot of what the target's
//! whole process subtree is consuming, by rescanning /proc on a short period.
//!
//! The tracer only samples; killing on a limit is the supervisor's call.
//! Sampling-based accounting cannot see what happens between two scans.
//! That imprecision is accepted, and the in-kernel rlimits backstop the
//! cases that matter (cpu seconds, output size).

use log::{debug, trace};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

static TICKS_PER_SEC: Lazy<u64> = Lazy::new(procfs::ticks_per_second);

/// One scan's totals over the subtree. Published all-or-nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub kernel_time_ms: u64,
    pub user_time_ms: u64,
    pub virtual_memory_bytes: u64,
    pub thread_count: u64,
}

impl UsageSnapshot {
    /// Kernel plus user time, the quantity the cpu limit is checked against.
    pub fn cpu_time_ms(&self) -> u64 {
        self.kernel_time_ms.saturating_add(self.user_time_ms)
    }
}

/// Monotonic high-watermarks over the run's lifetime. Each field only ever
/// grows, so any later read is at least as large as any earlier one.
#[derive(Debug, Default)]
pub struct UsagePeaks {
    kernel_time_ms: AtomicU64,
    user_time_ms: AtomicU64,
    virtual_memory_bytes: AtomicU64,
    thread_count: AtomicU64,
}

impl UsagePeaks {
    pub fn observe(&self, snapshot: &UsageSnapshot) {
        self.kernel_time_ms
            .fetch_max(snapshot.kernel_time_ms, Ordering::Relaxed);
        self.user_time_ms
            .fetch_max(snapshot.user_time_ms, Ordering::Relaxed);
        self.virtual_memory_bytes
            .fetch_max(snapshot.virtual_memory_bytes, Ordering::Relaxed);
        self.thread_count
            .fetch_max(snapshot.thread_count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            kernel_time_ms: self.kernel_time_ms.load(Ordering::Relaxed),
            user_time_ms: self.user_time_ms.load(Ordering::Relaxed),
            virtual_memory_bytes: self.virtual_memory_bytes.load(Ordering::Relaxed),
            thread_count: self.thread_count.load(Ordering::Relaxed),
        }
    }
}

/// The sampling loop plus its published snapshot. Holds only the root pid,
/// never a handle to the process itself.
pub struct UsageTracer {
    shutdown: Arc<AtomicBool>,
    rx: watch::Receiver<Option<UsageSnapshot>>,
}

impl UsageTracer {
    /// Start sampling the subtree rooted at `root`. The receiver starts at
    /// `None` until the first scan lands.
    pub fn spawn(root: i32, period: Duration) -> Self {
        let (tx, rx) = watch::channel(None);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        tokio::spawn(async move {
            while !flag.load(Ordering::Relaxed) {
                match sample_subtree(root) {
                    Some(snapshot) => {
                        if tx.send(Some(snapshot)).is_err() {
                            break;
                        }
                    }
                    None => debug!("/proc scan failed, keeping previous snapshot"),
                }
                tokio::time::sleep(period).await;
            }
            trace!("usage tracer for pid {root} stopped");
        });
        Self { shutdown, rx }
    }

    /// The most recently computed snapshot, if any scan completed yet.
    pub fn get_snapshot(&self) -> Option<UsageSnapshot> {
        *self.rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<UsageSnapshot>> {
        self.rx.clone()
    }

    pub fn destroy(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Drop for UsageTracer {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Scan /proc once: build the parent→children adjacency over every visible
/// process, then walk the tree from `root`, summing times, vsize, and
/// thread counts. Pids that vanish between enumeration and the stat read
/// are skipped; the root is always part of the walk.
pub(crate) fn sample_subtree(root: i32) -> Option<UsageSnapshot> {
    let procs = procfs::process::all_processes().ok()?;

    let mut stats = HashMap::new();
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for process in procs.flatten() {
        if let Ok(stat) = process.stat() {
            children.entry(stat.ppid).or_default().push(stat.pid);
            stats.insert(stat.pid, stat);
        }
    }

    let mut snapshot = UsageSnapshot::default();
    let mut walk = vec![root];
    let mut at = 0;
    while at < walk.len() {
        let pid = walk[at];
        at += 1;
        if let Some(kids) = children.get(&pid) {
            walk.extend_from_slice(kids);
        }
        let Some(stat) = stats.get(&pid) else {
            continue;
        };
        snapshot.kernel_time_ms += ticks_to_ms(stat.stime);
        snapshot.user_time_ms += ticks_to_ms(stat.utime);
        snapshot.virtual_memory_bytes += stat.vsize;
        snapshot.thread_count += stat.num_threads.max(0) as u64;
    }
    Some(snapshot)
}

fn ticks_to_ms(ticks: u64) -> u64 {
    ticks.saturating_mul(1000) / *TICKS_PER_SEC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peaks_only_grow() {
        let peaks = UsagePeaks::default();
        peaks.observe(&UsageSnapshot {
            kernel_time_ms: 10,
            user_time_ms: 50,
            virtual_memory_bytes: 4096,
            thread_count: 3,
        });
        peaks.observe(&UsageSnapshot {
            kernel_time_ms: 5,
            user_time_ms: 80,
            virtual_memory_bytes: 1024,
            thread_count: 1,
        });
        let peak = peaks.snapshot();
        assert_eq!(peak.kernel_time_ms, 10);
        assert_eq!(peak.user_time_ms, 80);
        assert_eq!(peak.virtual_memory_bytes, 4096);
        assert_eq!(peak.thread_count, 3);
    }

    #[test]
    fn cpu_time_saturates_instead_of_overflowing() {
        let snapshot = UsageSnapshot {
            kernel_time_ms: u64::MAX,
            user_time_ms: 1,
            ..Default::default()
        };
        assert_eq!(snapshot.cpu_time_ms(), u64::MAX);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn sampling_our_own_pid_sees_this_process() {
        let snapshot = sample_subtree(std::process::id() as i32).unwrap();
        assert!(snapshot.thread_count >= 1);
        assert!(snapshot.virtual_memory_bytes > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn sampling_a_missing_root_yields_zeros() {
        let snapshot = sample_subtree(i32::MAX - 1).unwrap();
        assert_eq!(snapshot, UsageSnapshot::default());
    }
}
