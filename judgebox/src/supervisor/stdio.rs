//! Stdio wiring: turn the three configured bindings into the fd triple the
//! child will own, plus the parent-side bridge tasks for piped endpoints.

use anyhow::{Context, Result};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::OwnedFd;

use crate::config::{IoConfig, OutputSink, StdinSource};
use crate::spawn::pipe_cloexec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BridgeKind {
    Stdin,
    Stdout,
    Stderr,
}

impl fmt::Display for BridgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BridgeKind::Stdin => "stdin",
            BridgeKind::Stdout => "stdout",
            BridgeKind::Stderr => "stderr",
        })
    }
}

/// A one-way copy between a configured stream and its pipe. Runs on a
/// blocking task; dropping the owned pipe end at completion is what
/// delivers EOF (stdin) or releases the read side (stdout/stderr).
pub(crate) struct Bridge {
    pub kind: BridgeKind,
    pub run: Box<dyn FnOnce() -> io::Result<u64> + Send>,
}

pub(crate) struct StdioSet {
    /// Child-side descriptors for fds 0/1/2.
    pub child: [Option<OwnedFd>; 3],
    pub bridges: Vec<Bridge>,
}

pub(crate) fn wire(io_cfg: IoConfig) -> Result<StdioSet> {
    let mut bridges = Vec::new();

    let stdin = match io_cfg.stdin {
        StdinSource::Null => {
            OwnedFd::from(File::open("/dev/null").context("open null device for stdin")?)
        }
        StdinSource::File(file) => OwnedFd::from(file),
        StdinSource::Piped(mut reader) => {
            let (child_end, parent_end) = pipe_cloexec().context("stdin pipe")?;
            let mut writer = File::from(parent_end);
            bridges.push(Bridge {
                kind: BridgeKind::Stdin,
                run: Box::new(move || io::copy(&mut reader, &mut writer)),
            });
            child_end
        }
    };

    let stdout = wire_output(io_cfg.stdout, BridgeKind::Stdout, &mut bridges)?;
    let stderr = wire_output(io_cfg.stderr, BridgeKind::Stderr, &mut bridges)?;

    Ok(StdioSet {
        child: [Some(stdin), Some(stdout), Some(stderr)],
        bridges,
    })
}

fn wire_output(
    sink: OutputSink,
    kind: BridgeKind,
    bridges: &mut Vec<Bridge>,
) -> Result<OwnedFd> {
    Ok(match sink {
        OutputSink::Null => OwnedFd::from(
            OpenOptions::new()
                .write(true)
                .open("/dev/null")
                .with_context(|| format!("open null device for {kind}"))?,
        ),
        OutputSink::File(file) => OwnedFd::from(file),
        OutputSink::Piped(mut writer) => {
            let (parent_end, child_end) = pipe_cloexec().with_context(|| format!("{kind} pipe"))?;
            let mut reader = File::from(parent_end);
            bridges.push(Bridge {
                kind,
                run: Box::new(move || {
                    let copied = io::copy(&mut reader, &mut writer);
                    // release the read side even when the sink errored
                    drop(reader);
                    copied
                }),
            });
            child_end
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::AsRawFd;

    #[test]
    fn null_bindings_produce_three_descriptors_and_no_bridges() {
        let set = wire(IoConfig::default()).unwrap();
        assert!(set.bridges.is_empty());
        for slot in &set.child {
            assert!(slot.as_ref().unwrap().as_raw_fd() >= 0);
        }
    }

    #[test]
    fn piped_stdout_bridges_into_the_sink() {
        let set = wire(IoConfig {
            stdin: StdinSource::Null,
            stdout: OutputSink::Piped(Box::new(Vec::new())),
            stderr: OutputSink::Null,
        })
        .unwrap();
        assert_eq!(set.bridges.len(), 1);
        assert_eq!(set.bridges[0].kind, BridgeKind::Stdout);
    }

    #[test]
    fn stdin_bridge_copies_reader_to_pipe() {
        let payload = b"four score and seven".to_vec();
        let mut set = wire(IoConfig {
            stdin: StdinSource::Piped(Box::new(io::Cursor::new(payload.clone()))),
            stdout: OutputSink::Null,
            stderr: OutputSink::Null,
        })
        .unwrap();
        let child_end = set.child[0].take().unwrap();
        let bridge = set.bridges.pop().unwrap();
        let writer = std::thread::spawn(bridge.run);
        let mut read_back = Vec::new();
        File::from(child_end).read_to_end(&mut read_back).unwrap();
        assert_eq!(read_back, payload);
        assert_eq!(writer.join().unwrap().unwrap(), payload.len() as u64);
    }
}
