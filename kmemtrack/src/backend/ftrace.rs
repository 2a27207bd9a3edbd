//! # ftrace Event Source
//!
//! Creates a private tracefs instance (`instances/kmemtrack`) so other users
//! of the global trace buffer are left alone, enables the `kmem` events with
//! the `stacktrace` option, and reads `trace_pipe`.
//!
//! With `stacktrace` set, every event is followed by a separate entry:
//!
//! ```text
//!             bash-1234  [002] d..1.  100.000001: kmalloc: call_site=... ptr=... bytes_alloc=64
//!             bash-1234  [002] d..1.  100.000002: <stack trace>
//!  => __kmalloc+0x1a/0x80
//!  => alloc_inode+0x20/0x90
//! ```
//!
//! `trace_pipe` merges the per-CPU buffers by timestamp, so entries from
//! different CPUs interleave freely; an event's stack entry is only
//! guaranteed to come after it on the same CPU. [`TraceFramer`] therefore
//! keeps one held-back event per CPU and attaches a `<stack trace>` block to
//! the event of the CPU that printed it. A record is complete once its stack
//! block ends or the next event from that CPU arrives (or on
//! [`FtraceSource::drain_remaining`]).

use log::{debug, warn};
use regex::Regex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::io::unix::AsyncFd;

use crate::config::Config;
use crate::domain::BackendError;
use crate::normalize::RawRecord;
use crate::tracefs::Tracefs;
use crate::tracepoints;

/// Name of our tracefs instance
pub const INSTANCE_NAME: &str = "kmemtrack";

const READ_CHUNK: usize = 64 * 1024;

// =============================================================================
// FRAMING
// =============================================================================

/// `comm-pid [cpu]` prefix shared by event and `<stack trace>` lines
static CPU_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*.+-\d+\s+(?:\(\s*[\d-]+\)\s+)?\[(?P<cpu>\d+)\]")
        .expect("Invalid trace cpu regex pattern")
});

fn line_cpu(line: &str) -> Option<u32> {
    CPU_RE.captures(line)?.name("cpu")?.as_str().parse().ok()
}

#[derive(Debug)]
struct HeldRecord {
    /// Arrival order, used to flush in the order events were read
    seq: u64,
    header: String,
    stack: Vec<String>,
}

/// Splits `trace_pipe` bytes into header + stack records
#[derive(Debug, Default)]
pub struct TraceFramer {
    partial: Vec<u8>,
    held: HashMap<u32, HeldRecord>,
    /// CPU whose `<stack trace>` block is being read
    stack_cpu: Option<u32>,
    next_seq: u64,
}

impl TraceFramer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; completed records are appended to `out`
    pub fn push_bytes(&mut self, bytes: &[u8], out: &mut Vec<RawRecord>) {
        self.partial.extend_from_slice(bytes);
        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return;
        };
        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        for line in String::from_utf8_lossy(&complete).lines() {
            self.push_line(line, out);
        }
    }

    fn push_line(&mut self, line: &str, out: &mut Vec<RawRecord>) {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return;
        }
        if trimmed.starts_with("=>") {
            match self.stack_cpu.and_then(|cpu| self.held.get_mut(&cpu)) {
                Some(record) => record.stack.push(line.to_string()),
                None => debug!("Dropping frame without event: {trimmed}"),
            }
            return;
        }

        // Anything else ends the stack block being read
        if let Some(cpu) = self.stack_cpu.take() {
            self.emit(cpu, out);
        }

        let Some(cpu) = line_cpu(line) else {
            // Passed on as-is; the normalizer counts it as unparsable
            out.push(RawRecord::Text { header: line.to_string(), stack: Vec::new() });
            return;
        };
        if trimmed.ends_with("<stack trace>") {
            if self.held.contains_key(&cpu) {
                self.stack_cpu = Some(cpu);
            } else {
                debug!("Dropping stack without event on cpu {cpu}");
            }
            return;
        }
        if trimmed.ends_with("<user stack trace>") {
            return;
        }

        self.emit(cpu, out);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.held.insert(cpu, HeldRecord { seq, header: line.to_string(), stack: Vec::new() });
    }

    fn emit(&mut self, cpu: u32, out: &mut Vec<RawRecord>) {
        if let Some(HeldRecord { header, stack, .. }) = self.held.remove(&cpu) {
            out.push(RawRecord::Text { header, stack });
        }
    }

    /// Emit every held-back record, oldest first
    pub fn flush(&mut self, out: &mut Vec<RawRecord>) {
        self.stack_cpu = None;
        let mut held: Vec<HeldRecord> = self.held.drain().map(|(_, record)| record).collect();
        held.sort_by_key(|record| record.seq);
        out.extend(held.into_iter().map(|HeldRecord { header, stack, .. }| RawRecord::Text { header, stack }));
    }
}

// =============================================================================
// TRACEFS INSTANCE
// =============================================================================

/// A tracefs instance directory and the switches we flipped in it
///
/// Everything is switched back off and the instance removed on teardown,
/// which also runs on drop so a failed setup cleans up after itself.
#[derive(Debug)]
struct Instance {
    path: PathBuf,
    enabled: Vec<PathBuf>,
    torn_down: bool,
}

impl Instance {
    fn create(tracefs: &Tracefs) -> Result<Self, BackendError> {
        let path = tracefs.root().join("instances").join(INSTANCE_NAME);
        if path.is_dir() {
            warn!("Reusing leftover tracefs instance {}", path.display());
        } else {
            std::fs::create_dir(&path)
                .map_err(|e| BackendError::tracefs("create", &path, e))?;
        }
        Ok(Self { path, enabled: Vec::new(), torn_down: false })
    }

    fn write(&self, relative: impl AsRef<Path>, value: &str) -> Result<(), BackendError> {
        let path = self.path.join(relative);
        std::fs::write(&path, value).map_err(|e| BackendError::tracefs("write", &path, e))
    }

    fn enable(&mut self, relative: PathBuf) -> Result<(), BackendError> {
        self.write(&relative, "1")?;
        self.enabled.push(relative);
        Ok(())
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let mut switches = vec![PathBuf::from("tracing_on")];
        switches.extend(self.enabled.drain(..).rev());
        for relative in switches {
            if let Err(e) = self.write(&relative, "0") {
                warn!("{e}");
            }
        }
        match std::fs::remove_dir(&self.path) {
            Ok(()) => debug!("Removed tracefs instance {}", self.path.display()),
            Err(e) => warn!("Failed to remove tracefs instance {}: {e}", self.path.display()),
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.teardown();
    }
}

// =============================================================================
// SOURCE
// =============================================================================

pub struct FtraceSource {
    // Declared before `instance`: the pipe must be closed before the
    // instance directory can be removed
    pipe: Option<AsyncFd<File>>,
    framer: TraceFramer,
    buf: Vec<u8>,
    instance: Instance,
}

impl FtraceSource {
    /// Set up the instance and open its `trace_pipe`
    ///
    /// # Errors
    /// Returns a [`BackendError`] if the instance can't be created, a required
    /// event is missing, or a control file can't be written.
    pub fn init(config: &Config, tracefs: &Tracefs) -> Result<Self, BackendError> {
        let mut instance = Instance::create(tracefs)?;

        instance.write("tracing_on", "0")?;
        // Opening `trace` for writing clears the buffer
        instance.write("trace", "")?;
        instance.enable(PathBuf::from("options/stacktrace"))?;

        if instance.path.join("set_event_notrace_pid").exists() {
            if let Err(e) = instance.write("set_event_notrace_pid", &std::process::id().to_string()) {
                debug!("Could not exclude own pid: {e}");
            }
        }

        for tp in config.domains().flat_map(tracepoints::for_domain) {
            if !tracefs.has_event(tp.name) {
                if tp.optional {
                    debug!("Skipping kmem/{}: not present on this kernel", tp.name);
                    continue;
                }
                return Err(BackendError::MissingTracepoint(tp.name.to_string()));
            }
            instance.enable(Tracefs::event_dir(Path::new(""), tp.name).join("enable"))?;
        }

        let pipe_path = instance.path.join("trace_pipe");
        let pipe = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&pipe_path)
            .map_err(|e| BackendError::tracefs("open", &pipe_path, e))?;
        let pipe = AsyncFd::new(pipe)?;

        instance.write("tracing_on", "1")?;
        debug!("Tracing through {}", instance.path.display());

        Ok(Self { pipe: Some(pipe), framer: TraceFramer::new(), buf: vec![0; READ_CHUNK], instance })
    }

    /// Wait until at least one complete record is available
    ///
    /// # Errors
    /// Returns an error if reading `trace_pipe` fails or the source was torn down.
    pub async fn next_batch(&mut self, out: &mut Vec<RawRecord>) -> Result<(), BackendError> {
        let pipe = self.pipe.as_mut().ok_or_else(closed_pipe)?;
        loop {
            let mut guard = pipe.readable_mut().await?;
            match guard.try_io(|inner| inner.get_mut().read(&mut self.buf)) {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => {
                    self.framer.push_bytes(&self.buf[..n], out);
                    if !out.is_empty() {
                        return Ok(());
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => {}
            }
        }
    }

    /// Read what is buffered without waiting and flush the held-back record
    pub fn drain_remaining(&mut self, out: &mut Vec<RawRecord>) {
        if let Some(pipe) = self.pipe.as_mut() {
            loop {
                match pipe.get_mut().read(&mut self.buf) {
                    Ok(0) => break,
                    Ok(n) => self.framer.push_bytes(&self.buf[..n], out),
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        if e.kind() != ErrorKind::WouldBlock {
                            warn!("Failed to drain trace_pipe: {e}");
                        }
                        break;
                    }
                }
            }
        }
        self.framer.flush(out);
    }

    /// Stop tracing and remove the instance; safe to call more than once
    pub fn teardown(&mut self) {
        // An open trace_pipe keeps the instance busy
        self.pipe = None;
        self.instance.teardown();
    }
}

fn closed_pipe() -> BackendError {
    BackendError::Io(std::io::Error::new(ErrorKind::NotConnected, "trace_pipe already closed"))
}
