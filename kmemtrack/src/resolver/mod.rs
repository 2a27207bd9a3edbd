//! # Symbol and Task Name Resolution
//!
//! Turns raw frames into [`CallStack`]s and task ids into command names.
//! Resolution never fails: unknown addresses become `0x<hex>` frames and
//! vanished tasks become `[pid N]`.
//!
//! ## Frame cleanup
//!
//! - Leading tracing plumbing (`bpf_*`, `perf_trace_*`, `__traceiter_*`, ...)
//!   is stripped so stacks start at the allocator entry point
//! - ftrace's `fn+0x1a/0x80` is shortened to `fn+0x1a`, matching kallsyms output
//! - An empty stack becomes the single frame `[no stack]`

mod kallsyms;
mod tasks;

pub use kallsyms::{KernelSymbol, KernelSymbols, KALLSYMS_PATH};
pub use tasks::{read_task_name, unknown_task_name};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use crate::domain::{CallStack, RawFrames, TaskId};

/// Frames of the tracing machinery itself, above the real allocation site
const PLUMBING_PREFIXES: [&str; 5] =
    ["bpf_", "perf_trace_", "trace_event_raw_event_", "__traceiter_", "__bpf_trace_"];

/// Maps raw frames and task ids to display names
///
/// Implementations are total and may be called from any thread.
pub trait Resolver: Send + Sync {
    fn resolve_stack(&self, frames: &RawFrames, task_id: TaskId) -> CallStack;

    fn resolve_task_name(&self, task_id: TaskId) -> String;
}

/// Resolver backed by `/proc/kallsyms` and `/proc/<pid>`
///
/// Equal raw frame lists resolve to the same interned [`CallStack`].
pub struct KernelResolver {
    symbols: KernelSymbols,
    proc_root: PathBuf,
    stacks: Mutex<HashMap<RawFrames, CallStack>>,
    names: Mutex<HashMap<TaskId, String>>,
}

impl KernelResolver {
    #[must_use]
    pub fn new(symbols: KernelSymbols) -> Self {
        Self::with_proc_root(symbols, "/proc")
    }

    #[must_use]
    pub fn with_proc_root(symbols: KernelSymbols, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            symbols,
            proc_root: proc_root.into(),
            stacks: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
        }
    }

    /// Number of distinct stacks resolved so far
    #[must_use]
    pub fn interned_stacks(&self) -> usize {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn symbolize(&self, frames: &RawFrames) -> Vec<String> {
        let names: Vec<String> = match frames {
            RawFrames::Addresses(addresses) => addresses
                .iter()
                .take_while(|addr| **addr != 0)
                .map(|addr| self.symbols.format(*addr))
                .collect(),
            RawFrames::Symbols(symbols) => symbols.iter().map(|s| trim_symbol_size(s)).collect(),
        };
        let plumbing = names.iter().take_while(|name| is_plumbing(name)).count();
        names.into_iter().skip(plumbing).collect()
    }
}

impl Resolver for KernelResolver {
    fn resolve_stack(&self, frames: &RawFrames, _task_id: TaskId) -> CallStack {
        if let Some(stack) = self.stacks.lock().unwrap_or_else(PoisonError::into_inner).get(frames)
        {
            return stack.clone();
        }

        let stack = CallStack::new(self.symbolize(frames));
        self.stacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(frames.clone())
            .or_insert(stack)
            .clone()
    }

    fn resolve_task_name(&self, task_id: TaskId) -> String {
        let mut names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        names
            .entry(task_id)
            .or_insert_with(|| {
                read_task_name(&self.proc_root, task_id)
                    .unwrap_or_else(|| unknown_task_name(task_id))
            })
            .clone()
    }
}

fn is_plumbing(frame: &str) -> bool {
    PLUMBING_PREFIXES.iter().any(|prefix| frame.starts_with(prefix))
}

/// `fn+0x1a/0x80 [mod]` -> `fn+0x1a [mod]`
fn trim_symbol_size(frame: &str) -> String {
    let frame = frame.trim();
    let (symbol, rest) = frame.split_once(char::is_whitespace).unwrap_or((frame, ""));
    let symbol = match symbol.rfind('/') {
        Some(idx) if symbol[idx + 1..].starts_with("0x") => &symbol[..idx],
        _ => symbol,
    };
    let rest = rest.trim();
    if rest.is_empty() {
        symbol.to_string()
    } else {
        format!("{symbol} {rest}")
    }
}
