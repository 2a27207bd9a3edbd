//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a page frame number
//! where a task id is expected, and make function signatures more expressive.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Kernel thread id of the task that triggered an event
///
/// This is the kernel's `pid` (a userspace TID), not the thread group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Kernel allocator subsystem an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Page,
    Slab,
}

impl Domain {
    /// Both domains, in report order
    pub const ALL: [Domain; 2] = [Domain::Page, Domain::Slab];

    /// Dense index for per-domain arrays
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Domain::Page => 0,
            Domain::Slab => 1,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Page => "page",
            Domain::Slab => "slab",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved allocation call path, innermost frame first
///
/// Compared and hashed by content, so two independently resolved stacks with
/// the same frames land in the same statistics bucket. The frames live behind
/// an `Arc`, so clones stored in every open allocation are cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallStack(Arc<[String]>);

impl CallStack {
    /// Frame used when a backend captured no stack at all
    pub const NO_STACK: &'static str = "[no stack]";

    #[must_use]
    pub fn new(frames: Vec<String>) -> Self {
        if frames.is_empty() {
            return Self::empty();
        }
        Self(Arc::from(frames))
    }

    /// The placeholder stack for events without frames
    #[must_use]
    pub fn empty() -> Self {
        Self(Arc::from(vec![Self::NO_STACK.to_string()]))
    }

    #[must_use]
    pub fn frames(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" <- "))
    }
}
