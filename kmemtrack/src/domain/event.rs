//! Backend-independent allocator events

use super::types::{Domain, TaskId};

/// Whether an event creates or releases memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// `size` is in bytes
    Alloc { size: u64 },
    Free,
}

/// Unresolved call chain as captured by a backend
///
/// The eBPF backend hands over instruction pointers; ftrace has already
/// symbolized the chain in the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RawFrames {
    Addresses(Vec<u64>),
    Symbols(Vec<String>),
}

impl RawFrames {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            RawFrames::Addresses(frames) => frames.is_empty(),
            RawFrames::Symbols(frames) => frames.is_empty(),
        }
    }

    #[must_use]
    pub fn none() -> Self {
        RawFrames::Addresses(Vec::new())
    }
}

/// One normalized allocation or free
///
/// `address` is a page frame number for the page domain and an object
/// pointer for the slab domain. Frees normally carry no frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocEvent {
    pub task_id: TaskId,
    /// Command name reported by the kernel alongside the event
    pub comm: Option<String>,
    pub domain: Domain,
    pub kind: EventKind,
    pub address: u64,
    pub raw_frames: RawFrames,
}

impl AllocEvent {
    #[must_use]
    pub fn alloc(task_id: TaskId, domain: Domain, address: u64, size: u64) -> Self {
        Self {
            task_id,
            comm: None,
            domain,
            kind: EventKind::Alloc { size },
            address,
            raw_frames: RawFrames::none(),
        }
    }

    #[must_use]
    pub fn free(task_id: TaskId, domain: Domain, address: u64) -> Self {
        Self {
            task_id,
            comm: None,
            domain,
            kind: EventKind::Free,
            address,
            raw_frames: RawFrames::none(),
        }
    }

    #[must_use]
    pub fn with_frames(mut self, raw_frames: RawFrames) -> Self {
        self.raw_frames = raw_frames;
        self
    }

    #[must_use]
    pub fn with_comm(mut self, comm: impl Into<String>) -> Self {
        self.comm = Some(comm.into());
        self
    }
}
