//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Defines data structures and constants shared between the kernel-side
//! tracepoint programs and userspace. All types use `#[repr(C)]` for a
//! consistent memory layout across the kernel/userspace boundary.
//!
//! ## Key Types
//!
//! - [`AllocRecord`] - One allocator event, written to the `EVENTS` ring buffer
//! - [`FieldLayout`] - Where a tracepoint keeps its address and size fields,
//!   read from tracefs `format` files by userspace and pushed into `LAYOUTS`

#![no_std]

// ============================================================================
// Event Kinds
// ============================================================================

/// `kmem/mm_page_alloc`: `pfn`, `order`
pub const EVENT_PAGE_ALLOC: u32 = 1;

/// `kmem/mm_page_free`: `pfn`, `order`
pub const EVENT_PAGE_FREE: u32 = 2;

/// `kmem/mm_page_free_batched`: `pfn` (always order 0)
pub const EVENT_PAGE_FREE_BATCHED: u32 = 3;

/// `kmem/kmalloc`: `ptr`, `bytes_alloc`
pub const EVENT_KMALLOC: u32 = 4;

/// `kmem/kmalloc_node`: `ptr`, `bytes_alloc` (merged into `kmalloc` on kernels >= 6.1)
pub const EVENT_KMALLOC_NODE: u32 = 5;

/// `kmem/kmem_cache_alloc`: `ptr`, `bytes_alloc`
pub const EVENT_CACHE_ALLOC: u32 = 6;

/// `kmem/kmem_cache_alloc_node`: `ptr`, `bytes_alloc` (merged on kernels >= 6.1)
pub const EVENT_CACHE_ALLOC_NODE: u32 = 7;

/// `kmem/kfree`: `ptr`
pub const EVENT_KFREE: u32 = 8;

/// `kmem/kmem_cache_free`: `ptr`
pub const EVENT_CACHE_FREE: u32 = 9;

/// One past the largest event kind; sizes the `LAYOUTS` array map.
pub const EVENT_KIND_COUNT: u32 = 10;

/// Returns true for event kinds that belong to the page allocator.
#[must_use]
pub const fn is_page_event(kind: u32) -> bool {
    matches!(kind, EVENT_PAGE_ALLOC | EVENT_PAGE_FREE | EVENT_PAGE_FREE_BATCHED)
}

/// Returns true for event kinds that record an allocation (as opposed to a free).
#[must_use]
pub const fn is_alloc_event(kind: u32) -> bool {
    matches!(
        kind,
        EVENT_PAGE_ALLOC
            | EVENT_KMALLOC
            | EVENT_KMALLOC_NODE
            | EVENT_CACHE_ALLOC
            | EVENT_CACHE_ALLOC_NODE
    )
}

// ============================================================================
// Configuration Keys (`CONFIG` map)
// ============================================================================

/// Tgid of the tracer itself; its own allocations are never reported.
pub const CONFIG_SELF_TGID: u32 = 0;

/// Maximum number of kernel frames captured per allocation.
///
/// Kept small so a whole record fits comfortably in one ring buffer
/// reservation; deeper frames are truncated by `bpf_get_stack`.
pub const MAX_FRAMES: usize = 32;

/// Length of a task command name, including the NUL terminator.
pub const TASK_COMM_LEN: usize = 16;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Allocator event sent from eBPF to userspace via the `EVENTS` ring buffer.
///
/// **Memory Layout**: `#[repr(C)]` with explicit padding, 312 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AllocRecord {
    /// Kernel thread id (`pid` in kernel terms) that triggered the event
    pub tid: u32,

    /// Thread group id (userspace pid)
    pub tgid: u32,

    /// One of the `EVENT_*` constants
    pub event_kind: u32,

    /// Page order for page events, 0 otherwise
    pub order: u32,

    /// Page frame number (page events) or object pointer (slab events)
    pub address: u64,

    /// `bytes_alloc` for slab allocations, 0 otherwise
    pub bytes: u64,

    /// Command name of the current task (NUL-terminated)
    pub comm: [u8; TASK_COMM_LEN],

    /// Number of valid entries in `frames` (0 for free events)
    pub frame_count: u32,

    /// Padding for 8-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 4],

    /// Kernel instruction pointers, innermost first
    pub frames: [u64; MAX_FRAMES],
}

impl AllocRecord {
    /// An all-zero record, used as the starting point when filling a reservation.
    pub const ZEROED: Self = Self {
        tid: 0,
        tgid: 0,
        event_kind: 0,
        order: 0,
        address: 0,
        bytes: 0,
        comm: [0; TASK_COMM_LEN],
        frame_count: 0,
        _padding: [0; 4],
        frames: [0; MAX_FRAMES],
    };
}

/// Location of the interesting fields of one tracepoint's raw record.
///
/// Offsets are relative to the start of the tracepoint context, exactly as
/// printed in `/sys/kernel/tracing/events/kmem/<event>/format`. A zero size
/// means the tracepoint has no such field (frees carry no size).
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct FieldLayout {
    /// Offset of `pfn` or `ptr`
    pub address_offset: u16,
    /// Width in bytes of `pfn` or `ptr`
    pub address_size: u16,
    /// Offset of `order` or `bytes_alloc`
    pub size_offset: u16,
    /// Width in bytes of `order` or `bytes_alloc`
    pub size_size: u16,
}

impl FieldLayout {
    /// Returns true once userspace has filled this layout in.
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.address_size != 0
    }
}

#[cfg(feature = "user")]
use aya::Pod;

// Pod ensures types can be safely transmitted as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for AllocRecord {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for FieldLayout {}
