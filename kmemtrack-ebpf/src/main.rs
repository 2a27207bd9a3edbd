//! # eBPF Kernel-Side Instrumentation
//!
//! Tracepoint programs that run inside the Linux kernel and forward every
//! page/slab allocator event, with the kernel call chain of allocations, to
//! userspace.
//!
//! ## Programs
//!
//! One `#[tracepoint]` program per `kmem` tracepoint. Userspace attaches only
//! the programs for the selected domains, and skips optional tracepoints the
//! running kernel does not have (`kmalloc_node`, `kmem_cache_alloc_node`).
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer (16MB) of [`AllocRecord`]s
//! - `LAYOUTS` - Per event kind field offsets, filled in from tracefs `format` files
//! - `CONFIG` - Runtime configuration (tracer's own tgid)
//! - `DROPPED` - Per-CPU count of records lost to a full ring buffer
//!
//! ## Build
//!
//! Always compiled in release mode:
//! ```bash
//! cargo xtask build-ebpf
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_stack},
    macros::{map, tracepoint},
    maps::{Array, HashMap, PerCpuArray, RingBuf},
    programs::TracePointContext,
    EbpfContext,
};
use aya_log_ebpf::warn;
use kmemtrack_common::{
    is_alloc_event, is_page_event, AllocRecord, FieldLayout, CONFIG_SELF_TGID,
    EVENT_CACHE_ALLOC, EVENT_CACHE_ALLOC_NODE, EVENT_CACHE_FREE, EVENT_KFREE, EVENT_KIND_COUNT,
    EVENT_KMALLOC, EVENT_KMALLOC_NODE, EVENT_PAGE_ALLOC, EVENT_PAGE_FREE, EVENT_PAGE_FREE_BATCHED,
    MAX_FRAMES,
};

/// Size of the frame buffer handed to `bpf_get_stack`.
const FRAMES_BYTES: u32 = (MAX_FRAMES * 8) as u32;

/// `bpf_get_stack` flags: kernel stack, no frames skipped.
const STACK_FLAGS: u64 = 0;

// ============================================================================
// eBPF Maps
// ============================================================================

/// Ring buffer for sending records to userspace
///
/// - **Size**: 16MB (~53k records)
/// - **Usage**: Kernel reserves + submits, userspace drains with `ring_buf.next()`
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(16 * 1024 * 1024, 0);

/// Map: event kind → tracepoint field layout
#[map]
static LAYOUTS: Array<FieldLayout> = Array::with_max_entries(EVENT_KIND_COUNT, 0);

/// Map: Config key → Config value
///
/// - **Key 0**: tgid of the tracer (its own allocations are skipped)
#[map]
static CONFIG: HashMap<u32, u64> = HashMap::with_max_entries(16, 0);

/// Records that could not be reserved because the ring buffer was full
#[map]
static DROPPED: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

// ============================================================================
// Tracepoint Hooks
// ============================================================================

#[tracepoint]
pub fn mm_page_alloc(ctx: TracePointContext) -> u32 {
    handle_event(&ctx, EVENT_PAGE_ALLOC)
}

#[tracepoint]
pub fn mm_page_free(ctx: TracePointContext) -> u32 {
    handle_event(&ctx, EVENT_PAGE_FREE)
}

#[tracepoint]
pub fn mm_page_free_batched(ctx: TracePointContext) -> u32 {
    handle_event(&ctx, EVENT_PAGE_FREE_BATCHED)
}

#[tracepoint]
pub fn kmalloc(ctx: TracePointContext) -> u32 {
    handle_event(&ctx, EVENT_KMALLOC)
}

#[tracepoint]
pub fn kmalloc_node(ctx: TracePointContext) -> u32 {
    handle_event(&ctx, EVENT_KMALLOC_NODE)
}

#[tracepoint]
pub fn kmem_cache_alloc(ctx: TracePointContext) -> u32 {
    handle_event(&ctx, EVENT_CACHE_ALLOC)
}

#[tracepoint]
pub fn kmem_cache_alloc_node(ctx: TracePointContext) -> u32 {
    handle_event(&ctx, EVENT_CACHE_ALLOC_NODE)
}

#[tracepoint]
pub fn kfree(ctx: TracePointContext) -> u32 {
    handle_event(&ctx, EVENT_KFREE)
}

#[tracepoint]
pub fn kmem_cache_free(ctx: TracePointContext) -> u32 {
    handle_event(&ctx, EVENT_CACHE_FREE)
}

fn handle_event(ctx: &TracePointContext, kind: u32) -> u32 {
    match try_handle_event(ctx, kind) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_handle_event(ctx: &TracePointContext, kind: u32) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let tgid = (pid_tgid >> 32) as u32;
    let tid = pid_tgid as u32;

    if tgid != 0 && u64::from(tgid) == self_tgid() {
        return Ok(());
    }

    let Some(layout) = LAYOUTS.get(kind).copied() else {
        return Err(1);
    };
    if !layout.is_configured() {
        warn!(ctx, "no field layout for event kind {}", kind);
        return Err(1);
    }

    let address = read_field(ctx, layout.address_offset, layout.address_size)?;
    // kfree(NULL) and friends
    if address == 0 {
        return Ok(());
    }
    let size = if layout.size_size == 0 {
        0
    } else {
        read_field(ctx, layout.size_offset, layout.size_size)?
    };

    let Some(mut entry) = EVENTS.reserve::<AllocRecord>(0) else {
        count_drop();
        return Ok(());
    };
    let record = entry.as_mut_ptr();

    unsafe {
        (*record).tid = tid;
        (*record).tgid = tgid;
        (*record).event_kind = kind;
        (*record).address = address;
        if is_page_event(kind) {
            (*record).order = size as u32;
            (*record).bytes = 0;
        } else {
            (*record).order = 0;
            (*record).bytes = size;
        }
        (*record).comm = bpf_get_current_comm().unwrap_or([0u8; 16]);
        (*record)._padding = [0u8; 4];

        let captured = if is_alloc_event(kind) {
            bpf_get_stack(
                ctx.as_ptr(),
                core::ptr::addr_of_mut!((*record).frames).cast(),
                FRAMES_BYTES,
                STACK_FLAGS,
            )
        } else {
            0
        };
        (*record).frame_count = if captured > 0 { (captured as u32) / 8 } else { 0 };
    }

    entry.submit(0);
    Ok(())
}

fn read_field(ctx: &TracePointContext, offset: u16, size: u16) -> Result<u64, i64> {
    let offset = offset as usize;
    unsafe {
        match size {
            8 => ctx.read_at::<u64>(offset),
            4 => ctx.read_at::<u32>(offset).map(u64::from),
            2 => ctx.read_at::<u16>(offset).map(u64::from),
            1 => ctx.read_at::<u8>(offset).map(u64::from),
            _ => Err(1),
        }
    }
}

fn self_tgid() -> u64 {
    unsafe { CONFIG.get(&CONFIG_SELF_TGID).copied().unwrap_or(0) }
}

fn count_drop() {
    if let Some(counter) = DROPPED.get_ptr_mut(0) {
        unsafe { *counter += 1 };
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
