//! Process tuning applied before tracing starts
//!
//! The tracer competes with the workload it observes: it raises its own
//! scheduling priority, and on glibc keeps its heap from growing and shrinking
//! in large steps, which would otherwise show up as page allocator noise.

#![allow(unsafe_code)] // setpriority/mallopt/sysconf are plain libc calls

use log::{debug, warn};

/// Nice value requested for the tracer
const TRACER_NICE: libc::c_int = -20;

/// `M_TOP_PAD` / `M_TRIM_THRESHOLD` value in bytes
#[cfg(all(target_os = "linux", target_env = "gnu"))]
const MALLOC_PAD: libc::c_int = 4096;

/// Fallback when `sysconf(_SC_PAGESIZE)` fails
const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Apply priority and allocator tuning; failures are logged, never fatal
pub fn apply() {
    raise_priority();
    tune_allocator();
}

fn raise_priority() {
    // PRIO_PROCESS with who = 0 targets the calling process
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, TRACER_NICE) };
    if rc == 0 {
        debug!("Scheduling priority raised to nice {TRACER_NICE}");
    } else {
        warn!("Failed to raise priority: {}", std::io::Error::last_os_error());
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn tune_allocator() {
    unsafe {
        libc::mallopt(libc::M_TOP_PAD, MALLOC_PAD);
        libc::mallopt(libc::M_TRIM_THRESHOLD, MALLOC_PAD);
    }
    debug!("glibc malloc padding set to {MALLOC_PAD} bytes");
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn tune_allocator() {}

/// System page size in bytes
#[must_use]
pub fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(size).ok().filter(|s| *s > 0).unwrap_or(DEFAULT_PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }
}
