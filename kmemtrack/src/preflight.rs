//! Pre-flight checks for kmemtrack
//!
//! Validates system requirements before attempting to touch tracefs or load
//! eBPF programs. Provides clear, actionable error messages when requirements
//! aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::{Backend, Config};
use crate::domain::{BackendError, ConfigError};

/// Minimum kernel version for the BPF ring buffer
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run all pre-flight checks for the selected backend
///
/// # Errors
/// Returns [`ConfigError::InsufficientPrivilege`] when not root, and
/// [`BackendError::KernelTooOld`] or [`BackendError::ObjectNotFound`] when the
/// eBPF backend can't run here.
pub fn run_preflight_checks(config: &Config) -> Result<()> {
    check_privileges()?;
    if config.backend == Backend::Ebpf {
        check_kernel_version()?;
        check_bpf_object(&config.bpf_object)?;
    }
    Ok(())
}

/// Both backends need root: tracefs writes and BPF program loading
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }
    Err(ConfigError::InsufficientPrivilege.into())
}

fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // "Linux version 6.1.0-arch1-1 ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");
    check_kernel_release(release)?;
    Ok(())
}

/// Unparsable releases pass; only a known-old kernel is rejected
fn check_kernel_release(release: &str) -> Result<(), BackendError> {
    match parse_kernel_release(release) {
        Some((major, minor)) if (major, minor) < MIN_KERNEL_VERSION => Err(BackendError::KernelTooOld {
            major,
            minor,
            required_major: MIN_KERNEL_VERSION.0,
            required_minor: MIN_KERNEL_VERSION.1,
        }),
        _ => Ok(()),
    }
}

/// Extract `(major, minor)` from a release string like `5.15.0-91-generic`
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

fn check_bpf_object(path: &Path) -> Result<(), BackendError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(BackendError::ObjectNotFound(path.to_path_buf()))
    }
}
