//! Structured error types for kmemtrack
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! `main` downcasts to these to pick the process exit code.

use std::path::PathBuf;
use thiserror::Error;

/// Invalid command line or environment, detected before any tracing starts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--throttle expects an integer between 0 and 100, got {0}")]
    InvalidThrottle(i64),

    #[error("Can't have --ftrace and --ebpf set together")]
    ConflictingBackends,

    #[error("At least one of --page or --slab is required")]
    NoDomainSelected,

    #[error("Permission denied: kmemtrack requires root privileges (run with sudo)")]
    InsufficientPrivilege,
}

/// The chosen event source could not be set up or failed while running
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to load eBPF object {path}: {source}")]
    EbpfLoadFailed {
        path: PathBuf,
        #[source]
        source: aya::EbpfError,
    },

    #[error(
        "eBPF object not found: {}\n\n\
         Build it with: cargo xtask build-ebpf\n\
         or point --bpf-object at a prebuilt object, or use --ftrace.",
        .0.display()
    )]
    ObjectNotFound(PathBuf),

    #[error(
        "Kernel version {major}.{minor} is too old.\n\n\
         The eBPF backend requires Linux {required_major}.{required_minor} or newer \
         for ring buffer support.\nUse --ftrace on this kernel."
    )]
    KernelTooOld { major: u32, minor: u32, required_major: u32, required_minor: u32 },

    #[error("Program {0} not found in eBPF object")]
    ProgramNotFound(String),

    #[error("Failed to attach {program} to kmem/{tracepoint}: {source}")]
    AttachFailed {
        program: String,
        tracepoint: String,
        #[source]
        source: aya::programs::ProgramError,
    },

    #[error("Map {0} not found in eBPF object")]
    MapNotFound(&'static str),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error("tracefs not found (tried {0}); mount it or pass --tracefs")]
    TracefsNotFound(String),

    #[error("Tracepoint kmem/{0} is not available on this kernel")]
    MissingTracepoint(String),

    #[error("Unexpected format for kmem/{event}: {reason}")]
    BadFormat { event: String, reason: String },

    #[error("Failed to {action} {}: {source}", path.display())]
    Tracefs {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Helper for the many tracefs file operations
    pub fn tracefs(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Tracefs { action, path: path.into(), source }
    }

    /// True when the kernel refused an operation for lack of privilege
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Tracefs { source, .. } | Self::Io(source) => {
                source.kind() == std::io::ErrorKind::PermissionDenied
            }
            _ => false,
        }
    }
}

/// A raw record that cannot become an allocation event
///
/// Never fatal: the session counts these and moves on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("malformed binary record: {0}")]
    Malformed(String),

    #[error("unparsable trace record: {0}")]
    Unparsable(String),

    #[error("record ignored: {0}")]
    Ignored(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidThrottle(150);
        assert_eq!(err.to_string(), "--throttle expects an integer between 0 and 100, got 150");
        assert!(ConfigError::ConflictingBackends.to_string().contains("--ftrace"));
    }

    #[test]
    fn test_tracefs_error_mentions_path() {
        let err = BackendError::tracefs(
            "write",
            "/sys/kernel/tracing/tracing_on",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(err.to_string().contains("/sys/kernel/tracing/tracing_on"));
        assert!(err.is_permission_denied());
    }

    #[test]
    fn test_preflight_backend_errors() {
        let err = BackendError::ObjectNotFound(PathBuf::from("/nonexistent/kmemtrack"));
        assert!(err.to_string().starts_with("eBPF object not found: /nonexistent/kmemtrack"));

        let err = BackendError::KernelTooOld { major: 4, minor: 19, required_major: 5, required_minor: 8 };
        assert!(err.to_string().starts_with("Kernel version 4.19 is too old."));
        assert!(err.to_string().contains("Linux 5.8 or newer"));
        assert!(!err.is_permission_denied());
    }

    #[test]
    fn test_missing_tracepoint_is_not_permission() {
        let err = BackendError::MissingTracepoint("kmalloc_node".to_string());
        assert!(!err.is_permission_denied());
        assert!(err.to_string().contains("kmem/kmalloc_node"));
    }
}
