//! Domain model for kmemtrack
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod event;
pub mod types;

// Re-export common types for convenience
pub use event::{AllocEvent, EventKind, RawFrames};
pub use types::{CallStack, Domain, TaskId};

pub use errors::{BackendError, ConfigError, NormalizationError};
