//! Event sources
//!
//! Both backends produce [`RawRecord`]s in batches and hide everything else
//! about the kernel interface. Exactly one is active per run.

mod ebpf;
mod ftrace;

pub use ebpf::EbpfSource;
pub use ftrace::{FtraceSource, TraceFramer, INSTANCE_NAME};

use log::{debug, info};

use crate::config::{Backend, Config};
use crate::domain::BackendError;
use crate::normalize::RawRecord;
use crate::tracefs::Tracefs;

pub enum EventSource {
    Ebpf(EbpfSource),
    Ftrace(FtraceSource),
}

impl EventSource {
    /// Set up the backend selected in `config`
    ///
    /// # Errors
    /// Returns a [`BackendError`] if tracefs can't be found or the backend
    /// fails to initialize. Anything set up before the failure is undone.
    pub fn init(config: &Config) -> Result<Self, BackendError> {
        let tracefs = Tracefs::locate(config.tracefs.as_deref())?;
        let source = match config.backend {
            Backend::Ebpf => Self::Ebpf(EbpfSource::init(config, &tracefs)?),
            Backend::Ftrace => Self::Ftrace(FtraceSource::init(config, &tracefs)?),
        };
        info!("Event source ready: {} (tracefs at {})", source.name(), tracefs.root().display());
        Ok(source)
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ebpf(_) => "ebpf",
            Self::Ftrace(_) => "ftrace",
        }
    }

    /// Wait for kernel readiness and append the next batch to `out`
    ///
    /// # Errors
    /// Returns a [`BackendError`] if reading from the kernel fails.
    pub async fn next_batch(&mut self, out: &mut Vec<RawRecord>) -> Result<(), BackendError> {
        match self {
            Self::Ebpf(source) => source.next_batch(out).await,
            Self::Ftrace(source) => source.next_batch(out).await,
        }
    }

    /// Collect what is already buffered, without waiting
    pub fn drain_remaining(&mut self, out: &mut Vec<RawRecord>) {
        match self {
            Self::Ebpf(source) => source.drain_remaining(out),
            Self::Ftrace(source) => source.drain_remaining(out),
        }
    }

    /// Records lost in the kernel, when the backend can tell
    #[must_use]
    pub fn dropped_records(&self) -> Option<u64> {
        match self {
            Self::Ebpf(source) => match source.dropped_records() {
                Ok(dropped) => Some(dropped),
                Err(e) => {
                    debug!("Could not read drop counter: {e}");
                    None
                }
            },
            Self::Ftrace(_) => None,
        }
    }

    /// Detach from the kernel; safe to call more than once
    pub fn teardown(&mut self) {
        match self {
            Self::Ebpf(source) => source.teardown(),
            Self::Ftrace(source) => source.teardown(),
        }
    }
}
