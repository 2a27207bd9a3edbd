//! Validated, immutable run configuration
//!
//! Built once from [`Args`] before anything touches the kernel, then passed
//! by reference to every component.

use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Args;
use crate::domain::{ConfigError, Domain};
use crate::report::ReportOptions;

/// Compiled eBPF object produced by `cargo xtask build-ebpf`
pub const DEFAULT_BPF_OBJECT: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/../target/bpfel-unknown-none/release/kmemtrack");

/// Which event source feeds the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Ebpf,
    Ftrace,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub backend: Backend,
    pub page: bool,
    pub slab: bool,
    pub report: ReportOptions,
    pub debug: bool,
    pub show_misc: bool,
    pub duration: Option<Duration>,
    pub output: Option<PathBuf>,
    pub tracefs: Option<PathBuf>,
    pub bpf_object: PathBuf,
}

impl Config {
    /// Validate parsed arguments
    ///
    /// # Errors
    /// Returns a [`ConfigError`] for an out-of-range throttle, both backends
    /// requested, or no domain selected.
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let backend = match (args.ebpf, args.ftrace) {
            (true, true) => return Err(ConfigError::ConflictingBackends),
            (_, true) => Backend::Ftrace,
            _ => Backend::Ebpf,
        };

        let throttle = u8::try_from(args.throttle)
            .ok()
            .filter(|t| *t <= 100)
            .ok_or(ConfigError::InvalidThrottle(args.throttle))?;

        if !args.page && !args.slab {
            return Err(ConfigError::NoDomainSelected);
        }

        Ok(Self {
            backend,
            page: args.page,
            slab: args.slab,
            report: ReportOptions {
                throttle,
                sort_key: args.sort_by,
                summary: args.summary,
                summary_by: args.summary_by,
                json: args.json,
                domains: Domain::ALL
                    .into_iter()
                    .filter(|d| match d {
                        Domain::Page => args.page,
                        Domain::Slab => args.slab,
                    })
                    .collect(),
            },
            debug: args.debug,
            show_misc: args.show_misc,
            duration: (args.duration > 0).then(|| Duration::from_secs(args.duration)),
            output: args.output.clone(),
            tracefs: args.tracefs.clone(),
            bpf_object: args.bpf_object.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_BPF_OBJECT)),
        })
    }

    #[must_use]
    pub fn tracks(&self, domain: Domain) -> bool {
        match domain {
            Domain::Page => self.page,
            Domain::Slab => self.slab,
        }
    }

    /// Selected domains, in report order
    pub fn domains(&self) -> impl Iterator<Item = Domain> + '_ {
        Domain::ALL.into_iter().filter(|d| self.tracks(*d))
    }
}
