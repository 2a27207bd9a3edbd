//! # kmemtrack - Main Entry Point
//!
//! Validates options, prepares the process, starts the selected event source
//! and hands it to a [`Session`] until SIGINT, SIGTERM or `--duration`.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use std::path::Path;

use kmemtrack::backend::EventSource;
use kmemtrack::cli::Args;
use kmemtrack::config::{Backend, Config};
use kmemtrack::domain::{BackendError, ConfigError};
use kmemtrack::preflight::run_preflight_checks;
use kmemtrack::resolver::{KernelResolver, KernelSymbols};
use kmemtrack::session::Session;
use kmemtrack::{slabinfo, tuning};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_INVALID_THROTTLE: i32 = 3;
const EXIT_CONFLICTING_BACKENDS: i32 = 4;
const EXIT_NO_DOMAIN: i32 = 5;
const EXIT_BACKEND_INIT: i32 = 6;
const EXIT_NOPERM: i32 = 77;

fn main() {
    // clap exits with 2 on usage errors, 0 for --help/--version
    let args = Args::try_parse().unwrap_or_else(|e| e.exit());
    init_logging(args.debug);

    std::process::exit(match run(&args) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    });
}

/// `warn` by default, `--debug` for our own targets, `RUST_LOG` wins
fn init_logging(debug: bool) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Warn);
    if debug {
        builder.filter_module("kmemtrack", LevelFilter::Debug);
    }
    builder.parse_default_env();
    builder.init();
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(config_err) = err.downcast_ref::<ConfigError>() {
        return match config_err {
            ConfigError::InvalidThrottle(_) => EXIT_INVALID_THROTTLE,
            ConfigError::ConflictingBackends => EXIT_CONFLICTING_BACKENDS,
            ConfigError::NoDomainSelected => EXIT_NO_DOMAIN,
            ConfigError::InsufficientPrivilege => EXIT_NOPERM,
        };
    }
    if let Some(backend_err) = err.downcast_ref::<BackendError>() {
        return if backend_err.is_permission_denied() { EXIT_NOPERM } else { EXIT_BACKEND_INIT };
    }
    EXIT_ERROR
}

#[tokio::main(flavor = "current_thread")]
async fn run(args: &Args) -> Result<()> {
    let config = Config::from_args(args)?;
    run_preflight_checks(&config)?;

    info!("kmemtrack v{}", env!("CARGO_PKG_VERSION"));
    tuning::apply();
    let page_size = tuning::page_size();

    if config.show_misc {
        match slabinfo::summarize(Path::new(slabinfo::SLABINFO_PATH), page_size) {
            Ok(summary) => eprint!("{summary}"),
            Err(e) => warn!("{e:#}"),
        }
    }

    // ftrace hands us symbolized frames already
    let symbols = match config.backend {
        Backend::Ebpf => KernelSymbols::load().unwrap_or_else(|e| {
            warn!("{e:#}; stacks will show raw addresses");
            KernelSymbols::default()
        }),
        Backend::Ftrace => KernelSymbols::default(),
    };

    let source = EventSource::init(&config)
        .with_context(|| format!("Failed to start {} backend", backend_name(config.backend)))?;
    let session = Session::new(KernelResolver::new(symbols), page_size, config.report.clone());
    let summary = session.run(&config, source).await?;

    eprintln!("\n{summary}");
    Ok(())
}

fn backend_name(backend: Backend) -> &'static str {
    match backend {
        Backend::Ebpf => "eBPF",
        Backend::Ftrace => "ftrace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&ConfigError::InvalidThrottle(200).into()), EXIT_INVALID_THROTTLE);
        assert_eq!(exit_code_for(&ConfigError::ConflictingBackends.into()), EXIT_CONFLICTING_BACKENDS);
        assert_eq!(exit_code_for(&ConfigError::NoDomainSelected.into()), EXIT_NO_DOMAIN);
        assert_eq!(exit_code_for(&ConfigError::InsufficientPrivilege.into()), EXIT_NOPERM);
        assert_eq!(exit_code_for(&anyhow::anyhow!("something else")), EXIT_ERROR);
    }

    #[test]
    fn test_backend_exit_codes_survive_context() {
        let missing: anyhow::Error = BackendError::MissingTracepoint("kmalloc".to_string()).into();
        assert_eq!(exit_code_for(&missing.context("Failed to start ftrace backend")), EXIT_BACKEND_INIT);

        let denied = BackendError::tracefs(
            "create",
            "/sys/kernel/tracing/instances/kmemtrack",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert_eq!(exit_code_for(&denied.into()), EXIT_NOPERM);

        let no_object: anyhow::Error =
            BackendError::ObjectNotFound("/opt/kmemtrack/kmemtrack".into()).into();
        assert_eq!(exit_code_for(&no_object), EXIT_BACKEND_INIT);

        let old_kernel: anyhow::Error =
            BackendError::KernelTooOld { major: 4, minor: 19, required_major: 5, required_minor: 8 }.into();
        assert_eq!(exit_code_for(&old_kernel.context("Preflight failed")), EXIT_BACKEND_INIT);
    }
}
