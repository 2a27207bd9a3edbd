//! # Tracing Session
//!
//! Drives `source → normalizer → store` until a stop condition, then tears
//! the source down and renders exactly one final report.
//!
//! ```text
//! loop {
//!     select! (biased) {
//!         SIGINT / SIGTERM / --duration  → stop
//!         SIGUSR1                        → interim report
//!         source.next_batch()            → normalize + record
//!     }
//! }
//! drain_remaining → teardown → final report
//! ```
//!
//! Signals are only observed between batches, so the store is never touched
//! from signal context and a report always sees whole batches.

use anyhow::{anyhow, Context, Result};
use log::{debug, info, trace, warn};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};

use crate::backend::EventSource;
use crate::config::Config;
use crate::domain::NormalizationError;
use crate::normalize::{Normalizer, RawRecord};
use crate::report::{self, ReportOptions};
use crate::resolver::Resolver;
use crate::store::AggregationStore;

/// Why the ingestion loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    Terminated,
    DurationElapsed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupted => "interrupted",
            Self::Terminated => "terminated",
            Self::DurationElapsed => "duration limit reached",
        })
    }
}

/// Per-run record counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub records: u64,
    pub recorded: u64,
    pub malformed: u64,
    pub unparsable: u64,
    pub ignored: u64,
}

impl IngestStats {
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.malformed + self.unparsable + self.ignored
    }
}

/// Outcome of [`Session::run`]
#[derive(Debug, Clone, Copy)]
pub struct SessionSummary {
    pub reason: StopReason,
    pub elapsed: Duration,
    pub stats: IngestStats,
    pub tasks: usize,
    pub open_allocations: usize,
    pub dropped: Option<u64>,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {:.1}s, {} records ({} recorded, {} ignored, {} malformed, {} unparsable), {} tasks, {} open allocations",
            self.reason,
            self.elapsed.as_secs_f64(),
            self.stats.records,
            self.stats.recorded,
            self.stats.ignored,
            self.stats.malformed,
            self.stats.unparsable,
            self.tasks,
            self.open_allocations,
        )?;
        if let Some(dropped) = self.dropped {
            write!(f, ", {dropped} dropped in kernel")?;
        }
        Ok(())
    }
}

pub struct Session<R: Resolver> {
    normalizer: Normalizer,
    store: AggregationStore<R>,
    options: ReportOptions,
    stats: IngestStats,
}

impl<R: Resolver> Session<R> {
    #[must_use]
    pub fn new(resolver: R, page_size: u64, options: ReportOptions) -> Self {
        Self {
            normalizer: Normalizer::new(page_size),
            store: AggregationStore::new(resolver),
            options,
            stats: IngestStats::default(),
        }
    }

    /// Normalize and record a batch, leaving `batch` empty
    pub fn ingest(&mut self, batch: &mut Vec<RawRecord>) {
        for raw in batch.drain(..) {
            self.stats.records += 1;
            match self.normalizer.normalize(&raw) {
                Ok(event) => {
                    self.store.record(event);
                    self.stats.recorded += 1;
                }
                Err(NormalizationError::Ignored(reason)) => {
                    trace!("Ignoring record: {reason}");
                    self.stats.ignored += 1;
                }
                Err(e @ NormalizationError::Malformed(_)) => {
                    debug!("Skipping record: {e}");
                    self.stats.malformed += 1;
                }
                Err(e @ NormalizationError::Unparsable(_)) => {
                    debug!("Skipping record: {e}");
                    self.stats.unparsable += 1;
                }
            }
        }
    }

    /// Render the current state with the configured options
    ///
    /// # Errors
    /// Returns an error only if JSON serialization fails.
    pub fn report(&self) -> Result<String, serde_json::Error> {
        report::render(&self.store.snapshot(), &self.options)
    }

    #[must_use]
    pub fn store(&self) -> &AggregationStore<R> {
        &self.store
    }

    #[must_use]
    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Run until interrupted or `--duration` expires, then write the final report
    ///
    /// # Errors
    /// Returns an error if signal handlers can't be installed, reading the
    /// source fails, or the final report can't be written.
    pub async fn run(mut self, config: &Config, mut source: EventSource) -> Result<SessionSummary> {
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigusr1 =
            signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let deadline = async {
            match config.duration {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        info!("Tracing with {} backend; Ctrl+C to stop", source.name());
        let started = Instant::now();
        let mut batch: Vec<RawRecord> = Vec::new();

        let outcome = loop {
            tokio::select! {
                biased;
                _ = &mut ctrl_c => break Ok(StopReason::Interrupted),
                _ = sigterm.recv() => break Ok(StopReason::Terminated),
                () = &mut deadline => break Ok(StopReason::DurationElapsed),
                _ = sigusr1.recv() => {
                    info!("SIGUSR1: interim report");
                    if let Err(e) = self.report().map_err(anyhow::Error::from).and_then(|r| write_stdout(&r)) {
                        warn!("Interim report failed: {e:#}");
                    }
                }
                result = source.next_batch(&mut batch) => match result {
                    Ok(()) => self.ingest(&mut batch),
                    Err(e) => break Err(e),
                },
            }
        };

        source.drain_remaining(&mut batch);
        self.ingest(&mut batch);
        source.teardown();

        // Read failures exit with the generic code, not the startup one
        let reason = outcome.map_err(|e| anyhow!("Reading kernel events failed: {e}"))?;
        let dropped = source.dropped_records();
        if let Some(dropped) = dropped.filter(|d| *d > 0) {
            warn!("{dropped} records were dropped in the kernel (ring buffer full)");
        }

        let rendered = self.report().context("Failed to render report")?;
        match &config.output {
            Some(path) => write_file(path, &rendered)?,
            None => write_stdout(&rendered)?,
        }

        Ok(SessionSummary {
            reason,
            elapsed: started.elapsed(),
            stats: self.stats,
            tasks: self.store.task_count(),
            open_allocations: self.store.open_allocations(),
            dropped,
        })
    }
}

fn write_stdout(rendered: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(rendered.as_bytes()).context("Failed to write report")?;
    stdout.flush().context("Failed to write report")
}

fn write_file(path: &Path, rendered: &str) -> Result<()> {
    std::fs::write(path, rendered)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    info!("Report saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Domain, TaskId};
    use crate::resolver::{KernelResolver, KernelSymbols};

    fn session() -> (tempfile::TempDir, Session<KernelResolver>) {
        let proc_root = tempfile::tempdir().unwrap();
        let resolver = KernelResolver::with_proc_root(KernelSymbols::parse(""), proc_root.path());
        (proc_root, Session::new(resolver, 4096, ReportOptions::default()))
    }

    fn line(header: &str, stack: &[&str]) -> RawRecord {
        RawRecord::Text {
            header: header.to_string(),
            stack: stack.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_ingest_counts_every_outcome() {
        let (_proc, mut session) = session();
        let mut batch = vec![
            line("cat-7 [000] .... 1.0: kmalloc: ptr=ffff0000 bytes_alloc=128", &[" => f+0x1/0x2"]),
            line("cat-7 [000] .... 1.1: kfree: ptr=(null)", &[]),
            line("garbage", &[]),
            RawRecord::Binary(vec![0; 3]),
            line("cat-7 [000] .... 1.2: kfree: ptr=ffff0000", &[]),
        ];
        session.ingest(&mut batch);

        assert!(batch.is_empty());
        assert_eq!(
            session.stats(),
            IngestStats { records: 5, recorded: 2, malformed: 1, unparsable: 1, ignored: 1 }
        );
        assert_eq!(session.stats().skipped(), 3);

        let totals = session.store().totals(Domain::Slab);
        assert_eq!(totals.stats.bytes_peak, 128);
        assert_eq!(totals.stats.bytes_current, 0);
        assert_eq!(totals.stats.free_count, 1);
    }

    #[test]
    fn test_report_reflects_ingested_state() {
        let (_proc, mut session) = session();
        session.ingest(&mut vec![line(
            "cat-7 [000] .... 1.0: mm_page_alloc: page=0000000012345678 pfn=0x100 order=2 migratetype=0",
            &[" => __alloc_pages+0x10/0x20"],
        )]);

        let rendered = session.report().unwrap();
        assert!(rendered.contains("== page"));
        assert!(rendered.contains("[7] cat"));
        assert!(rendered.contains("__alloc_pages+0x10"));
        assert_eq!(session.store().open_allocation(Domain::Page, 0x100).unwrap().task_id, TaskId(7));
    }

    #[test]
    fn test_summary_line() {
        let summary = SessionSummary {
            reason: StopReason::DurationElapsed,
            elapsed: Duration::from_millis(1500),
            stats: IngestStats { records: 10, recorded: 8, ignored: 2, ..IngestStats::default() },
            tasks: 3,
            open_allocations: 4,
            dropped: Some(1),
        };
        assert_eq!(
            summary.to_string(),
            "duration limit reached: 1.5s, 10 records (8 recorded, 2 ignored, 0 malformed, 0 unparsable), 3 tasks, 4 open allocations, 1 dropped in kernel"
        );
    }
}
