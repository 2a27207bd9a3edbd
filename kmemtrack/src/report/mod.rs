//! # Report Rendering
//!
//! Builds a [`Report`] from a store [`Snapshot`] and formats it as text or
//! JSON. Both formats carry the same rows and the same reconciliation
//! trailer.
//!
//! ## Row selection
//!
//! Per domain:
//!
//! 1. Build rows: one per (task, call stack), or pre-aggregated per task or
//!    per domain in summary mode
//! 2. Metric = `bytes_peak` (`--sort-by peak`) or `bytes_current` (`alloc`)
//! 3. Domain total = sum of the metric over all rows
//! 4. Keep a row if throttle is 0, or `metric * 100 >= throttle * total`
//! 5. Sort by metric descending, then call path, then task id

mod json;
mod text;

use serde::Serialize;

use crate::cli::{SortKey, SummaryBy};
use crate::domain::{Domain, TaskId};
use crate::store::{Snapshot, Stats};

/// How a snapshot is turned into a report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOptions {
    /// Percent of the domain total a row needs to be shown (0-100)
    pub throttle: u8,
    pub sort_key: SortKey,
    pub summary: bool,
    pub summary_by: SummaryBy,
    pub json: bool,
    /// Domains to report, in order
    pub domains: Vec<Domain>,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            throttle: 0,
            sort_key: SortKey::Peak,
            summary: false,
            summary_by: SummaryBy::Task,
            json: false,
            domains: Domain::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub sort_by: SortKey,
    pub throttle: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_by: Option<SummaryBy>,
    pub domains: Vec<DomainReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainReport {
    pub domain: Domain,
    /// Sum of the ranking metric over every row, before throttling
    pub total_bytes: u64,
    pub rows: Vec<Row>,
    pub reconciliation: Reconciliation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Row {
    /// Absent for per-domain summaries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    pub domain: Domain,
    /// Innermost frame first; empty for summaries
    pub call_path: Vec<String>,
    pub bytes_current: u64,
    pub bytes_peak: u64,
    pub alloc_count: u64,
    pub free_count: u64,
    pub implicit_frees: u64,
    /// Unmatched frees, only reported on summary rows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub misses: Option<u64>,
}

impl Row {
    fn new(task: Option<(TaskId, &str)>, domain: Domain, call_path: Vec<String>, stats: &Stats) -> Self {
        Self {
            task_id: task.map(|(id, _)| id),
            task_name: task.map(|(_, name)| name.to_string()),
            domain,
            call_path,
            bytes_current: stats.bytes_current,
            bytes_peak: stats.bytes_peak,
            alloc_count: stats.alloc_count,
            free_count: stats.free_count,
            implicit_frees: stats.implicit_frees,
            misses: None,
        }
    }

    #[must_use]
    pub fn metric(&self, sort_key: SortKey) -> u64 {
        match sort_key {
            SortKey::Peak => self.bytes_peak,
            SortKey::Alloc => self.bytes_current,
        }
    }
}

/// Allocation/free matching health for one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub unmatched_frees: u64,
    pub implicit_frees: u64,
    pub open_allocations: u64,
}

/// Build the report model
#[must_use]
pub fn build(snapshot: &Snapshot, options: &ReportOptions) -> Report {
    Report {
        sort_by: options.sort_key,
        throttle: options.throttle,
        summary_by: options.summary.then_some(options.summary_by),
        domains: options.domains.iter().map(|d| build_domain(snapshot, *d, options)).collect(),
    }
}

fn build_domain(snapshot: &Snapshot, domain: Domain, options: &ReportOptions) -> DomainReport {
    let rows = collect_rows(snapshot, domain, options);
    let total_bytes = rows.iter().map(|r| r.metric(options.sort_key)).fold(0u64, u64::saturating_add);

    let mut rows: Vec<Row> = rows
        .into_iter()
        .filter(|row| passes_throttle(row.metric(options.sort_key), total_bytes, options.throttle))
        .collect();
    rows.sort_by(|a, b| {
        b.metric(options.sort_key)
            .cmp(&a.metric(options.sort_key))
            .then_with(|| a.call_path.cmp(&b.call_path))
            .then_with(|| a.task_id.cmp(&b.task_id))
    });

    let totals = snapshot.totals(domain);
    DomainReport {
        domain,
        total_bytes,
        rows,
        reconciliation: Reconciliation {
            unmatched_frees: totals.unmatched_frees,
            implicit_frees: totals.stats.implicit_frees,
            open_allocations: totals.open_allocations,
        },
    }
}

fn collect_rows(snapshot: &Snapshot, domain: Domain, options: &ReportOptions) -> Vec<Row> {
    let nodes = snapshot.tasks.iter().flat_map(|task| {
        task.domains
            .iter()
            .filter(move |node| node.domain == domain)
            .map(move |node| (task, node))
    });

    if !options.summary {
        return nodes
            .flat_map(|(task, node)| {
                node.stacks.iter().map(move |(stack, stats)| {
                    Row::new(Some((task.task_id, task.name.as_str())), domain, stack.frames().to_vec(), stats)
                })
            })
            .collect();
    }

    match options.summary_by {
        SummaryBy::Task => nodes
            .map(|(task, node)| Row {
                misses: Some(node.misses),
                ..Row::new(Some((task.task_id, task.name.as_str())), domain, Vec::new(), &node.totals)
            })
            .collect(),
        SummaryBy::Domain => {
            let totals = snapshot.totals(domain);
            vec![Row {
                misses: Some(totals.unmatched_frees),
                ..Row::new(None, domain, Vec::new(), &totals.stats)
            }]
        }
    }
}

/// `metric / total >= throttle / 100`, in integers
#[must_use]
pub fn passes_throttle(metric: u64, total: u64, throttle: u8) -> bool {
    throttle == 0
        || (total > 0 && u128::from(metric) * 100 >= u128::from(throttle) * u128::from(total))
}

/// Render a snapshot in the configured format
///
/// # Errors
/// Returns an error only if JSON serialization fails.
pub fn render(snapshot: &Snapshot, options: &ReportOptions) -> Result<String, serde_json::Error> {
    let report = build(snapshot, options);
    if options.json {
        json::render(&report)
    } else {
        Ok(text::render(&report))
    }
}
