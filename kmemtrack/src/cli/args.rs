//! CLI argument definitions

use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;

/// Ranking metric for report rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    /// Highest bytes ever held at once
    Peak,
    /// Bytes still allocated
    Alloc,
}

impl SortKey {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SortKey::Peak => "peak",
            SortKey::Alloc => "alloc",
        }
    }
}

/// Grouping used by `--summary`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryBy {
    /// One row per task and domain
    Task,
    /// One row per domain
    Domain,
}

impl SummaryBy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SummaryBy::Task => "task",
            SummaryBy::Domain => "domain",
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "kmemtrack",
    version,
    about = "Attribute kernel page and slab allocations to call stacks and tasks",
    after_help = "\
EXAMPLES:
    sudo kmemtrack --page --slab                 Trace both allocators until Ctrl+C
    sudo kmemtrack --slab --throttle 5 --json    Only stacks holding >= 5% of slab peak
    sudo kmemtrack --ftrace --page --summary     Per-task page summary via tracefs

Send SIGUSR1 to print an interim report without stopping."
)]
pub struct Args {
    /// Capture events with eBPF tracepoint programs (default)
    #[arg(long)]
    pub ebpf: bool,

    /// Capture events through a private tracefs instance
    #[arg(long)]
    pub ftrace: bool,

    /// Track page allocator events
    #[arg(long)]
    pub page: bool,

    /// Track slab allocator events
    #[arg(long)]
    pub slab: bool,

    /// Hide rows below N percent of their domain total (0-100)
    #[arg(long, value_name = "N", default_value_t = 0, allow_negative_numbers = true)]
    pub throttle: i64,

    /// Ranking metric for report rows
    #[arg(long, value_enum, default_value_t = SortKey::Peak)]
    pub sort_by: SortKey,

    /// Collapse call stacks into per-task (or per-domain) rows
    #[arg(long)]
    pub summary: bool,

    /// Grouping used by --summary
    #[arg(long, value_enum, default_value_t = SummaryBy::Task)]
    pub summary_by: SummaryBy,

    /// Emit the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Print a slab cache summary from /proc/slabinfo before tracing
    #[arg(long)]
    pub show_misc: bool,

    /// Stop after N seconds (0 = until interrupted)
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    pub duration: u64,

    /// Write the final report to FILE instead of stdout
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// tracefs mount point (auto-detected if omitted)
    #[arg(long, value_name = "DIR")]
    pub tracefs: Option<PathBuf>,

    /// Compiled eBPF object to load
    #[arg(long, value_name = "FILE")]
    pub bpf_object: Option<PathBuf>,
}
