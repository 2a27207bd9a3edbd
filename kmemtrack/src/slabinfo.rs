//! Slab cache usage summary (`--show-misc`)
//!
//! Parses `/proc/slabinfo` (format version 2.x) and prints the caches holding
//! the most memory right now, as a baseline before tracing starts.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;

pub const SLABINFO_PATH: &str = "/proc/slabinfo";

/// Caches shown in the summary
const TOP_CACHES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabCache {
    pub name: String,
    pub active_objs: u64,
    pub num_objs: u64,
    pub obj_size: u64,
    pub pages_per_slab: u64,
    pub num_slabs: u64,
}

impl SlabCache {
    /// Bytes occupied by live objects
    #[must_use]
    pub fn active_bytes(&self) -> u64 {
        self.active_objs.saturating_mul(self.obj_size)
    }

    /// Bytes of pages backing the cache
    #[must_use]
    pub fn total_bytes(&self, page_size: u64) -> u64 {
        self.num_slabs.saturating_mul(self.pages_per_slab).saturating_mul(page_size)
    }
}

/// Parse the contents of `/proc/slabinfo`; malformed lines are skipped
#[must_use]
pub fn parse(content: &str) -> Vec<SlabCache> {
    content
        .lines()
        .filter(|line| !line.starts_with("slabinfo") && !line.starts_with('#'))
        .filter_map(parse_line)
        .collect()
}

// name active_objs num_objs objsize objperslab pagesperslab : tunables .. : slabdata active_slabs num_slabs sharedavail
fn parse_line(line: &str) -> Option<SlabCache> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 6 {
        return None;
    }
    let slabdata = fields.iter().position(|f| *f == "slabdata")?;
    Some(SlabCache {
        name: fields[0].to_string(),
        active_objs: fields[1].parse().ok()?,
        num_objs: fields[2].parse().ok()?,
        obj_size: fields[3].parse().ok()?,
        pages_per_slab: fields[5].parse().ok()?,
        num_slabs: fields.get(slabdata + 2)?.parse().ok()?,
    })
}

/// Render the largest caches as a table
#[must_use]
pub fn render_summary(caches: &[SlabCache], page_size: u64) -> String {
    let mut sorted: Vec<&SlabCache> = caches.iter().collect();
    sorted.sort_by(|a, b| {
        b.total_bytes(page_size).cmp(&a.total_bytes(page_size)).then_with(|| a.name.cmp(&b.name))
    });

    let total: u64 = caches.iter().map(|c| c.total_bytes(page_size)).sum();
    let mut out = String::new();
    let _ = writeln!(out, "Slab usage: {} caches, {} bytes total", caches.len(), total);
    let _ = writeln!(out, "{:<28} {:>14} {:>14} {:>10}", "CACHE", "TOTAL", "ACTIVE", "OBJSIZE");
    for cache in sorted.into_iter().take(TOP_CACHES) {
        let _ = writeln!(
            out,
            "{:<28} {:>14} {:>14} {:>10}",
            cache.name,
            cache.total_bytes(page_size),
            cache.active_bytes(),
            cache.obj_size
        );
    }
    out
}

/// Read and summarize the slab caches
///
/// # Errors
/// Returns an error if `path` cannot be read (it is root-only on most systems).
pub fn summarize(path: &Path, page_size: u64) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(render_summary(&parse(&content), page_size))
}
