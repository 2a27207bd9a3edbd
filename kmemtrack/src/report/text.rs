//! Plain text report output
//!
//! ```text
//! == page (sorted by peak, throttle 0%) ==
//! total: 8192 bytes
//! [1234] bash: current 4096, peak 8192, allocs 2, frees 1, implicit 0
//!     __alloc_pages+0x1a
//!     do_anonymous_page+0x80
//! unmatched frees 0, implicit frees 0, open allocations 1
//! ```

use std::fmt::Write as _;

use super::{DomainReport, Report, Row};

pub fn render(report: &Report) -> String {
    let mut out = String::new();
    for (i, domain) in report.domains.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        render_domain(&mut out, report, domain);
    }
    out
}

fn render_domain(out: &mut String, report: &Report, domain: &DomainReport) {
    let _ = write!(
        out,
        "== {} (sorted by {}, throttle {}%",
        domain.domain,
        report.sort_by.as_str(),
        report.throttle
    );
    if let Some(by) = report.summary_by {
        let _ = write!(out, ", summary by {}", by.as_str());
    }
    let _ = writeln!(out, ") ==");
    let _ = writeln!(out, "total: {} bytes", domain.total_bytes);

    for row in &domain.rows {
        render_row(out, row);
    }

    let rec = &domain.reconciliation;
    let _ = writeln!(
        out,
        "unmatched frees {}, implicit frees {}, open allocations {}",
        rec.unmatched_frees, rec.implicit_frees, rec.open_allocations
    );
}

fn render_row(out: &mut String, row: &Row) {
    match (row.task_id, &row.task_name) {
        (Some(id), Some(name)) => {
            let _ = write!(out, "[{}] {name}: ", id.0);
        }
        _ => {
            let _ = write!(out, "{}: ", row.domain);
        }
    }
    let _ = write!(
        out,
        "current {}, peak {}, allocs {}, frees {}, implicit {}",
        row.bytes_current, row.bytes_peak, row.alloc_count, row.free_count, row.implicit_frees
    );
    if let Some(misses) = row.misses {
        let _ = write!(out, ", misses {misses}");
    }
    out.push('\n');
    for frame in &row.call_path {
        let _ = writeln!(out, "    {frame}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::SortKey;
    use crate::domain::{Domain, TaskId};
    use crate::report::Reconciliation;

    fn row() -> Row {
        Row {
            task_id: Some(TaskId(1234)),
            task_name: Some("bash".to_string()),
            domain: Domain::Page,
            call_path: vec!["__alloc_pages+0x1a".to_string(), "do_anonymous_page+0x80".to_string()],
            bytes_current: 4096,
            bytes_peak: 8192,
            alloc_count: 2,
            free_count: 1,
            implicit_frees: 0,
            misses: None,
        }
    }

    #[test]
    fn test_render_stack_row() {
        let report = Report {
            sort_by: SortKey::Peak,
            throttle: 0,
            summary_by: None,
            domains: vec![DomainReport {
                domain: Domain::Page,
                total_bytes: 8192,
                rows: vec![row()],
                reconciliation: Reconciliation {
                    unmatched_frees: 0,
                    implicit_frees: 0,
                    open_allocations: 1,
                },
            }],
        };
        let expected = "\
== page (sorted by peak, throttle 0%) ==
total: 8192 bytes
[1234] bash: current 4096, peak 8192, allocs 2, frees 1, implicit 0
    __alloc_pages+0x1a
    do_anonymous_page+0x80
unmatched frees 0, implicit frees 0, open allocations 1
";
        assert_eq!(render(&report), expected);
    }

    #[test]
    fn test_render_domain_summary_row() {
        let mut out = String::new();
        render_row(
            &mut out,
            &Row { task_id: None, task_name: None, call_path: Vec::new(), misses: Some(3), ..row() },
        );
        assert_eq!(out, "page: current 4096, peak 8192, allocs 2, frees 1, implicit 0, misses 3\n");
    }
}
