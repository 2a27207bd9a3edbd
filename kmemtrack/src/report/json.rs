//! JSON report output

use super::Report;

/// Pretty-printed JSON, one object per report
pub fn render(report: &Report) -> Result<String, serde_json::Error> {
    let mut out = serde_json::to_string_pretty(report)?;
    out.push('\n');
    Ok(out)
}
