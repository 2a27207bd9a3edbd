//! Task names from `/proc`

use std::path::Path;

use crate::domain::TaskId;

/// Command name of a task, if it still exists
///
/// Thread ids resolve too: `/proc/<tid>` is reachable even though it is not
/// listed. Falls back to `/proc/<tid>/stat` when `comm` can't be read.
#[must_use]
pub fn read_task_name(proc_root: &Path, task_id: TaskId) -> Option<String> {
    let dir = proc_root.join(task_id.0.to_string());
    if let Ok(comm) = std::fs::read_to_string(dir.join("comm")) {
        let comm = comm.trim_end_matches('\n');
        if !comm.is_empty() {
            return Some(comm.to_string());
        }
    }
    let stat = std::fs::read_to_string(dir.join("stat")).ok()?;
    extract_comm(&stat).map(ToString::to_string)
}

/// Placeholder name for tasks that exited before they could be looked up
#[must_use]
pub fn unknown_task_name(task_id: TaskId) -> String {
    format!("[pid {}]", task_id.0)
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ..."
fn extract_comm(stat_line: &str) -> Option<&str> {
    let open = stat_line.find('(')?;
    let close = stat_line.rfind(')')?;
    (open < close).then(|| &stat_line[open + 1..close])
}
