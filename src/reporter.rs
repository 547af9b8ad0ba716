use serde::Serialize;

use crate::types::ProgressReport;

/// Emit a progress report as a single JSON line to stdout.
pub fn report_progress(report: &ProgressReport) {
    if let Some(line) = to_line(report) {
        println!("{line}");
    }
}

/// Emit any serializable summary as pretty-printed JSON to stdout.
pub fn report_summary<T: Serialize>(summary: &T) {
    if let Ok(json) = serde_json::to_string_pretty(summary) {
        println!("{json}");
    }
}

fn to_line(report: &ProgressReport) -> Option<String> {
    serde_json::to_string(report).ok()
}
