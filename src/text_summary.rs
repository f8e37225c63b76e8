//! Text summary builder for CLI output.
//!
//! Formats a finished chain report as human-readable lines for text mode.

use crate::orchestrator::ChainReport;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn fmt_duration(ms: Option<u64>) -> String {
    match ms {
        Some(ms) if ms >= 1000 => format!("{:.1} s", ms as f64 / 1000.0),
        Some(ms) => format!("{ms} ms"),
        None => "-".into(),
    }
}

/// Build a text summary from a finished chain report.
pub(crate) fn build_text_summary(report: &ChainReport) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!("Chain: {} ({:?})", report.chain, report.status));
    for (i, stage) in report.stages.iter().enumerate() {
        lines.push(format!(
            "  {}. {:<8} {:<10} {}",
            i + 1,
            format!("{:?}", stage.kind),
            format!("{:?}", stage.status),
            fmt_duration(stage.duration_ms)
        ));
    }

    let total: u64 = report.stages.iter().filter_map(|s| s.duration_ms).sum();
    lines.push(format!("Total stage time: {}", fmt_duration(Some(total))));

    if let Some(err) = report.error.as_deref() {
        lines.push(format!("Error: {err}"));
    }
    match (&report.output, report.output.as_ref().and_then(|o| o.to_file_path())) {
        (_, Some(path)) => lines.push(format!("Output: {}", path.display())),
        (Some(uri), None) => lines.push(format!("Output: {uri}")),
        (None, None) => {}
    }

    TextSummary { lines }
}
