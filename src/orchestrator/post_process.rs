//! Post-chain processing utilities.
//!
//! Builds the chain report once the terminal stage settles and handles the
//! optional JSON export.

use crate::cli::Cli;
use crate::engine::Snapshot;
use crate::model::{now_rfc3339, ChainId, ImageRef, StageInfo, StageStatus};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Serializable record of one finished chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChainReport {
    pub chain: ChainId,
    pub status: StageStatus,
    pub output: Option<ImageRef>,
    pub error: Option<String>,
    pub finished_utc: String,
    pub stages: Vec<StageInfo>,
}

impl ChainReport {
    pub fn succeeded(&self) -> bool {
        self.status == StageStatus::Succeeded
    }
}

/// Result of post-chain processing, ready for presentation layers.
#[derive(Debug, Clone)]
pub(crate) struct ProcessedChain {
    pub report: ChainReport,
    pub export_messages: Vec<String>,
}

pub(crate) fn build_report(terminal: &StageInfo, stages: Snapshot) -> ChainReport {
    ChainReport {
        chain: terminal.chain,
        status: terminal.status,
        output: terminal.output.image_uri(),
        error: terminal.error.clone().filter(|e| !e.is_empty()),
        finished_utc: terminal.finished_utc.clone().unwrap_or_else(now_rfc3339),
        stages,
    }
}

/// Build the report for a finished chain and export it if requested.
pub(crate) fn process_chain_completion(
    args: &Cli,
    terminal: &StageInfo,
    stages: Snapshot,
) -> ProcessedChain {
    let report = build_report(terminal, stages);

    let mut export_messages = Vec::new();
    if let Some(export_path) = args.export_json.as_deref() {
        match export_json(export_path, &report) {
            Ok(_) => export_messages.push(format!("Exported JSON: {}", export_path.display())),
            Err(e) => export_messages.push(format!("Export JSON failed: {e:#}")),
        }
    }

    ProcessedChain {
        report,
        export_messages,
    }
}

pub(crate) fn export_json(path: &Path, report: &ChainReport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report).context("serialize chain report")?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StageKind, WorkData, KEY_IMAGE_URI};
    use clap::Parser;

    fn save_stage(status: StageStatus) -> StageInfo {
        StageInfo {
            id: "s".into(),
            chain: ChainId(4),
            kind: StageKind::Save,
            status,
            tags: ["OUTPUT".to_string()].into(),
            output: WorkData::default().with_string(KEY_IMAGE_URI, "file:///out.png"),
            error: Some(String::new()),
            started_utc: None,
            finished_utc: Some("2026-01-01T00:00:00Z".into()),
            duration_ms: Some(12),
        }
    }

    #[test]
    fn report_reflects_terminal_stage() {
        let save = save_stage(StageStatus::Succeeded);
        let report = build_report(&save, vec![save.clone()]);
        assert!(report.succeeded());
        assert_eq!(report.chain, ChainId(4));
        assert_eq!(report.output.as_ref().map(ImageRef::as_str), Some("file:///out.png"));
        assert_eq!(report.error, None);
        assert_eq!(report.finished_utc, "2026-01-01T00:00:00Z");
    }

    #[test]
    fn exports_json_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.json");
        let args = Cli::parse_from([
            "blurchain",
            "--export-json",
            path.to_str().unwrap(),
        ]);

        let save = save_stage(StageStatus::Cancelled);
        let processed = process_chain_completion(&args, &save, vec![save.clone()]);
        assert_eq!(processed.export_messages.len(), 1);
        assert!(processed.export_messages[0].starts_with("Exported JSON"));

        let back: ChainReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.status, StageStatus::Cancelled);
        assert_eq!(back.stages.len(), 1);
    }

    #[test]
    fn no_export_without_flag() {
        let args = Cli::parse_from(["blurchain"]);
        let save = save_stage(StageStatus::Succeeded);
        assert!(process_chain_completion(&args, &save, vec![])
            .export_messages
            .is_empty());
    }
}
