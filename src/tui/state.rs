use crate::engine::Snapshot;
use crate::model::{ChainId, DeviceState, ImageRef, StageInfo, StageStatus};
use crate::orchestrator::{AppEvent, ChainReport, ViewUpdate};
use crate::presenter::{ViewState, Visibility};
use ratatui::style::Color;

/// Finished chains shown on the History tab.
const HISTORY_MAX: usize = 50;

pub struct UiState {
    pub tab: usize,
    pub info: String,
    pub image: Option<String>,
    pub blur_level: u32,
    pub device: DeviceState,

    pub view: ViewUpdate,
    // Every stage of the newest chain, in chain order.
    pub stages: Vec<StageInfo>,
    pub output: Option<ImageRef>,

    pub history: Vec<ChainReport>,
    pub history_selected: usize, // Index of selected history item (0 = most recent)
    pub last_exported_path: Option<String>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: 0,
            info: String::new(),
            image: None,
            blur_level: 1,
            device: DeviceState::default(),
            view: ViewUpdate {
                state: ViewState::Idle,
                visibility: Visibility {
                    progress: false,
                    cancel: false,
                    go: true,
                    see_file: false,
                },
                outcome: None,
            },
            stages: Vec::new(),
            output: None,
            history: Vec::new(),
            history_selected: 0,
            last_exported_path: None,
        }
    }
}

impl UiState {
    pub fn newest_chain(&self) -> Option<ChainId> {
        self.stages.first().map(|s| s.chain)
    }

    /// Fraction of the newest chain's stages that have finished.
    pub fn progress(&self) -> f64 {
        if self.stages.is_empty() {
            return 0.0;
        }
        let done = self
            .stages
            .iter()
            .filter(|s| s.status.is_finished())
            .count();
        done as f64 / self.stages.len() as f64
    }

    /// The report the dashboard refers to: selected on History, newest elsewhere.
    pub fn current_report(&self) -> Option<&ChainReport> {
        if self.tab == 1 {
            self.history.get(self.history_selected)
        } else {
            self.history.first()
        }
    }
}

pub fn status_color(status: StageStatus) -> Color {
    match status {
        StageStatus::Enqueued => Color::Gray,
        StageStatus::Running => Color::Yellow,
        StageStatus::Succeeded => Color::Green,
        StageStatus::Failed => Color::Red,
        StageStatus::Cancelled => Color::Magenta,
    }
}

fn newest_chain_stages(snap: &Snapshot) -> Vec<StageInfo> {
    let Some(newest) = snap.first().map(|s| s.chain) else {
        return Vec::new();
    };
    snap.iter().filter(|s| s.chain == newest).cloned().collect()
}

pub fn apply_event(state: &mut UiState, ev: AppEvent) {
    match ev {
        AppEvent::View(view) => state.view = view,
        AppEvent::Stages(snap) => state.stages = newest_chain_stages(&snap),
        AppEvent::Device(device) => state.device = device,
        AppEvent::Info(msg) => state.info = msg,
        AppEvent::OutputReady(output) => state.output = Some(output),
        AppEvent::ChainFinished(processed) => {
            if !processed.export_messages.is_empty() {
                state.info = processed.export_messages.join("; ");
            }
            state.history.insert(0, processed.report);
            state.history.truncate(HISTORY_MAX);
            if state.tab == 1 {
                state.history_selected = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StageKind, WorkData};
    use crate::orchestrator::ProcessedChain;

    fn stage(chain: u64, kind: StageKind, status: StageStatus) -> StageInfo {
        StageInfo {
            id: format!("{chain}-{kind:?}"),
            chain: ChainId(chain),
            kind,
            status,
            tags: Default::default(),
            output: WorkData::default(),
            error: None,
            started_utc: None,
            finished_utc: None,
            duration_ms: None,
        }
    }

    #[test]
    fn stages_keep_only_newest_chain() {
        let mut state = UiState::default();
        apply_event(
            &mut state,
            AppEvent::Stages(vec![
                stage(2, StageKind::Cleanup, StageStatus::Succeeded),
                stage(2, StageKind::Blur, StageStatus::Running),
                stage(2, StageKind::Save, StageStatus::Enqueued),
                stage(1, StageKind::Save, StageStatus::Cancelled),
            ]),
        );
        assert_eq!(state.newest_chain(), Some(ChainId(2)));
        assert_eq!(state.stages.len(), 3);
        assert!((state.progress() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn finished_chains_go_to_history_newest_first() {
        let mut state = UiState::default();
        for chain in 1..=2 {
            let report = ChainReport {
                chain: ChainId(chain),
                status: StageStatus::Succeeded,
                output: None,
                error: None,
                finished_utc: String::new(),
                stages: vec![],
            };
            apply_event(
                &mut state,
                AppEvent::ChainFinished(Box::new(ProcessedChain {
                    report,
                    export_messages: vec!["Exported JSON: x.json".into()],
                })),
            );
        }
        assert_eq!(state.history[0].chain, ChainId(2));
        assert_eq!(state.current_report().map(|r| r.chain), Some(ChainId(2)));
        assert_eq!(state.info, "Exported JSON: x.json");
    }

    #[test]
    fn empty_state_has_no_progress() {
        let state = UiState::default();
        assert_eq!(state.progress(), 0.0);
        assert!(state.view.visibility.go);
    }
}
