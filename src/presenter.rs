//! Presentation state machine.
//!
//! Folds status snapshots from the output stream into `Idle`, `InProgress` or
//! `Finished`, and yields the side effects a view should perform. Effects are
//! only produced on transitions, so re-delivered snapshots are harmless.

use crate::engine::Snapshot;
use crate::model::{ChainId, ImageRef, StageStatus};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ViewState {
    Idle,
    InProgress,
    Finished { output: ImageRef },
}

/// How the most recent chain ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TerminalOutcome {
    Succeeded,
    /// Succeeded but did not report an output image.
    SucceededWithoutOutput,
    Failed { error: Option<String> },
    Cancelled,
}

impl TerminalOutcome {
    pub fn label(&self) -> String {
        match self {
            TerminalOutcome::Succeeded => "completed".into(),
            TerminalOutcome::SucceededWithoutOutput => "completed without output".into(),
            TerminalOutcome::Failed { error: Some(e) } => format!("failed: {e}"),
            TerminalOutcome::Failed { error: None } => "failed".into(),
            TerminalOutcome::Cancelled => "cancelled".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Notify(String),
    OutputReady(ImageRef),
}

/// Which controls a view should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Visibility {
    pub progress: bool,
    pub cancel: bool,
    pub go: bool,
    pub see_file: bool,
}

#[derive(Debug)]
pub struct Presenter {
    state: ViewState,
    output: Option<ImageRef>,
    last_outcome: Option<TerminalOutcome>,
    // Chain of the latest submit; snapshots headed by older chains are stale.
    awaiting: Option<ChainId>,
}

impl Default for Presenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Presenter {
    pub fn new() -> Self {
        Self {
            state: ViewState::Idle,
            output: None,
            last_outcome: None,
            awaiting: None,
        }
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn last_outcome(&self) -> Option<&TerminalOutcome> {
        self.last_outcome.as_ref()
    }

    /// The user started `chain`. Anything older can no longer end the run.
    pub fn submit(&mut self, chain: ChainId) {
        self.awaiting = Some(self.awaiting.map_or(chain, |c| c.max(chain)));
        self.state = ViewState::InProgress;
    }

    /// The user asked to cancel. The chain itself reports `Cancelled` later.
    pub fn cancel_requested(&mut self) -> Vec<Effect> {
        vec![Effect::Notify("Cancelled.".into())]
    }

    pub fn on_snapshot(&mut self, snapshot: &Snapshot) -> Vec<Effect> {
        let Some(head) = snapshot.first() else {
            return Vec::new();
        };
        if self.awaiting.is_some_and(|current| head.chain < current) {
            return Vec::new();
        }

        if !head.status.is_finished() {
            self.state = ViewState::InProgress;
            return Vec::new();
        }

        let output = head.output.image_uri();
        let outcome = match (head.status, &output) {
            (StageStatus::Succeeded, Some(_)) => TerminalOutcome::Succeeded,
            (StageStatus::Succeeded, None) => TerminalOutcome::SucceededWithoutOutput,
            (StageStatus::Cancelled, _) => TerminalOutcome::Cancelled,
            _ => TerminalOutcome::Failed {
                error: head.error.clone().filter(|e| !e.is_empty()),
            },
        };
        self.last_outcome = Some(outcome);

        match output.filter(|_| head.status == StageStatus::Succeeded) {
            Some(output) => {
                if self.state == (ViewState::Finished { output: output.clone() }) {
                    return Vec::new();
                }
                self.output = Some(output.clone());
                self.state = ViewState::Finished {
                    output: output.clone(),
                };
                vec![
                    Effect::Notify("Completed.".into()),
                    Effect::OutputReady(output),
                ]
            }
            None => {
                self.state = ViewState::Idle;
                Vec::new()
            }
        }
    }

    pub fn visibility(&self) -> Visibility {
        match self.state {
            ViewState::Idle => Visibility {
                progress: false,
                cancel: false,
                go: true,
                see_file: false,
            },
            ViewState::InProgress => Visibility {
                progress: true,
                cancel: true,
                go: false,
                see_file: false,
            },
            ViewState::Finished { .. } => Visibility {
                progress: false,
                cancel: false,
                go: true,
                see_file: true,
            },
        }
    }

    /// The output of the last successful chain, for "open result".
    pub fn open_result(&self) -> Option<&ImageRef> {
        self.output.as_ref()
    }
}
