//! Chain lifecycle controller.
//!
//! Owns the facade and the presenter, turns UI commands into facade calls and
//! forwards status snapshots and presenter effects to presentation layers.

use super::facade::BlurOrchestrator;
use super::post_process::{process_chain_completion, ProcessedChain};
use crate::cli::{build_config, Cli};
use crate::engine::{DeviceMonitor, LocalScheduler, Snapshot};
use crate::model::{ChainId, DeviceState, ImageRef, RunConfig};
use crate::presenter::{Effect, Presenter, TerminalOutcome, ViewState, Visibility};
use crate::workers::{WorkerRegistry, WorkerSettings};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

/// Commands emitted by UI layers.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Go(u32),
    Cancel,
    SetCharging(bool),
    SetStorageLow(bool),
    Quit,
}

/// What the presenter currently wants shown.
#[derive(Debug, Clone)]
pub(crate) struct ViewUpdate {
    pub state: ViewState,
    pub visibility: Visibility,
    pub outcome: Option<TerminalOutcome>,
}

impl ViewUpdate {
    fn of(presenter: &Presenter) -> Self {
        Self {
            state: presenter.state().clone(),
            visibility: presenter.visibility(),
            outcome: presenter.last_outcome().cloned(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum AppEvent {
    View(ViewUpdate),
    /// Every stage of the named chain, newest chain first.
    Stages(Snapshot),
    Device(DeviceState),
    Info(String),
    OutputReady(ImageRef),
    ChainFinished(Box<ProcessedChain>),
}

fn worker_settings(cfg: &RunConfig) -> WorkerSettings {
    WorkerSettings {
        temp_dir: cfg.temp_dir.clone(),
        output_dir: cfg.output_dir.clone(),
        stage_delay: cfg.stage_delay,
        blur_sigma: cfg.blur_sigma,
    }
}

/// Wire scheduler, workers and facade for one session.
fn build_facade(cfg: &RunConfig) -> Result<(BlurOrchestrator, DeviceMonitor)> {
    let device = DeviceMonitor::new(cfg.device);
    let workers = WorkerRegistry::builtin(&worker_settings(cfg));
    let scheduler = LocalScheduler::new(workers, device.clone())
        .context("start scheduler")?
        .with_history_limit(cfg.history_limit);
    let mut facade = BlurOrchestrator::new(Arc::new(scheduler));
    facade.set_image_input(cfg.image.as_deref());
    Ok((facade, device))
}

/// Drive the facade from UI commands and emit events back to presentation layers.
///
/// With `autostart`, a chain at the configured blur level is submitted right away.
pub(crate) async fn run_controller(
    args: &Cli,
    autostart: bool,
    event_tx: UnboundedSender<AppEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let cfg = build_config(args)?;
    let (mut facade, device) = build_facade(&cfg)?;
    let mut presenter = Presenter::new();
    let mut outputs = facade.output_status_stream();
    let mut stages = facade.chain_stages_stream();
    let mut reported: Option<ChainId> = None;

    let _ = event_tx.send(AppEvent::Device(device.current()));
    if facade.image_input().is_none() {
        let _ = event_tx.send(AppEvent::Info("No image selected.".into()));
    }
    if autostart {
        submit(&facade, &mut presenter, cfg.blur_level, &event_tx);
    }
    let _ = event_tx.send(AppEvent::View(ViewUpdate::of(&presenter)));

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::Go(level)) => {
                        submit(&facade, &mut presenter, level, &event_tx);
                        let _ = event_tx.send(AppEvent::View(ViewUpdate::of(&presenter)));
                    }
                    Some(UiCommand::Cancel) => {
                        facade.cancel_work();
                        for effect in presenter.cancel_requested() {
                            emit_effect(&mut facade, effect, &event_tx);
                        }
                    }
                    Some(UiCommand::SetCharging(on)) => {
                        device.set_charging(on);
                        let _ = event_tx.send(AppEvent::Device(device.current()));
                    }
                    Some(UiCommand::SetStorageLow(low)) => {
                        device.set_storage_low(low);
                        let _ = event_tx.send(AppEvent::Device(device.current()));
                    }
                    Some(UiCommand::Quit) | None => {
                        facade.cancel_work();
                        break;
                    }
                }
            }
            snap = outputs.recv() => {
                let Some(snap) = snap else { break };
                for effect in presenter.on_snapshot(&snap) {
                    emit_effect(&mut facade, effect, &event_tx);
                }
                let _ = event_tx.send(AppEvent::View(ViewUpdate::of(&presenter)));

                // Report each chain once, when its terminal stage settles.
                if let Some(head) = snap.first().filter(|h| h.status.is_finished()) {
                    if reported.map_or(true, |r| head.chain > r) {
                        reported = Some(head.chain);
                        debug!(chain = %head.chain, status = ?head.status, "chain settled");
                        let processed =
                            process_chain_completion(args, head, facade.stages_of(head.chain));
                        let _ = event_tx.send(AppEvent::ChainFinished(Box::new(processed)));
                    }
                }
            }
            snap = stages.recv() => {
                let Some(snap) = snap else { break };
                let _ = event_tx.send(AppEvent::Stages(snap));
            }
        }
    }

    Ok(())
}

fn submit(
    facade: &BlurOrchestrator,
    presenter: &mut Presenter,
    level: u32,
    event_tx: &UnboundedSender<AppEvent>,
) {
    match facade.apply_blur(level) {
        Ok(chain) => {
            presenter.submit(chain);
            let _ = event_tx.send(AppEvent::Info(format!("Blurring (level {level})…")));
        }
        Err(e) => {
            info!(error = %e, "blur not started");
            let _ = event_tx.send(AppEvent::Info(format!("Cannot start: {e}")));
        }
    }
}

fn emit_effect(
    facade: &mut BlurOrchestrator,
    effect: Effect,
    event_tx: &UnboundedSender<AppEvent>,
) {
    match effect {
        Effect::Notify(msg) => {
            let _ = event_tx.send(AppEvent::Info(msg));
        }
        Effect::OutputReady(output) => {
            facade.set_output_uri(output.as_str());
            let _ = event_tx.send(AppEvent::OutputReady(output));
        }
    }
}
