use crate::model::{DeviceState, RunConfig, StageInfo, StageStatus};
use crate::orchestrator::{run_controller, AppEvent, ChainReport, UiCommand};
use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "blurchain",
    version,
    about = "Chain cleanup, blur and save stages over an image, with optional TUI"
)]
pub struct Cli {
    /// Image to blur (path or file:// URI)
    pub image: Option<String>,

    /// How many times to blur the image
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=3))]
    pub blur_level: u32,

    /// Directory saved images are written to
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Scratch directory for intermediate blur output
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Artificial delay before each stage does its work
    #[arg(long, default_value = "3s")]
    pub stage_delay: humantime::Duration,

    /// Gaussian blur sigma applied per blur stage
    #[arg(long, default_value_t = 10.0)]
    pub blur_sigma: f32,

    /// Start as if the device were unplugged (the save stage waits for power)
    #[arg(long)]
    pub on_battery: bool,

    /// Start as if storage were low (the save stage waits for space)
    #[arg(long)]
    pub storage_low: bool,

    /// Finished chains kept for observation
    #[arg(long, default_value_t = 20)]
    pub history_limit: usize,

    /// Print the chain report as JSON and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print stage progress and a text summary, then exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors
    #[arg(long)]
    pub silent: bool,

    /// Export the finished chain report as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Write logs to this file (TUI mode logs nowhere otherwise)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Start blurring as soon as the TUI opens
    #[arg(long)]
    pub go: bool,
}

impl Cli {
    pub fn is_tui(&self) -> bool {
        cfg!(feature = "tui") && !self.json && !self.text && !self.silent
    }
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    if args.json {
        return run_json(args).await;
    }

    if !args.text {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
    }

    run_text(args).await
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("blurchain")
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> Result<RunConfig> {
    let image = match args.image.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) if s.contains("://") => Some(s.to_string()),
        Some(s) => {
            let path = PathBuf::from(s);
            let path = if path.is_absolute() {
                path
            } else {
                std::env::current_dir()
                    .context("get current directory")?
                    .join(path)
            };
            Some(
                crate::model::ImageRef::from_path(&path)
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| s.to_string()),
            )
        }
    };
    let data_dir = default_data_dir();
    Ok(RunConfig {
        image,
        blur_level: args.blur_level,
        output_dir: args
            .output_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("output")),
        temp_dir: args
            .temp_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("blur_filter_outputs")),
        stage_delay: Duration::from(args.stage_delay),
        blur_sigma: args.blur_sigma,
        history_limit: args.history_limit,
        device: DeviceState {
            charging: !args.on_battery,
            storage_low: args.storage_low,
        },
    })
}

/// Run one chain to completion under the controller, feeding events to `on_event`.
/// Ctrl-C cancels the chain; the report of the chain is returned once it settles.
async fn run_one_chain(
    args: &Cli,
    mut on_event: impl FnMut(&AppEvent),
) -> Result<Option<ChainReport>> {
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<AppEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let ctrl_args = args.clone();
    let ctrl =
        tokio::spawn(async move { run_controller(&ctrl_args, true, evt_tx, cmd_rx).await });

    let mut report = None;
    let mut started = false;
    let mut cancel_sent = false;
    loop {
        tokio::select! {
            ev = evt_rx.recv() => {
                let Some(ev) = ev else { break };
                on_event(&ev);
                match ev {
                    AppEvent::View(ref v) if !started => {
                        if v.visibility.go {
                            // Nothing was submitted; there is no chain to wait for.
                            let _ = cmd_tx.send(UiCommand::Quit);
                        } else {
                            started = true;
                        }
                    }
                    AppEvent::ChainFinished(p) => {
                        report = Some(p.report);
                        let _ = cmd_tx.send(UiCommand::Quit);
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                cancel_sent = true;
                let _ = cmd_tx.send(UiCommand::Cancel);
            }
        }
    }

    ctrl.await.context("controller task failed")??;
    Ok(report)
}

fn require_success(report: Option<ChainReport>) -> Result<ChainReport> {
    let report = report.context("no chain was run (is an image selected?)")?;
    if !report.succeeded() {
        let detail = report.error.as_deref().unwrap_or("");
        anyhow::bail!("blur chain {:?} {detail}", report.status);
    }
    Ok(report)
}

async fn run_json(args: Cli) -> Result<()> {
    let silent = args.silent;
    let (out_tx, out_handle) = if silent {
        (None, None)
    } else {
        let (tx, handle) = spawn_output_writer();
        (Some(tx), Some(handle))
    };

    let report = run_one_chain(&args, |_| {}).await?;

    if let (Some(tx), Some(r)) = (out_tx.as_ref(), report.as_ref()) {
        let out = serde_json::to_string_pretty(r)?;
        let _ = tx.send(OutputLine::Stdout(out));
    }
    if let Some(tx) = out_tx {
        drop(tx);
    }
    if let Some(handle) = out_handle {
        let _ = handle.await;
    }

    require_success(report).map(|_| ())
}

async fn run_text(args: Cli) -> Result<()> {
    let (out_tx, out_handle) = spawn_output_writer();
    // Last status printed per stage id.
    let mut printed: HashMap<String, StageStatus> = HashMap::new();
    let mut device: Option<DeviceState> = None;

    let report = run_one_chain(&args, |ev| match ev {
        AppEvent::Stages(snap) => {
            let Some(newest) = snap.first().map(|s| s.chain) else {
                return;
            };
            for stage in snap.iter().filter(|s| s.chain == newest) {
                if printed.get(&stage.id) != Some(&stage.status) {
                    printed.insert(stage.id.clone(), stage.status);
                    let _ = out_tx.send(OutputLine::Stderr(stage_line(stage, device.as_ref())));
                }
            }
        }
        AppEvent::Device(d) => device = Some(*d),
        AppEvent::Info(m) => {
            let _ = out_tx.send(OutputLine::Stderr(m.clone()));
        }
        AppEvent::OutputReady(r) => {
            let _ = out_tx.send(OutputLine::Stderr(format!("Output: {r}")));
        }
        AppEvent::ChainFinished(p) => {
            for m in &p.export_messages {
                let _ = out_tx.send(OutputLine::Stderr(m.clone()));
            }
            for line in crate::text_summary::build_text_summary(&p.report).lines {
                let _ = out_tx.send(OutputLine::Stdout(line));
            }
        }
        AppEvent::View(_) => {}
    })
    .await;

    drop(out_tx);
    let _ = out_handle.await;
    require_success(report?).map(|_| ())
}

fn stage_line(stage: &StageInfo, device: Option<&DeviceState>) -> String {
    let mut line = format!("== {:?}: {:?} ==", stage.kind, stage.status);
    if stage.status == StageStatus::Enqueued && stage.kind == crate::model::StageKind::Save {
        if let Some(d) = device {
            let waiting = crate::model::Constraints {
                requires_charging: true,
                requires_storage_not_low: true,
            }
            .unmet(d);
            if !waiting.is_empty() {
                line.push_str(&format!(" (waiting for {})", waiting.join(", ")));
            }
        }
    }
    if let Some(e) = stage.error.as_deref().filter(|e| !e.is_empty()) {
        line.push_str(&format!(" {e}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let args = Cli::parse_from(["blurchain"]);
        let cfg = build_config(&args).unwrap();
        assert_eq!(cfg.image, None);
        assert_eq!(cfg.blur_level, 1);
        assert_eq!(cfg.stage_delay, Duration::from_secs(3));
        assert_eq!(cfg.history_limit, 20);
        assert_eq!(cfg.device, DeviceState::default());
        assert!(cfg.output_dir.ends_with("output"));
    }

    #[cfg(unix)]
    #[test]
    fn bare_image_path_becomes_file_uri() {
        let args = Cli::parse_from(["blurchain", "/tmp/cat.png", "--on-battery", "--storage-low"]);
        let cfg = build_config(&args).unwrap();
        assert_eq!(cfg.image.as_deref(), Some("file:///tmp/cat.png"));
        assert!(!cfg.device.charging);
        assert!(cfg.device.storage_low);

        let args = Cli::parse_from(["blurchain", "file:///x/y.jpg"]);
        assert_eq!(
            build_config(&args).unwrap().image.as_deref(),
            Some("file:///x/y.jpg")
        );
    }

    #[test]
    fn blur_level_is_bounded() {
        assert!(Cli::try_parse_from(["blurchain", "--blur-level", "0"]).is_err());
        assert!(Cli::try_parse_from(["blurchain", "--blur-level", "4"]).is_err());
        assert!(Cli::try_parse_from(["blurchain", "--blur-level", "3"]).is_ok());
    }

    #[tokio::test]
    async fn silent_requires_json() {
        let args = Cli::parse_from(["blurchain", "--silent"]);
        assert!(run(args).await.is_err());
    }

    #[tokio::test]
    async fn text_mode_without_image_fails() {
        let dir = tempfile::tempdir().unwrap();
        let args = Cli::parse_from([
            "blurchain",
            "--text",
            "--temp-dir",
            dir.path().to_str().unwrap(),
            "--output-dir",
            dir.path().to_str().unwrap(),
        ]);
        let report = run_one_chain(&args, |_| {}).await.unwrap();
        assert!(report.is_none());
        assert!(require_success(report).is_err());
    }
}
