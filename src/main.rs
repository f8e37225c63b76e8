mod cli;
mod engine;
mod model;
mod orchestrator;
mod presenter;
mod text_summary;
#[cfg(feature = "tui")]
mod tui;
mod workers;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Logs go to stderr outside the TUI, and to `--log-file` when given.
/// The TUI owns the terminal, so without a log file it logs nowhere.
fn init_tracing(args: &cli::Cli) -> Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("blurchain=info"))
    };

    if let Some(path) = args.log_file.as_deref() {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        let name = path.file_name().context("--log-file must name a file")?;
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(writer)
            .with_ansi(false)
            .init();
        return Ok(Some(guard));
    }

    if !args.is_tui() && !args.silent {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(None)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_silent = args.silent;
    let is_non_tui = !args.is_tui();
    let log_guard = init_tracing(&args)?;

    let res = cli::run(args).await;
    // Flush buffered logs; process::exit below skips destructors.
    drop(log_guard);

    match res {
        Ok(()) => {
            // Explicitly exit with code 0 on success, especially for non-TUI modes
            if is_non_tui {
                std::process::exit(0);
            }
            Ok(())
        }
        Err(e) => {
            if is_silent {
                println!("{}", e);
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
