use crate::orchestrator::ChainReport;
use anyhow::{Context, Result};
use std::sync::mpsc as std_mpsc;
use std::sync::OnceLock;
use std::time::Duration;

use super::state::UiState;

// Global clipboard manager channel - initialized once on first use
static CLIPBOARD_SENDER: OnceLock<std_mpsc::Sender<String>> = OnceLock::new();

/// Export a chain report as JSON into the current directory.
/// Returns the absolute path of the exported file.
pub fn export_report_json(r: &ChainReport) -> Result<std::path::PathBuf> {
    let default_name = format!(
        "blurchain-{}-{}.json",
        r.chain,
        r.finished_utc.replace(':', "-").replace('T', "_")
    );

    let current_dir = std::env::current_dir().context("get current directory")?;
    let path = current_dir.join(default_name);
    crate::orchestrator::export_json(&path, r)?;
    Ok(path)
}

/// Export the report the user is looking at and update state.info.
pub fn export_and_show_path(state: &mut UiState) {
    let Some(r) = state.current_report() else {
        state.info = "No finished chain to export yet.".into();
        return;
    };
    match export_report_json(r) {
        Ok(p) => {
            state.last_exported_path = Some(p.to_string_lossy().to_string());
            state.info = format!("Exported JSON: {}", p.display());
        }
        Err(e) => {
            state.info = format!("JSON export failed: {e:#}");
        }
    }
}

/// Copy the blurred output's path for "open result".
pub fn copy_output_path(state: &mut UiState) {
    let Some(output) = state.output.as_ref() else {
        state.info = "No blurred image yet. Press 'g' to start.".into();
        return;
    };
    let text = output
        .to_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| output.to_string());
    match copy_to_clipboard(&text) {
        Ok(_) => {
            let display_path = if text.chars().count() > 60 {
                let tail: String = text
                    .chars()
                    .rev()
                    .take(57)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                format!("...{tail}")
            } else {
                text
            };
            state.info = format!("✓ Copied to clipboard: {}", display_path);
        }
        Err(e) => {
            state.info = format!("Clipboard copy failed: {e:#}");
        }
    }
}

/// Initialize the clipboard manager thread if not already initialized.
/// Each clipboard instance is kept alive briefly so clipboard managers on
/// Linux get a chance to read it.
fn init_clipboard_manager() -> Result<&'static std_mpsc::Sender<String>> {
    CLIPBOARD_SENDER.get_or_init(|| {
        let (tx, rx) = std_mpsc::channel::<String>();

        std::thread::spawn(move || {
            use arboard::Clipboard;

            for text in rx {
                if let Ok(mut clipboard) = Clipboard::new() {
                    if clipboard.set_text(&text).is_ok() {
                        std::thread::sleep(Duration::from_secs(2));
                    }
                }
            }
        });

        tx
    });

    CLIPBOARD_SENDER
        .get()
        .ok_or_else(|| anyhow::anyhow!("Failed to initialize clipboard manager"))
}

/// Queue `text` for the clipboard without blocking the UI thread.
pub fn copy_to_clipboard(text: &str) -> Result<()> {
    let sender = init_clipboard_manager()?;
    sender
        .send(text.to_string())
        .map_err(|_| anyhow::anyhow!("Clipboard manager channel closed"))?;
    Ok(())
}
