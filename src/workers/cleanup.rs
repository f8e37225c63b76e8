use super::{sleep_unless_cancelled, WorkContext, WorkError, Worker, WorkerSettings};
use crate::model::WorkData;
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

/// Removes intermediate PNGs left in the scratch directory by earlier runs.
pub struct CleanupWorker {
    settings: WorkerSettings,
}

impl CleanupWorker {
    pub fn new(settings: WorkerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Worker for CleanupWorker {
    async fn do_work(&self, ctx: WorkContext) -> Result<WorkData, WorkError> {
        info!(stage = %ctx.stage_id, "Cleaning up old temporary files");
        if !sleep_unless_cancelled(self.settings.stage_delay, &ctx.cancel).await {
            return Err(WorkError::Cancelled);
        }

        let dir = self.settings.temp_dir.clone();
        let removed = tokio::task::spawn_blocking(move || remove_pngs(&dir)).await??;
        debug!(removed, "cleanup finished");
        Ok(WorkData::default())
    }
}

fn remove_pngs(dir: &Path) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_png = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("png"));
        if path.is_file() && is_png {
            std::fs::remove_file(&path)?;
            debug!(path = %path.display(), "deleted");
            removed += 1;
        }
    }
    Ok(removed)
}
