use super::{sleep_unless_cancelled, WorkContext, WorkError, Worker, WorkerSettings};
use crate::model::{ImageRef, WorkData, KEY_IMAGE_URI};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use tracing::info;

const TITLE: &str = "Blurred-Image";

/// Copies the final blurred image into the output directory under a dated name.
pub struct SaveImageWorker {
    settings: WorkerSettings,
}

impl SaveImageWorker {
    pub fn new(settings: WorkerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Worker for SaveImageWorker {
    async fn do_work(&self, ctx: WorkContext) -> Result<WorkData, WorkError> {
        let source = ctx
            .input
            .image_uri()
            .ok_or(WorkError::MissingInput(KEY_IMAGE_URI))?;
        let src_path = source
            .to_file_path()
            .ok_or_else(|| WorkError::NotLocal(source.to_string()))?;

        info!(stage = %ctx.stage_id, "Saving image");
        if !sleep_unless_cancelled(self.settings.stage_delay, &ctx.cancel).await {
            return Err(WorkError::Cancelled);
        }

        let output_dir = self.settings.output_dir.clone();
        let saved =
            tokio::task::spawn_blocking(move || save_copy(&src_path, &output_dir)).await??;
        info!(path = %saved.display(), "Saved image");

        let out = ImageRef::from_path(&saved)
            .ok_or_else(|| WorkError::NotLocal(saved.display().to_string()))?;
        Ok(WorkData::default().with_string(KEY_IMAGE_URI, out.as_str()))
    }
}

fn save_copy(src: &Path, output_dir: &Path) -> Result<PathBuf, WorkError> {
    std::fs::create_dir_all(output_dir)?;
    let output_dir = std::fs::canonicalize(output_dir)?;

    let stamp = time::OffsetDateTime::now_local()
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc())
        .format(format_description!(
            "[year].[month].[day]-at-[hour].[minute].[second]"
        ))
        .unwrap_or_else(|_| "now".into());
    let ext = src
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png")
        .to_string();

    let mut dest = output_dir.join(format!("{TITLE}-{stamp}.{ext}"));
    let mut n = 1;
    while dest.exists() {
        dest = output_dir.join(format!("{TITLE}-{stamp}-{n}.{ext}"));
        n += 1;
    }
    std::fs::copy(src, &dest)?;
    Ok(dest)
}
