use super::{sleep_unless_cancelled, WorkContext, WorkError, Worker, WorkerSettings};
use crate::model::{ImageRef, WorkData, KEY_IMAGE_URI};
use async_trait::async_trait;
use rand::RngCore;
use std::path::{Path, PathBuf};
use tracing::info;

/// Gaussian-blurs the image named by `KEY_IMAGE_URI` into the scratch directory.
pub struct BlurWorker {
    settings: WorkerSettings,
}

impl BlurWorker {
    pub fn new(settings: WorkerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Worker for BlurWorker {
    async fn do_work(&self, ctx: WorkContext) -> Result<WorkData, WorkError> {
        let source = ctx
            .input
            .image_uri()
            .ok_or(WorkError::MissingInput(KEY_IMAGE_URI))?;
        let src_path = source
            .to_file_path()
            .ok_or_else(|| WorkError::NotLocal(source.to_string()))?;

        info!(stage = %ctx.stage_id, input = %source, "Blurring image");
        if !sleep_unless_cancelled(self.settings.stage_delay, &ctx.cancel).await {
            return Err(WorkError::Cancelled);
        }

        let temp_dir = self.settings.temp_dir.clone();
        let sigma = self.settings.blur_sigma;
        let out_path =
            tokio::task::spawn_blocking(move || blur_to_temp(&src_path, &temp_dir, sigma))
                .await??;

        let out = ImageRef::from_path(&out_path)
            .ok_or_else(|| WorkError::NotLocal(out_path.display().to_string()))?;
        Ok(WorkData::default().with_string(KEY_IMAGE_URI, out.as_str()))
    }
}

fn blur_to_temp(src: &Path, temp_dir: &Path, sigma: f32) -> Result<PathBuf, WorkError> {
    let img = image::open(src)?;
    let blurred = if sigma > 0.0 { img.blur(sigma) } else { img };

    std::fs::create_dir_all(temp_dir)?;
    let temp_dir = std::fs::canonicalize(temp_dir)?;
    let out = temp_dir.join(format!("blur-filter-output-{}.png", random_suffix()));
    blurred.save(&out)?;
    Ok(out)
}

fn random_suffix() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{:016x}", u64::from_le_bytes(b))
}
