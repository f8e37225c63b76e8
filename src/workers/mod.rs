//! Stage implementations run by the local scheduler.

mod blur;
mod cleanup;
mod save;

pub use blur::BlurWorker;
pub use cleanup::CleanupWorker;
pub use save::SaveImageWorker;

use crate::model::{StageKind, WorkData};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("input is missing {0}")]
    MissingInput(&'static str),

    #[error("not a local file: {0}")]
    NotLocal(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("no worker registered for {0:?}")]
    Unregistered(StageKind),

    #[error("stage cancelled")]
    Cancelled,
}

/// Everything a worker gets to see about the stage it runs.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub stage_id: String,
    pub input: WorkData,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Worker: Send + Sync {
    async fn do_work(&self, ctx: WorkContext) -> Result<WorkData, WorkError>;
}

/// Shared knobs for the built-in workers.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Scratch directory for intermediate blur output.
    pub temp_dir: PathBuf,
    /// Final destination for saved images.
    pub output_dir: PathBuf,
    /// Artificial per-stage delay so progress is visible.
    pub stage_delay: Duration,
    pub blur_sigma: f32,
}

/// Maps stage kinds to the workers that run them.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<StageKind, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cleanup, Blur and Save backed by the filesystem.
    pub fn builtin(settings: &WorkerSettings) -> Self {
        Self::new()
            .register(StageKind::Cleanup, CleanupWorker::new(settings.clone()))
            .register(StageKind::Blur, BlurWorker::new(settings.clone()))
            .register(StageKind::Save, SaveImageWorker::new(settings.clone()))
    }

    pub fn register(mut self, kind: StageKind, worker: impl Worker + 'static) -> Self {
        self.workers.insert(kind, Arc::new(worker));
        self
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn Worker>> {
        self.workers.get(&kind).cloned()
    }
}

/// Sleep for the configured stage delay unless cancelled first.
/// Returns `false` if the stage was cancelled while waiting.
pub(crate) async fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::model::KEY_IMAGE_URI;

    /// Worker that appends its name to the incoming image locator, if any.
    pub struct EchoWorker {
        pub name: &'static str,
        pub delay: Duration,
    }

    impl EchoWorker {
        pub fn new(name: &'static str) -> Self {
            Self {
                name,
                delay: Duration::ZERO,
            }
        }

        pub fn slow(name: &'static str, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(name)
            }
        }
    }

    #[async_trait]
    impl Worker for EchoWorker {
        async fn do_work(&self, ctx: WorkContext) -> Result<WorkData, WorkError> {
            if !sleep_unless_cancelled(self.delay, &ctx.cancel).await {
                return Err(WorkError::Cancelled);
            }
            let Some(prev) = ctx.input.get_string(KEY_IMAGE_URI) else {
                return Ok(WorkData::default());
            };
            Ok(WorkData::default().with_string(KEY_IMAGE_URI, format!("{prev}+{}", self.name)))
        }
    }

    pub struct FailingWorker;

    #[async_trait]
    impl Worker for FailingWorker {
        async fn do_work(&self, _ctx: WorkContext) -> Result<WorkData, WorkError> {
            Err(WorkError::MissingInput(KEY_IMAGE_URI))
        }
    }

    /// Worker that always reports it was cancelled.
    pub struct StoppedWorker;

    #[async_trait]
    impl Worker for StoppedWorker {
        async fn do_work(&self, _ctx: WorkContext) -> Result<WorkData, WorkError> {
            Err(WorkError::Cancelled)
        }
    }

    pub fn echo_registry() -> WorkerRegistry {
        WorkerRegistry::new()
            .register(StageKind::Cleanup, EchoWorker::new("cleanup"))
            .register(StageKind::Blur, EchoWorker::new("blur"))
            .register(StageKind::Save, EchoWorker::new("save"))
    }
}
