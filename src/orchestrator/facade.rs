//! Blur orchestration facade.
//!
//! Turns "blur this image N times" into a named chain on the injected
//! scheduler and exposes the streams the presentation layer observes.

use crate::engine::{
    ChainError, ChainSpec, ExistingWorkPolicy, Snapshot, StageSpec, StatusStream, WorkQuery,
    WorkScheduler,
};
use crate::model::{ChainId, Constraints, ImageRef, StageKind, WorkData, KEY_IMAGE_URI};
use std::sync::Arc;
use tracing::info;

/// Unique name every blur chain is registered under.
pub const IMAGE_MANIPULATION_WORK_NAME: &str = "image_manipulation_work";

/// Tag carried by the terminal Save stage.
pub const TAG_OUTPUT: &str = "OUTPUT";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlurError {
    #[error("no image selected")]
    MissingInput,

    #[error("blur level must be at least 1")]
    InvalidLevel,

    #[error(transparent)]
    Chain(#[from] ChainError),
}

pub struct BlurOrchestrator {
    scheduler: Arc<dyn WorkScheduler>,
    image_uri: Option<ImageRef>,
    output_uri: Option<ImageRef>,
}

impl BlurOrchestrator {
    pub fn new(scheduler: Arc<dyn WorkScheduler>) -> Self {
        Self {
            scheduler,
            image_uri: None,
            output_uri: None,
        }
    }

    pub fn set_image_input(&mut self, uri: Option<&str>) {
        self.image_uri = uri.and_then(ImageRef::parse);
    }

    pub fn image_input(&self) -> Option<&ImageRef> {
        self.image_uri.as_ref()
    }

    pub fn set_output_uri(&mut self, uri: &str) {
        self.output_uri = ImageRef::parse(uri);
    }

    pub fn output_uri(&self) -> Option<&ImageRef> {
        self.output_uri.as_ref()
    }

    /// Cleanup, `level` blurs, then a tagged Save gated on charging and storage.
    pub fn build_chain(&self, level: u32) -> Result<ChainSpec, BlurError> {
        let input = self.image_uri.as_ref().ok_or(BlurError::MissingInput)?;
        if level == 0 {
            return Err(BlurError::InvalidLevel);
        }

        let mut stages = Vec::with_capacity(level as usize + 2);
        stages.push(StageSpec::new(StageKind::Cleanup));
        for i in 0..level {
            let blur = StageSpec::new(StageKind::Blur);
            // Later blurs take the previous blur's output.
            stages.push(if i == 0 {
                blur.with_input(WorkData::default().with_string(KEY_IMAGE_URI, input.as_str()))
            } else {
                blur
            });
        }
        stages.push(
            StageSpec::new(StageKind::Save)
                .with_constraints(Constraints {
                    requires_charging: true,
                    requires_storage_not_low: true,
                })
                .with_tag(TAG_OUTPUT),
        );

        Ok(ChainSpec::new(
            IMAGE_MANIPULATION_WORK_NAME,
            ExistingWorkPolicy::Replace,
            stages,
        )?)
    }

    /// Submit a blur chain, replacing any chain still running. Returns the
    /// id of the submitted chain.
    pub fn apply_blur(&self, level: u32) -> Result<ChainId, BlurError> {
        let chain = self.build_chain(level)?;
        let id = self.scheduler.enqueue(chain)?;
        info!(chain = %id, level, "blur requested");
        Ok(id)
    }

    pub fn cancel_work(&self) {
        self.scheduler.cancel_unique(IMAGE_MANIPULATION_WORK_NAME);
    }

    /// Terminal Save stages of chains under [`IMAGE_MANIPULATION_WORK_NAME`], newest first.
    pub fn output_status_stream(&self) -> StatusStream {
        self.scheduler
            .subscribe(WorkQuery::by_tag(TAG_OUTPUT).in_chain(IMAGE_MANIPULATION_WORK_NAME))
    }

    /// Every stage of chains under [`IMAGE_MANIPULATION_WORK_NAME`].
    pub fn chain_stages_stream(&self) -> StatusStream {
        self.scheduler
            .subscribe(WorkQuery::for_unique(IMAGE_MANIPULATION_WORK_NAME))
    }

    /// Current stages of one chain, in chain order.
    pub fn stages_of(&self, chain: ChainId) -> Snapshot {
        self.scheduler
            .snapshot(&WorkQuery::for_unique(IMAGE_MANIPULATION_WORK_NAME))
            .into_iter()
            .filter(|s| s.chain == chain)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DeviceMonitor, LocalScheduler};
    use crate::model::StageStatus;
    use crate::workers::testing::echo_registry;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Records calls instead of running anything.
    #[derive(Default)]
    struct RecordingScheduler {
        enqueued: Mutex<Vec<ChainSpec>>,
        cancelled: Mutex<Vec<String>>,
        queries: Mutex<Vec<WorkQuery>>,
    }

    impl WorkScheduler for RecordingScheduler {
        fn enqueue(&self, chain: ChainSpec) -> Result<ChainId, ChainError> {
            let mut enqueued = self.enqueued.lock().unwrap();
            enqueued.push(chain);
            Ok(ChainId(enqueued.len() as u64))
        }

        fn cancel_unique(&self, name: &str) {
            self.cancelled.lock().unwrap().push(name.to_string());
        }

        fn subscribe(&self, query: WorkQuery) -> StatusStream {
            self.queries.lock().unwrap().push(query);
            let (tx, rx) = mpsc::unbounded_channel();
            tx.send(Vec::new()).unwrap();
            StatusStream::from_channel(rx)
        }

        fn snapshot(&self, _query: &WorkQuery) -> Snapshot {
            Vec::new()
        }
    }

    fn facade() -> (Arc<RecordingScheduler>, BlurOrchestrator) {
        let sched = Arc::new(RecordingScheduler::default());
        let mut facade = BlurOrchestrator::new(sched.clone());
        facade.set_image_input(Some("file:///a.jpg"));
        (sched, facade)
    }

    #[test]
    fn chain_has_level_plus_two_stages() {
        let (_, facade) = facade();
        for level in 1..=5 {
            let chain = facade.build_chain(level).unwrap();
            assert_eq!(chain.stages().len(), level as usize + 2);
            let with_input: Vec<_> = chain
                .stages()
                .iter()
                .enumerate()
                .filter(|(_, s)| s.input.is_some())
                .map(|(i, _)| i)
                .collect();
            assert_eq!(with_input, vec![1]);
        }
    }

    #[test]
    fn level_two_scenario() {
        let (_, facade) = facade();
        let chain = facade.build_chain(2).unwrap();
        assert_eq!(chain.name(), IMAGE_MANIPULATION_WORK_NAME);
        assert_eq!(chain.policy(), ExistingWorkPolicy::Replace);

        let kinds: Vec<_> = chain.stages().iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StageKind::Cleanup,
                StageKind::Blur,
                StageKind::Blur,
                StageKind::Save
            ]
        );

        let first_blur = &chain.stages()[1];
        assert_eq!(
            first_blur
                .input
                .as_ref()
                .and_then(|d| d.get_string(KEY_IMAGE_URI)),
            Some("file:///a.jpg")
        );

        let save = &chain.stages()[3];
        assert!(save.tags.contains(TAG_OUTPUT));
        assert!(save.constraints.requires_charging);
        assert!(save.constraints.requires_storage_not_low);
        assert!(chain.stages()[..3].iter().all(|s| s.tags.is_empty()));
    }

    #[test]
    fn missing_input_fails_fast() {
        let sched = Arc::new(RecordingScheduler::default());
        let mut facade = BlurOrchestrator::new(sched.clone());
        assert_eq!(facade.apply_blur(1), Err(BlurError::MissingInput));

        facade.set_image_input(Some(""));
        assert_eq!(facade.apply_blur(1), Err(BlurError::MissingInput));
        assert!(sched.enqueued.lock().unwrap().is_empty());
    }

    #[test]
    fn zero_level_is_rejected() {
        let (sched, facade) = facade();
        assert_eq!(facade.apply_blur(0), Err(BlurError::InvalidLevel));
        assert!(sched.enqueued.lock().unwrap().is_empty());
    }

    #[test]
    fn commands_reach_the_injected_scheduler() {
        let (sched, facade) = facade();
        facade.apply_blur(3).unwrap();
        facade.cancel_work();
        let _stream = facade.output_status_stream();

        assert_eq!(sched.enqueued.lock().unwrap().len(), 1);
        assert_eq!(
            *sched.cancelled.lock().unwrap(),
            vec![IMAGE_MANIPULATION_WORK_NAME.to_string()]
        );
        assert_eq!(
            *sched.queries.lock().unwrap(),
            vec![WorkQuery::by_tag(TAG_OUTPUT).in_chain(IMAGE_MANIPULATION_WORK_NAME)]
        );
    }

    #[test]
    fn output_uri_round_trips_through_setter() {
        let (_, mut facade) = facade();
        assert!(facade.output_uri().is_none());
        facade.set_output_uri("file:///out.png");
        assert_eq!(
            facade.output_uri().map(ImageRef::as_str),
            Some("file:///out.png")
        );
        facade.set_output_uri("");
        assert!(facade.output_uri().is_none());
    }

    #[tokio::test]
    async fn end_to_end_success_reports_output() {
        let sched = Arc::new(
            LocalScheduler::new(echo_registry(), DeviceMonitor::default()).unwrap(),
        );
        let mut facade = BlurOrchestrator::new(sched);
        facade.set_image_input(Some("file:///a.jpg"));
        let mut stream = facade.output_status_stream();
        assert_eq!(stream.recv().await, Some(vec![]));

        facade.apply_blur(2).unwrap();
        let head = loop {
            let snap = tokio::time::timeout(Duration::from_secs(5), stream.recv())
                .await
                .unwrap()
                .unwrap();
            if snap[0].status.is_finished() {
                break snap[0].clone();
            }
        };
        assert_eq!(head.status, StageStatus::Succeeded);
        let out = head.output.image_uri().unwrap();
        assert!(!out.as_str().is_empty());

        let kinds: Vec<_> = facade.stages_of(head.chain).iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StageKind::Cleanup,
                StageKind::Blur,
                StageKind::Blur,
                StageKind::Save
            ]
        );
        assert!(facade.stages_of(ChainId(99)).is_empty());
    }

    #[tokio::test]
    async fn second_submission_supersedes_first() {
        let sched = Arc::new(
            LocalScheduler::new(echo_registry(), DeviceMonitor::default()).unwrap(),
        );
        let mut facade = BlurOrchestrator::new(sched.clone());
        facade.set_image_input(Some("file:///a.jpg"));
        let mut stream = facade.output_status_stream();

        assert_eq!(facade.apply_blur(1).unwrap(), ChainId(1));
        assert_eq!(facade.apply_blur(1).unwrap(), ChainId(2));

        let mut first_statuses = Vec::new();
        loop {
            let snap = tokio::time::timeout(Duration::from_secs(5), stream.recv())
                .await
                .unwrap()
                .unwrap();
            first_statuses.extend(
                snap.iter()
                    .filter(|s| s.chain == ChainId(1))
                    .map(|s| s.status),
            );
            if snap
                .iter()
                .any(|s| s.chain == ChainId(2) && s.status.is_finished())
            {
                break;
            }
        }
        assert!(first_statuses.contains(&StageStatus::Cancelled));
        assert!(!first_statuses.contains(&StageStatus::Succeeded));
    }

    #[tokio::test]
    async fn cancel_then_no_success() {
        let device = DeviceMonitor::default();
        device.set_charging(false);
        let sched = Arc::new(LocalScheduler::new(echo_registry(), device.clone()).unwrap());
        let mut facade = BlurOrchestrator::new(sched);
        facade.set_image_input(Some("file:///a.jpg"));
        let mut stream = facade.output_status_stream();

        facade.apply_blur(1).unwrap();
        facade.cancel_work();
        device.set_charging(true);

        let head = loop {
            let snap = stream.recv().await.unwrap();
            if let Some(head) = snap.first().filter(|s| s.status.is_finished()) {
                break head.clone();
            }
        };
        assert_eq!(head.status, StageStatus::Cancelled);
    }
}
