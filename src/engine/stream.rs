//! Status snapshot streams.
//!
//! Each subscriber owns an unbounded channel. The scheduler pushes one full
//! snapshot per matching transition, so nothing is coalesced or skipped.

use crate::model::{ChainId, StageInfo};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Which stages a subscriber wants to see.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQuery {
    /// Only stages carrying this tag.
    pub tag: Option<String>,
    /// Only stages of chains registered under this name.
    pub unique_name: Option<String>,
}

impl WorkQuery {
    pub fn by_tag(tag: &str) -> Self {
        Self {
            tag: Some(tag.to_string()),
            unique_name: None,
        }
    }

    pub fn in_chain(mut self, name: &str) -> Self {
        self.unique_name = Some(name.to_string());
        self
    }

    pub fn for_unique(name: &str) -> Self {
        Self::default().in_chain(name)
    }

    pub fn matches(&self, chain_name: &str, stage: &StageInfo) -> bool {
        self.unique_name.as_deref().map_or(true, |n| n == chain_name)
            && self.tag.as_deref().map_or(true, |t| stage.tags.contains(t))
    }
}

pub type Snapshot = Vec<StageInfo>;

/// Detaches a subscriber from its publisher.
pub(crate) trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: u64);
}

static NEXT_SUBSCRIBER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_subscriber_id() -> u64 {
    NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed)
}

/// Stream of status snapshots for one [`WorkQuery`].
///
/// Always yields the snapshot taken at subscription time first. Dropping the
/// stream, or calling [`StatusStream::unsubscribe`], detaches it.
pub struct StatusStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<Snapshot>,
    latest: Option<Snapshot>,
    publisher: Option<Arc<dyn Unsubscribe>>,
}

impl StatusStream {
    pub(crate) fn new(
        id: u64,
        rx: mpsc::UnboundedReceiver<Snapshot>,
        publisher: Arc<dyn Unsubscribe>,
    ) -> Self {
        Self {
            id,
            rx,
            latest: None,
            publisher: Some(publisher),
        }
    }

    /// A stream fed directly from a channel, for schedulers that are not
    /// [`super::LocalScheduler`].
    pub fn from_channel(rx: mpsc::UnboundedReceiver<Snapshot>) -> Self {
        Self {
            id: 0,
            rx,
            latest: None,
            publisher: None,
        }
    }

    /// Wait for the next snapshot. `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<Snapshot> {
        let snap = self.rx.recv().await?;
        self.latest = Some(snap.clone());
        Some(snap)
    }

    /// Next snapshot if one is already queued.
    pub fn try_recv(&mut self) -> Option<Snapshot> {
        let snap = self.rx.try_recv().ok()?;
        self.latest = Some(snap.clone());
        Some(snap)
    }

    /// Most recent snapshot this stream has handed out.
    pub fn latest(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    /// The terminal-stage record of the newest chain in the latest snapshot.
    pub fn latest_head(&self) -> Option<&StageInfo> {
        self.latest.as_ref().and_then(|s| s.first())
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(p) = self.publisher.take() {
            p.unsubscribe(self.id);
        }
        self.rx.close();
    }
}

impl Drop for StatusStream {
    fn drop(&mut self) {
        self.detach();
    }
}

impl Stream for StatusStream {
    type Item = Snapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(snap)) => {
                self.latest = Some(snap.clone());
                Poll::Ready(Some(snap))
            }
            other => other,
        }
    }
}

/// Snapshot helper: newest chain first, stages in chain order.
pub(crate) fn newest_first(mut entries: Vec<(ChainId, usize, StageInfo)>) -> Snapshot {
    entries.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    entries.into_iter().map(|(_, _, s)| s).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StageKind, StageStatus, WorkData};
    use futures::StreamExt;

    fn stage(chain: u64, kind: StageKind, tag: Option<&str>) -> StageInfo {
        StageInfo {
            id: format!("{chain}-{kind:?}"),
            chain: ChainId(chain),
            kind,
            status: StageStatus::Enqueued,
            tags: tag.into_iter().map(str::to_string).collect(),
            output: WorkData::default(),
            error: None,
            started_utc: None,
            finished_utc: None,
            duration_ms: None,
        }
    }

    #[test]
    fn query_matches_tag_and_name() {
        let tagged = stage(1, StageKind::Save, Some("OUTPUT"));
        let plain = stage(1, StageKind::Blur, None);

        let q = WorkQuery::by_tag("OUTPUT").in_chain("work");
        assert!(q.matches("work", &tagged));
        assert!(!q.matches("other", &tagged));
        assert!(!q.matches("work", &plain));

        let all = WorkQuery::for_unique("work");
        assert!(all.matches("work", &plain));
        assert!(WorkQuery::default().matches("anything", &plain));
    }

    #[test]
    fn newest_chain_sorts_first() {
        let snap = newest_first(vec![
            (ChainId(1), 1, stage(1, StageKind::Save, None)),
            (ChainId(2), 1, stage(2, StageKind::Save, None)),
            (ChainId(2), 0, stage(2, StageKind::Cleanup, None)),
        ]);
        let order: Vec<_> = snap.iter().map(|s| (s.chain.0, s.kind)).collect();
        assert_eq!(
            order,
            vec![
                (2, StageKind::Cleanup),
                (2, StageKind::Save),
                (1, StageKind::Save)
            ]
        );
    }

    #[tokio::test]
    async fn channel_stream_tracks_latest() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = StatusStream::from_channel(rx);
        assert!(stream.latest().is_none());

        tx.send(vec![]).unwrap();
        tx.send(vec![stage(3, StageKind::Save, Some("OUTPUT"))]).unwrap();
        drop(tx);

        assert_eq!(stream.next().await, Some(vec![]));
        let snap = stream.recv().await.unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(stream.latest_head().map(|s| s.chain), Some(ChainId(3)));
        assert!(stream.next().await.is_none());
    }
}
