//! In-process scheduler backed by Tokio tasks.
//!
//! All registry mutation and snapshot publication happen under one lock, so
//! every subscriber sees every transition of the stages it watches, in order.
//! Terminal statuses are sticky: whichever of completion and cancellation
//! lands first wins.

use super::chain::{ChainError, ChainSpec, ExistingWorkPolicy};
use super::device::DeviceMonitor;
use super::stream::{self, Snapshot, StatusStream, Unsubscribe, WorkQuery};
use super::WorkScheduler;
use crate::model::{now_rfc3339, ChainId, StageInfo, StageStatus, WorkData};
use crate::workers::{WorkContext, WorkError, WorkerRegistry};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Finished chains kept for observation when no limit is configured.
const DEFAULT_HISTORY_LIMIT: usize = 20;

/// How a chain ended, as seen by an appended successor.
#[derive(Debug, Clone)]
struct ChainOutcome {
    status: StageStatus,
    output: WorkData,
}

struct ChainRecord {
    name: String,
    stages: Vec<StageInfo>,
    started: Vec<Option<Instant>>,
    cancel: CancellationToken,
    done: watch::Sender<Option<ChainOutcome>>,
}

impl ChainRecord {
    fn is_live(&self) -> bool {
        self.stages.iter().any(|s| !s.status.is_finished())
    }
}

struct Subscriber {
    id: u64,
    query: WorkQuery,
    tx: mpsc::UnboundedSender<Snapshot>,
}

#[derive(Default)]
struct Registry {
    next_chain: u64,
    chains: BTreeMap<ChainId, ChainRecord>,
    // Every chain registered under a name, oldest first.
    unique: HashMap<String, Vec<ChainId>>,
    subscribers: Vec<Subscriber>,
}

impl Registry {
    /// Chains under `name` that still have unfinished stages, oldest first.
    fn live_under(&self, name: &str) -> Vec<ChainId> {
        self.unique
            .get(name)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|id| self.chains.get(id).is_some_and(ChainRecord::is_live))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn snapshot(&self, query: &WorkQuery) -> Snapshot {
        let entries = self
            .chains
            .iter()
            .flat_map(|(id, chain)| {
                chain
                    .stages
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| query.matches(&chain.name, s))
                    .map(move |(idx, s)| (*id, idx, s.clone()))
            })
            .collect();
        stream::newest_first(entries)
    }

    /// Push a fresh snapshot to every subscriber whose query covers the stage.
    fn publish(&mut self, chain: ChainId, idx: usize) {
        let Some(record) = self.chains.get(&chain) else {
            return;
        };
        let Some(stage) = record.stages.get(idx) else {
            return;
        };

        let mut dead = Vec::new();
        for sub in &self.subscribers {
            if sub.query.matches(&record.name, stage)
                && sub.tx.send(self.snapshot(&sub.query)).is_err()
            {
                dead.push(sub.id);
            }
        }
        if !dead.is_empty() {
            self.subscribers.retain(|s| !dead.contains(&s.id));
        }
    }

    /// Apply `f` to a non-terminal stage and publish. Returns `false` when the
    /// stage was already terminal and nothing changed.
    fn transition(
        &mut self,
        chain: ChainId,
        idx: usize,
        f: impl FnOnce(&mut StageInfo, Option<Instant>),
    ) -> bool {
        let Some(record) = self.chains.get_mut(&chain) else {
            return false;
        };
        let started = record.started.get(idx).copied().flatten();
        let Some(stage) = record.stages.get_mut(idx) else {
            return false;
        };
        if stage.status.is_finished() {
            return false;
        }
        f(stage, started);
        if stage.status == StageStatus::Running {
            if let Some(slot) = record.started.get_mut(idx) {
                *slot = Some(Instant::now());
            }
        }
        debug!(%chain, stage = %stage.id, kind = ?stage.kind, status = ?stage.status, "stage transition");
        self.publish(chain, idx);
        self.signal_if_done(chain);
        true
    }

    /// Move every non-terminal stage from `from` onwards to `status`.
    fn finish_from(&mut self, chain: ChainId, from: usize, status: StageStatus, error: &str) {
        let len = self.chains.get(&chain).map_or(0, |c| c.stages.len());
        for idx in from..len {
            self.transition(chain, idx, |s, started| {
                s.status = status;
                if status == StageStatus::Failed {
                    s.error = Some(error.to_string());
                }
                stamp_finished(s, started);
            });
        }
    }

    fn cancel_chain(&mut self, chain: ChainId) {
        if let Some(record) = self.chains.get(&chain) {
            info!(%chain, name = %record.name, "cancelling chain");
            record.cancel.cancel();
        }
        self.finish_from(chain, 0, StageStatus::Cancelled, "");
    }

    fn signal_if_done(&self, chain: ChainId) {
        let Some(record) = self.chains.get(&chain) else {
            return;
        };
        if record.is_live() || record.done.borrow().is_some() {
            return;
        }
        if let Some(last) = record.stages.last() {
            info!(%chain, status = ?last.status, "chain finished");
            record.done.send_replace(Some(ChainOutcome {
                status: last.status,
                output: last.output.clone(),
            }));
        }
    }

    /// Drop the oldest finished chains beyond `limit`.
    fn prune(&mut self, limit: usize) {
        let finished: Vec<ChainId> = self
            .chains
            .iter()
            .filter(|(_, c)| !c.is_live())
            .map(|(id, _)| *id)
            .collect();
        let excess = finished.len().saturating_sub(limit);
        for id in finished.into_iter().take(excess) {
            if let Some(record) = self.chains.remove(&id) {
                if let Some(ids) = self.unique.get_mut(&record.name) {
                    ids.retain(|c| *c != id);
                    if ids.is_empty() {
                        self.unique.remove(&record.name);
                    }
                }
                debug!(chain = %id, "pruned finished chain");
            }
        }
    }
}

fn stamp_finished(stage: &mut StageInfo, started: Option<Instant>) {
    stage.finished_utc = Some(now_rfc3339());
    stage.duration_ms = started.map(|t| t.elapsed().as_millis() as u64);
}

struct Shared {
    registry: Mutex<Registry>,
    workers: WorkerRegistry,
    device: DeviceMonitor,
    history_limit: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Unsubscribe for Shared {
    fn unsubscribe(&self, id: u64) {
        self.lock().subscribers.retain(|s| s.id != id);
    }
}

/// Tokio-backed [`WorkScheduler`].
#[derive(Clone)]
pub struct LocalScheduler {
    shared: Arc<Shared>,
    handle: Handle,
}

impl LocalScheduler {
    /// Must be called from within a Tokio runtime; chains are spawned onto it.
    pub fn new(workers: WorkerRegistry, device: DeviceMonitor) -> Result<Self, ChainError> {
        let handle = Handle::try_current().map_err(|_| ChainError::NoRuntime)?;
        Ok(Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                workers,
                device,
                history_limit: AtomicUsize::new(DEFAULT_HISTORY_LIMIT),
            }),
            handle,
        })
    }

    /// Keep at most `limit` finished chains around for observation.
    pub fn with_history_limit(self, limit: usize) -> Self {
        self.shared
            .history_limit
            .store(limit.max(1), Ordering::Relaxed);
        self
    }

    pub fn device(&self) -> &DeviceMonitor {
        &self.shared.device
    }
}

impl WorkScheduler for LocalScheduler {
    fn enqueue(&self, spec: ChainSpec) -> Result<ChainId, ChainError> {
        spec.validate()?;

        let (id, cancel, predecessor) = {
            let mut reg = self.shared.lock();
            let live = reg.live_under(spec.name());

            let mut predecessor = None;
            match (spec.policy(), live.last().copied()) {
                (ExistingWorkPolicy::Keep, Some(existing)) => {
                    info!(name = spec.name(), chain = %existing, "keeping live chain");
                    return Ok(existing);
                }
                (ExistingWorkPolicy::Replace, Some(_)) => {
                    for existing in live {
                        reg.cancel_chain(existing);
                    }
                }
                (ExistingWorkPolicy::Append, Some(newest)) => {
                    predecessor = reg.chains.get(&newest).map(|c| c.done.subscribe());
                }
                _ => {}
            }

            reg.next_chain += 1;
            let id = ChainId(reg.next_chain);
            let stages: Vec<StageInfo> = spec
                .stages()
                .iter()
                .map(|s| StageInfo {
                    id: s.id.clone(),
                    chain: id,
                    kind: s.kind,
                    status: StageStatus::Enqueued,
                    tags: s.tags.clone(),
                    output: WorkData::default(),
                    error: None,
                    started_utc: None,
                    finished_utc: None,
                    duration_ms: None,
                })
                .collect();
            let cancel = CancellationToken::new();
            let (done, _) = watch::channel(None);
            reg.chains.insert(
                id,
                ChainRecord {
                    name: spec.name().to_string(),
                    started: vec![None; stages.len()],
                    stages,
                    cancel: cancel.clone(),
                    done,
                },
            );
            reg.unique
                .entry(spec.name().to_string())
                .or_default()
                .push(id);
            info!(name = spec.name(), chain = %id, stages = spec.stages().len(), policy = ?spec.policy(), "enqueued chain");

            for idx in 0..spec.stages().len() {
                reg.publish(id, idx);
            }
            reg.prune(self.shared.history_limit.load(Ordering::Relaxed));
            (id, cancel, predecessor)
        };

        self.handle
            .spawn(run_chain(self.shared.clone(), id, spec, cancel, predecessor));
        Ok(id)
    }

    fn cancel_unique(&self, name: &str) {
        let mut reg = self.shared.lock();
        let live = reg.live_under(name);
        if live.is_empty() {
            debug!(name, "nothing to cancel");
        }
        for id in live {
            reg.cancel_chain(id);
        }
    }

    fn subscribe(&self, query: WorkQuery) -> StatusStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = stream::next_subscriber_id();
        let mut reg = self.shared.lock();
        // Receiver is alive, so the initial send cannot fail.
        let _ = tx.send(reg.snapshot(&query));
        reg.subscribers.push(Subscriber { id, query, tx });
        drop(reg);
        StatusStream::new(id, rx, self.shared.clone())
    }

    fn snapshot(&self, query: &WorkQuery) -> Snapshot {
        self.shared.lock().snapshot(query)
    }
}

async fn run_chain(
    shared: Arc<Shared>,
    id: ChainId,
    spec: ChainSpec,
    cancel: CancellationToken,
    predecessor: Option<watch::Receiver<Option<ChainOutcome>>>,
) {
    let mut carried = WorkData::default();

    if let Some(mut prev) = predecessor {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            r = prev.wait_for(Option::is_some) => r.ok().and_then(|o| o.clone()),
        };
        match outcome {
            Some(ChainOutcome {
                status: StageStatus::Succeeded,
                output,
            }) => carried = output,
            Some(ChainOutcome { status, .. }) => {
                shared
                    .lock()
                    .finish_from(id, 0, status, "prerequisite chain did not succeed");
                return;
            }
            None => {
                shared.lock().finish_from(id, 0, StageStatus::Cancelled, "");
                return;
            }
        }
    }

    for (idx, stage) in spec.stages().iter().enumerate() {
        let device = shared.device.current();
        if !stage.constraints.satisfied_by(&device) {
            info!(%id, kind = ?stage.kind, waiting_for = ?stage.constraints.unmet(&device), "stage waiting on constraints");
        }
        let mut device_rx = shared.device.subscribe();
        let ready = tokio::select! {
            _ = cancel.cancelled() => return,
            r = device_rx.wait_for(|d| stage.constraints.satisfied_by(d)) => r.is_ok(),
        };
        if !ready {
            shared
                .lock()
                .finish_from(id, idx, StageStatus::Failed, "device monitor closed");
            return;
        }

        let running = shared.lock().transition(id, idx, |s, _| {
            s.status = StageStatus::Running;
            s.started_utc = Some(now_rfc3339());
        });
        if !running {
            return;
        }

        let Some(worker) = shared.workers.get(stage.kind) else {
            let err = WorkError::Unregistered(stage.kind).to_string();
            warn!(%id, %err, "stage failed");
            shared.lock().finish_from(id, idx, StageStatus::Failed, &err);
            return;
        };

        let input = stage
            .input
            .clone()
            .unwrap_or_default()
            .merged_with(&carried);
        let ctx = WorkContext {
            stage_id: stage.id.clone(),
            input,
            cancel: cancel.child_token(),
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            r = worker.do_work(ctx) => r,
        };

        match result {
            Ok(output) => {
                let out = output.clone();
                let applied = shared.lock().transition(id, idx, move |s, started| {
                    s.status = StageStatus::Succeeded;
                    s.output = out;
                    stamp_finished(s, started);
                });
                if !applied {
                    return;
                }
                carried = output;
            }
            Err(WorkError::Cancelled) => {
                debug!(%id, kind = ?stage.kind, "worker stopped on cancellation");
                shared.lock().finish_from(id, idx, StageStatus::Cancelled, "");
                return;
            }
            Err(e) => {
                let err = e.to_string();
                warn!(%id, kind = ?stage.kind, %err, "stage failed");
                let mut reg = shared.lock();
                reg.finish_from(id, idx, StageStatus::Failed, &err);
                return;
            }
        }
    }
}
