//! Background best-effort parent-directory timestamp updates.
//!
//! Mutations enqueue the paths they touched; a small worker pool folds each
//! task into one batched metadata update against the parents. Nothing here
//! ever propagates an error to the caller — modification times are
//! best-effort metadata — and a saturated queue drops work with a log line
//! instead of blocking.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cache::Clock;
use crate::info::{self, UpdatableItemInfo};
use crate::options::TimestampUpdateOptions;
use crate::paths;
use crate::resource_id::ResourceId;
use crate::storage::ObjectStore;

const WORKER_COUNT: usize = 2;
const QUEUE_CAPACITY: usize = 1000;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

struct UpdateTask {
    modified: Vec<ResourceId>,
    excluded: Vec<ResourceId>,
}

/// Owns the bounded queue and worker pool for parent timestamp updates.
pub struct TimestampUpdater {
    sender: Option<mpsc::Sender<UpdateTask>>,
    workers: Vec<JoinHandle<()>>,
    drain_timeout: Duration,
}

impl TimestampUpdater {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        options: TimestampUpdateOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_drain_timeout(store, options, clock, DRAIN_TIMEOUT)
    }

    /// As [`new`](Self::new) with a custom drain deadline for shutdown.
    pub fn with_drain_timeout(
        store: Arc<dyn ObjectStore>,
        options: TimestampUpdateOptions,
        clock: Arc<dyn Clock>,
        drain_timeout: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let workers = (0..WORKER_COUNT)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let store = Arc::clone(&store);
                let options = options.clone();
                let clock = Arc::clone(&clock);
                tokio::spawn(async move {
                    loop {
                        let task = receiver.lock().await.recv().await;
                        match task {
                            Some(task) => process_task(&*store, &options, &*clock, task).await,
                            None => {
                                trace!(worker, "timestamp worker draining out");
                                break;
                            }
                        }
                    }
                })
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
            drain_timeout,
        }
    }

    /// Queue a parent update for the given modified paths. Saturation drops
    /// the task.
    pub fn enqueue(&self, modified: Vec<ResourceId>, excluded: Vec<ResourceId>) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(err) = sender.try_send(UpdateTask { modified, excluded }) {
            debug!(%err, "timestamp update queue saturated, dropping task");
        }
    }

    /// Stop accepting work and drain the pool, force-terminating after the
    /// drain timeout.
    pub async fn shutdown(&mut self) {
        self.sender = None;
        let mut workers = std::mem::take(&mut self.workers);
        let drain = futures::future::join_all(workers.iter_mut());
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            warn!("timestamp workers did not drain in time, force-terminating");
            for worker in &workers {
                worker.abort();
            }
        }
    }
}

/// Fold one task into a single batched metadata update. All failures are
/// logged at debug and swallowed.
async fn process_task(
    store: &dyn ObjectStore,
    options: &TimestampUpdateOptions,
    clock: &dyn Clock,
    task: UpdateTask,
) {
    let excluded: HashSet<ResourceId> = task.excluded.into_iter().collect();
    let mut parents: HashSet<ResourceId> = HashSet::new();
    for modified in &task.modified {
        let parent = paths::parent(modified);
        if !excluded.contains(&parent) && options.should_update(&parent.to_string()) {
            parents.insert(parent);
        }
    }

    let mut attributes = HashMap::new();
    attributes.insert(
        info::MTIME_ATTRIBUTE.to_owned(),
        Some(info::encode_mtime(clock.now_millis())),
    );

    let updates: Vec<UpdatableItemInfo> = parents
        .into_iter()
        // Only object-backed directories carry metadata; buckets and the
        // root have no placeholder to patch.
        .filter(ResourceId::is_object)
        .map(|id| UpdatableItemInfo {
            id,
            attributes: attributes.clone(),
        })
        .collect();

    if updates.is_empty() {
        debug!("all modified paths were excluded from timestamp updates");
        return;
    }

    if let Err(err) = store.update_items(&updates).await {
        debug!(%err, "parent timestamp update failed");
    }
}
