use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::storage::{Error, Identity, NodeId, Result};
use crate::transaction::{RetryingTransactionHelper, Transaction};
use crate::versioning::{MergeReport, PendingMergeTask};

/// Why a deferred merge was given up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// One of the two documents no longer exists.
    Missing(NodeId),
    /// Every attempt ran into a transient conflict.
    RetriesExhausted,
    /// The pool was shut down before the task could run.
    PoolClosed,
    /// Any other error; the task is not retried.
    Failed(String),
}

/// Dead-letter record for a merge that did not happen. The duplicate stays hidden and
/// temporary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMerge {
    pub task: PendingMergeTask,
    pub reason: FailureReason,
    pub attempts: u32,
}

/// Copies the duplicate's content into the target and deletes the duplicate, as the system.
#[derive(Clone)]
pub struct MergeWorker {
    helper: RetryingTransactionHelper,
}

impl MergeWorker {
    pub fn new(helper: RetryingTransactionHelper) -> Self {
        MergeWorker { helper }
    }

    /// Runs one merge in its own retrying transaction.
    #[instrument(skip(self), fields(duplicate = %task.duplicate, target = %task.target))]
    pub async fn execute(&self, task: PendingMergeTask) -> std::result::Result<MergeReport, FailedMerge> {
        let mut attempts = 0u32;
        let outcome = self
            .helper
            .run(Identity::System, |tx| {
                attempts += 1;
                Box::pin(merge(tx, task))
            })
            .await;

        let reason = match outcome {
            Ok(report) => {
                info!(version = %report.version.label, attempts, "Merged duplicate");
                return Ok(report);
            }
            Err(Error::NotFound(id)) => {
                warn!("Dropping merge, node {} no longer exists", id);
                FailureReason::Missing(id)
            }
            Err(Error::RetriesExhausted { attempts, source }) => {
                error!(attempts, "Giving up on merge: {}", source);
                FailureReason::RetriesExhausted
            }
            Err(e) => {
                error!("Merge failed: {}", e);
                FailureReason::Failed(e.to_string())
            }
        };
        Err(FailedMerge { task, reason, attempts })
    }
}

async fn merge(tx: &mut Transaction, task: PendingMergeTask) -> Result<MergeReport> {
    for id in [task.duplicate, task.target] {
        if !tx.exists(id).await? {
            return Err(Error::NotFound(id));
        }
    }
    let content = tx.reader(task.duplicate).await?;
    let version = tx.put_content(task.target, content).await?;
    tx.delete(task.duplicate).await?;
    Ok(MergeReport { duplicate: task.duplicate, target: task.target, version })
}

#[derive(Default)]
struct Tracker {
    in_flight: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
    dead_letters: Mutex<Vec<FailedMerge>>,
}

impl Tracker {
    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn dead_letter(&self, failed: FailedMerge) {
        self.dead_letters.lock().unwrap_or_else(PoisonError::into_inner).push(failed);
    }
}

/// Sending side of the worker pool.
#[derive(Clone)]
pub struct MergeQueue {
    sender: mpsc::UnboundedSender<PendingMergeTask>,
    tracker: Arc<Tracker>,
}

impl MergeQueue {
    /// Hands a task to the pool. Never blocks.
    pub fn submit(&self, task: PendingMergeTask) {
        // Counted before the closed check, so a concurrent shutdown either sees the task
        // in flight and waits for it, or the task sees the pool closed.
        self.tracker.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.tracker.closed.load(Ordering::SeqCst) {
            warn!(duplicate = %task.duplicate, "Merge pool is shut down, dropping task");
            self.tracker.dead_letter(FailedMerge { task, reason: FailureReason::PoolClosed, attempts: 0 });
            self.tracker.finish();
            return;
        }
        if self.sender.send(task).is_err() {
            warn!(duplicate = %task.duplicate, "Merge workers are gone, dropping task");
            self.tracker.dead_letter(FailedMerge { task, reason: FailureReason::PoolClosed, attempts: 0 });
            self.tracker.finish();
        }
    }

    /// Number of submitted tasks that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<PendingMergeTask>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (MergeQueue { sender, tracker: Arc::new(Tracker::default()) }, receiver)
    }
}

/// Fixed-size pool of merge workers fed through an unbounded channel.
pub struct MergeWorkerPool {
    queue: MergeQueue,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl MergeWorkerPool {
    /// Spawns `size` workers on the current tokio runtime.
    pub fn start(worker: MergeWorker, size: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let tracker = Arc::new(Tracker::default());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handles = (0..size.max(1))
            .map(|index| {
                tokio::spawn(run_worker(
                    index,
                    worker.clone(),
                    receiver.clone(),
                    tracker.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();
        debug!("Started {} merge workers", size.max(1));

        MergeWorkerPool { queue: MergeQueue { sender, tracker }, shutdown, handles }
    }

    pub fn queue(&self) -> MergeQueue {
        self.queue.clone()
    }

    /// Waits until every submitted task has finished, successfully or not.
    pub async fn wait_idle(&self) {
        let tracker = &self.queue.tracker;
        loop {
            let idle = tracker.idle.notified();
            if tracker.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Merges that were dropped or gave up, oldest first.
    pub fn dead_letters(&self) -> Vec<FailedMerge> {
        self.queue.tracker.dead_letters.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Stops accepting tasks, lets the queued ones finish, then stops the workers.
    pub async fn shutdown(self) {
        self.queue.tracker.closed.store(true, Ordering::SeqCst);
        self.wait_idle().await;
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Merge worker panicked: {}", e);
            }
        }
        debug!("Merge workers stopped");
    }
}

async fn run_worker(
    index: usize,
    worker: MergeWorker,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PendingMergeTask>>>,
    tracker: Arc<Tracker>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let task = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                task = receiver.recv() => task,
                _ = shutdown.changed() => None,
            }
        };
        let Some(task) = task else {
            break;
        };

        debug!(worker = index, duplicate = %task.duplicate, "Picked up merge task");
        if let Err(failed) = worker.execute(task).await {
            tracker.dead_letter(failed);
        }
        tracker.finish();
    }
    debug!(worker = index, "Merge worker exiting");
}
