//! Transaction context and retrying units of work.
//!
//! A [`Transaction`] wraps a host [`StoreTransaction`] and carries the state the engine
//! binds to it: the events recorded while it was open, the merge tasks waiting for it to
//! commit, and the callbacks to run once it has committed or rolled back. It is passed
//! explicitly through every call that needs "the current transaction".

use std::io::Cursor;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::canonical::with_numeric_suffix;
use crate::config::RetryPolicy;
use crate::event::RepositoryEvent;
use crate::storage::{ContentReader, Error, Identity, Node, NodeId, NodeKind, Repository, Result, StoreTransaction};
use crate::versioning::PendingMergeTask;

/// Callback run after the transaction has either committed or rolled back. It receives the
/// merge tasks that were bound to the transaction.
pub type CompletionCallback = Box<dyn FnOnce(&[PendingMergeTask]) + Send>;

/// An open transaction plus the engine state scoped to it.
///
/// Store operations are reachable through `Deref` to [`StoreTransaction`]. Dropping a
/// transaction without calling [`commit`](Self::commit) discards its writes, but runs no
/// rollback callbacks.
pub struct Transaction {
    id: Uuid,
    inner: Box<dyn StoreTransaction>,
    events: Vec<RepositoryEvent>,
    pending_merges: Vec<PendingMergeTask>,
    on_commit: Vec<CompletionCallback>,
    on_rollback: Vec<CompletionCallback>,
}

impl Transaction {
    pub fn new(inner: Box<dyn StoreTransaction>) -> Self {
        Transaction {
            id: Uuid::new_v4(),
            inner,
            events: Vec::new(),
            pending_merges: Vec::new(),
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
        }
    }

    pub fn id(&self) -> &Uuid {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        self.inner.identity()
    }

    /// Creates a document with the given content and records a
    /// [`RepositoryEvent::DocumentCreated`] for it.
    #[instrument(skip(self, content), fields(tx = %self.id))]
    pub async fn create_document(&mut self, parent: NodeId, name: &str, content: ContentReader) -> Result<Node> {
        let node = self.inner.create_node(parent, name, NodeKind::Document).await?;
        self.fill_new_document(node.id, content).await
    }

    /// Creates a document the way hosts handle uploads: if `name` is taken, the numbered
    /// variants `name-1`, `name-2`, … are tried until one is free.
    #[instrument(skip(self, content), fields(tx = %self.id))]
    pub async fn upload_document(&mut self, parent: NodeId, name: &str, content: Vec<u8>) -> Result<Node> {
        let mut candidate = name.to_string();
        let mut suffix = 0;
        let node = loop {
            match self.inner.create_node(parent, &candidate, NodeKind::Document).await {
                Ok(node) => break node,
                Err(Error::NameConflict { .. }) => {
                    suffix += 1;
                    candidate = with_numeric_suffix(name, suffix);
                    debug!("Name taken, trying '{}'", candidate);
                }
                Err(e) => return Err(e),
            }
        };
        self.fill_new_document(node.id, Box::new(Cursor::new(content))).await
    }

    pub async fn create_folder(&mut self, parent: NodeId, name: &str) -> Result<Node> {
        self.inner.create_node(parent, name, NodeKind::Folder).await
    }

    async fn fill_new_document(&mut self, id: NodeId, content: ContentReader) -> Result<Node> {
        self.inner.put_content(id, content).await?;
        self.events.push(RepositoryEvent::DocumentCreated { node: id });
        self.inner.node(id).await
    }

    /// Takes the events recorded so far, leaving none behind.
    pub fn take_events(&mut self) -> Vec<RepositoryEvent> {
        std::mem::take(&mut self.events)
    }

    /// Binds a merge task to this transaction.
    ///
    /// Returns `false` (and binds nothing) if a task for the same duplicate is already bound.
    pub fn bind_merge(&mut self, task: PendingMergeTask) -> bool {
        if self.pending_merges.iter().any(|t| t.duplicate == task.duplicate) {
            return false;
        }
        self.pending_merges.push(task);
        true
    }

    pub fn pending_merges(&self) -> &[PendingMergeTask] {
        &self.pending_merges
    }

    /// Registers a callback to run after a successful commit.
    pub fn on_commit(&mut self, callback: CompletionCallback) {
        self.on_commit.push(callback);
    }

    /// Registers a callback to run after a rollback or failed commit.
    pub fn on_rollback(&mut self, callback: CompletionCallback) {
        self.on_rollback.push(callback);
    }

    /// Commits the store transaction, then runs the matching completion callbacks.
    #[instrument(skip(self), fields(tx = %self.id))]
    pub async fn commit(self) -> Result<()> {
        let Transaction { inner, events, pending_merges, on_commit, on_rollback, .. } = self;
        if !events.is_empty() {
            debug!("Committing with {} undispatched events", events.len());
        }

        match inner.commit().await {
            Ok(()) => {
                debug!("Committed; {} merge tasks bound", pending_merges.len());
                for callback in on_commit {
                    callback(&pending_merges);
                }
                Ok(())
            }
            Err(e) => {
                debug!("Commit failed: {}", e);
                for callback in on_rollback {
                    callback(&pending_merges);
                }
                Err(e)
            }
        }
    }

    /// Discards the transaction's writes and bound tasks, then runs the rollback callbacks.
    #[instrument(skip(self), fields(tx = %self.id))]
    pub async fn rollback(self) {
        let Transaction { inner, pending_merges, on_rollback, .. } = self;
        inner.rollback().await;
        for callback in on_rollback {
            callback(&pending_merges);
        }
    }
}

impl Deref for Transaction {
    type Target = dyn StoreTransaction;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for Transaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

/// Runs units of work in fresh transactions, re-running them on transient conflicts.
///
/// Each attempt opens its own transaction, so attempts never observe each other's writes.
/// Between attempts the helper sleeps, doubling the delay up to the policy's cap.
#[derive(Clone)]
pub struct RetryingTransactionHelper {
    repository: Arc<dyn Repository>,
    policy: RetryPolicy,
}

impl RetryingTransactionHelper {
    pub fn new(repository: Arc<dyn Repository>, policy: RetryPolicy) -> Self {
        RetryingTransactionHelper { repository, policy }
    }

    /// Runs `work` as `identity` and commits its transaction.
    ///
    /// `work` is called once per attempt with a new transaction. An `Err` from `work` rolls
    /// the attempt back; transient errors from `work` or from the commit trigger another
    /// attempt until the policy's limit, after which [`Error::RetriesExhausted`] is returned.
    /// Other errors are returned as they are.
    pub async fn run<T, F>(&self, identity: Identity, mut work: F) -> Result<T>
    where
        T: Send,
        F: for<'a> FnMut(&'a mut Transaction) -> BoxFuture<'a, Result<T>> + Send,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = self.repository.begin(identity.clone()).await?;
            let outcome = match work(&mut tx).await {
                Ok(value) => tx.commit().await.map(|()| value),
                Err(e) => {
                    tx.rollback().await;
                    Err(e)
                }
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    debug!(attempt, ?delay, "Transient failure, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(Error::RetriesExhausted { attempts: attempt, source: Box::new(e) });
                }
                Err(e) => return Err(e),
            }
        }
    }
}
