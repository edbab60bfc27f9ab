//! Automatic versioning of re-uploaded documents.
//!
//! When a host stores a document under a name that is already taken, it renames the new
//! document (`Invoice.pdf` becomes `Invoice-1.pdf`). This module detects such duplicates as
//! they are created and folds their content into the original document as a new version, so
//! the folder keeps one document with a history instead of a pile of numbered copies.
//!
//! # Components
//!
//! *   **[`DuplicateResolver`]:** Maps a new document to the sibling carrying its canonical
//!     name, either by scanning the folder or through the store's name index.
//! *   **[`CreationHook`]:** Handles [`RepositoryEvent`]s recorded on a transaction. Depending
//!     on the configured [`Strategy`], it merges right away or hides the duplicate and defers.
//! *   **[`MergeScheduler`]:** Binds deferred [`PendingMergeTask`]s to their transaction and
//!     submits them once it commits.
//! *   **[`MergeWorkerPool`]:** Runs [`MergeWorker`]s that perform deferred merges in their own
//!     retrying transactions, as the system.
//! *   **[`AutoVersioner`]:** Wires the above together from an [`EngineConfig`].
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use autoversion_core::activity::MemoryActivityFeed;
//! # use autoversion_core::config::EngineConfig;
//! # use autoversion_core::storage::{Identity, MemoryRepository, Repository};
//! # use autoversion_core::versioning::AutoVersioner;
//! # async fn run() -> autoversion_core::storage::Result<()> {
//! let feed = Arc::new(MemoryActivityFeed::new());
//! let repository = Arc::new(MemoryRepository::new(feed.clone()));
//! let library = repository.create_site("finance")?;
//! let engine = AutoVersioner::new(repository.clone(), feed, EngineConfig::default())?;
//!
//! let mut tx = repository.begin(Identity::User("alice".into())).await?;
//! tx.upload_document(library, "Invoice.pdf", b"draft".to_vec()).await?;
//! engine.commit(tx).await?;
//!
//! let mut tx = repository.begin(Identity::User("alice".into())).await?;
//! tx.upload_document(library, "Invoice.pdf", b"final".to_vec()).await?;
//! engine.commit(tx).await?;
//!
//! engine.wait_idle().await;
//! # Ok(())
//! # }
//! ```
//!
//! [`RepositoryEvent`]: crate::event::RepositoryEvent
//! [`Strategy`]: crate::config::Strategy

pub use self::hook::CreationHook;
pub use self::resolver::DuplicateResolver;
pub use self::scheduler::MergeScheduler;
pub use self::worker::{FailedMerge, FailureReason, MergeQueue, MergeWorker, MergeWorkerPool};

mod hook;
mod resolver;
mod scheduler;
mod worker;

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::activity::{ActivityFeed, ActivityNotifier};
use crate::config::{EngineConfig, Strategy};
use crate::storage::{ContentVersion, NodeId, Repository, Result};
use crate::transaction::{RetryingTransactionHelper, Transaction};

/// "Copy the duplicate's content into the target, then remove the duplicate."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingMergeTask {
    pub duplicate: NodeId,
    pub target: NodeId,
}

/// A merge that has been carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub duplicate: NodeId,
    pub target: NodeId,
    /// The target's version holding the duplicate's content.
    pub version: ContentVersion,
}

/// What the creation hook did about a duplicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Merged inside the creating transaction.
    Merged(MergeReport),
    /// Hidden now, merged by the worker pool after commit.
    Scheduled(PendingMergeTask),
}

/// The versioning engine.
pub struct AutoVersioner {
    hook: CreationHook,
    pool: Option<MergeWorkerPool>,
}

impl AutoVersioner {
    /// Builds the engine. With the deferred strategy this spawns the worker pool, so it must
    /// be called from within a tokio runtime.
    pub fn new(repository: Arc<dyn Repository>, feed: Arc<dyn ActivityFeed>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let resolver = DuplicateResolver::new(config.lookup);

        let (hook, pool) = match config.strategy {
            Strategy::Synchronous => (CreationHook::synchronous(resolver, ActivityNotifier::new(feed)), None),
            Strategy::Deferred => {
                let helper = RetryingTransactionHelper::new(repository, config.retry.clone());
                let pool = MergeWorkerPool::start(MergeWorker::new(helper), config.workers);
                let hook = CreationHook::deferred(resolver, MergeScheduler::new(pool.queue()));
                (hook, Some(pool))
            }
        };
        debug!(strategy = ?config.strategy, lookup = ?config.lookup, "Versioning engine ready");
        Ok(AutoVersioner { hook, pool })
    }

    /// Hands the events recorded on `tx` to the creation hook. Call right before committing.
    #[instrument(skip(self, tx), fields(tx = %tx.id()))]
    pub async fn prepare_commit(&self, tx: &mut Transaction) -> Result<Vec<Resolution>> {
        let mut resolutions = Vec::new();
        for event in tx.take_events() {
            if let Some(resolution) = self.hook.on_event(tx, event).await? {
                resolutions.push(resolution);
            }
        }
        Ok(resolutions)
    }

    /// Runs the creation hook and commits `tx`. If the hook fails, `tx` is rolled back.
    pub async fn commit(&self, mut tx: Transaction) -> Result<Vec<Resolution>> {
        match self.prepare_commit(&mut tx).await {
            Ok(resolutions) => {
                tx.commit().await?;
                Ok(resolutions)
            }
            Err(e) => {
                tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Waits for all deferred merges submitted so far. Returns at once in synchronous mode.
    pub async fn wait_idle(&self) {
        if let Some(pool) = &self.pool {
            pool.wait_idle().await;
        }
    }

    /// Deferred merges that were dropped or gave up.
    pub fn dead_letters(&self) -> Vec<FailedMerge> {
        self.pool.as_ref().map(MergeWorkerPool::dead_letters).unwrap_or_default()
    }

    /// Finishes outstanding merges and stops the worker pool.
    pub async fn shutdown(self) {
        if let Some(pool) = self.pool {
            pool.shutdown().await;
        }
    }
}
