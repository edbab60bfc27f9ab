use tracing::{debug, info, instrument, warn};

use crate::activity::ActivityNotifier;
use crate::event::RepositoryEvent;
use crate::storage::{Flag, NodeId, Result};
use crate::transaction::Transaction;
use crate::versioning::{DuplicateResolver, MergeReport, MergeScheduler, PendingMergeTask, Resolution};

enum Mode {
    Synchronous(ActivityNotifier),
    Deferred(MergeScheduler),
}

/// Reacts to document creation by folding duplicates into the document they shadow.
///
/// The hook runs inside the creating transaction, right before it commits. In the
/// synchronous mode the merge happens there and then; in the deferred mode the duplicate is
/// only hidden and a merge task is handed to the [`MergeScheduler`].
pub struct CreationHook {
    resolver: DuplicateResolver,
    mode: Mode,
}

impl CreationHook {
    pub fn synchronous(resolver: DuplicateResolver, notifier: ActivityNotifier) -> Self {
        CreationHook { resolver, mode: Mode::Synchronous(notifier) }
    }

    pub fn deferred(resolver: DuplicateResolver, scheduler: MergeScheduler) -> Self {
        CreationHook { resolver, mode: Mode::Deferred(scheduler) }
    }

    pub async fn on_event(&self, tx: &mut Transaction, event: RepositoryEvent) -> Result<Option<Resolution>> {
        match event {
            RepositoryEvent::DocumentCreated { node } => self.on_document_created(tx, node).await,
        }
    }

    #[instrument(skip(self, tx), fields(tx = %tx.id()))]
    async fn on_document_created(&self, tx: &mut Transaction, node: NodeId) -> Result<Option<Resolution>> {
        if !tx.exists(node).await? {
            debug!("Created node is already gone");
            return Ok(None);
        }
        let doc = tx.node(node).await?;
        if !self.resolver.is_content_document(tx, &doc).await? {
            return Ok(None);
        }
        let Some(target) = self.resolver.find_duplicate_target(tx, &doc).await? else {
            return Ok(None);
        };
        let task = PendingMergeTask { duplicate: doc.id, target: target.id };

        match &self.mode {
            Mode::Synchronous(notifier) => {
                let content = tx.reader(doc.id).await?;
                let version = tx.put_content(target.id, content).await?;
                tx.add_flag(doc.id, Flag::Hidden).await?;

                let target = tx.node(target.id).await?;
                if let Err(e) = notifier.notify_updated(tx, &target).await {
                    warn!(target = %target.id, "Failed to post update activity: {}", e);
                }

                tx.delete(doc.id).await?;
                info!(target = %target.id, version = %version.label, "Merged '{}' into '{}'", doc.name, target.name);
                Ok(Some(Resolution::Merged(MergeReport { duplicate: doc.id, target: target.id, version })))
            }
            Mode::Deferred(scheduler) => {
                tx.add_flag(doc.id, Flag::Hidden).await?;
                tx.add_flag(doc.id, Flag::Temporary).await?;
                scheduler.register(tx, task);
                debug!(target = %target.id, "Deferred merge of '{}' into '{}'", doc.name, target.name);
                Ok(Some(Resolution::Scheduled(task)))
            }
        }
    }
}
