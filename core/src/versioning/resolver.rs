use tracing::{debug, instrument};

use crate::canonical::canonicalize;
use crate::config::LookupStrategy;
use crate::storage::{Error, Flag, Node, Result};
use crate::transaction::Transaction;

/// Finds the existing sibling a newly created document duplicates.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateResolver {
    lookup: LookupStrategy,
}

impl DuplicateResolver {
    pub fn new(lookup: LookupStrategy) -> Self {
        DuplicateResolver { lookup }
    }

    /// Returns `true` if `doc` is an ordinary document filed in a folder.
    pub async fn is_content_document(&self, tx: &mut Transaction, doc: &Node) -> Result<bool> {
        if doc.is_folder() {
            return Ok(false);
        }
        let Some(parent) = doc.parent else {
            return Ok(false);
        };
        match tx.node(parent).await {
            Ok(parent) => Ok(parent.is_folder()),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns the sibling named exactly like the canonical form of `doc`'s name.
    ///
    /// Documents whose name is already canonical never have a target. Folders and
    /// siblings marked [`Flag::Temporary`] are never targets either.
    #[instrument(skip(self, tx, doc), fields(doc = %doc.id, name = %doc.name, lookup = ?self.lookup))]
    pub async fn find_duplicate_target(&self, tx: &mut Transaction, doc: &Node) -> Result<Option<Node>> {
        let canonical = canonicalize(&doc.name);
        if canonical == doc.name {
            return Ok(None);
        }
        let Some(parent) = doc.parent else {
            return Ok(None);
        };

        let candidate = match self.lookup {
            LookupStrategy::Indexed => tx.child_by_name(parent, &canonical).await?,
            LookupStrategy::Scan => tx.children(parent).await?.into_iter().find(|n| n.name == canonical),
        };

        let target = candidate.filter(|n| n.id != doc.id && !n.is_folder() && !n.has_flag(Flag::Temporary));
        match &target {
            Some(target) => debug!(target = %target.id, "Found duplicate target '{}'", canonical),
            None => debug!("No sibling named '{}'", canonical),
        }
        Ok(target)
    }
}
