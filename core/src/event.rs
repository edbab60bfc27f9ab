use crate::storage::NodeId;

/// Repository events the engine reacts to.
///
/// Events are recorded on the [`Transaction`](crate::transaction::Transaction) that caused
/// them and handed to the creation hook just before that transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryEvent {
    /// A document was created in a folder.
    DocumentCreated { node: NodeId },
}

impl RepositoryEvent {
    /// The node the event is about.
    pub fn node(&self) -> NodeId {
        match self {
            RepositoryEvent::DocumentCreated { node } => *node,
        }
    }
}
