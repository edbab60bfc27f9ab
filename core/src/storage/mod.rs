//! Contracts for the host content repository the engine runs inside.
//!
//! The engine does not own documents. It reads and flags nodes, streams content and deletes
//! duplicates through a small set of collaborator traits that a host repository implements.
//! An in-memory host, [`MemoryRepository`], ships with the crate and backs the tests and the
//! command line front end.
//!
//! # Core Concepts
//!
//! *   **[`Node`]:** A snapshot of a folder or document in the hierarchical store. Nodes are
//!     addressed by a [`NodeId`], which renders as a node reference
//!     (`workspace://SpacesStore/<uuid>`). Sibling names are unique; the store rejects a
//!     duplicate name with [`Error::NameConflict`].
//! *   **[`Flag`]s:** Markers on a node. [`Flag::Hidden`] removes a node from listings and
//!     activity feeds, [`Flag::Temporary`] marks it as pending removal.
//! *   **[`StoreTransaction`]:** One isolated unit of work against the store. It combines the
//!     node operations of [`NodeService`] with the content operations of [`ContentService`].
//!     Hosts hand it out wrapped in a [`Transaction`](crate::transaction::Transaction), which
//!     carries the engine's per-transaction state.
//! *   **[`Repository`]:** Opens transactions under a given [`Identity`]. Opening one as
//!     [`Identity::System`] is how the engine switches to an elevated execution context.
//!
//! # Concurrency
//!
//! Stores are expected to isolate transactions and detect concurrent writers optimistically.
//! A commit that loses such a race fails with [`Error::TransientConflict`], which the
//! [`RetryingTransactionHelper`](crate::transaction::RetryingTransactionHelper) absorbs by
//! re-running the whole unit of work.

pub use self::memory::MemoryRepository;

pub mod memory;

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::transaction::Transaction;

/// Store protocol and store name used when rendering node references.
pub const STORE_REF: &str = "workspace://SpacesStore";

/// Name of the folder holding a site's documents, used to scope document activities.
pub const DOCUMENT_LIBRARY: &str = "documentLibrary";

/// Stable reference to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        NodeId(Uuid::new_v4())
    }

    pub fn uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", STORE_REF, self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Folder,
    Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flag {
    /// Excluded from listings and activity feeds.
    Hidden,
    /// Pending removal; never a merge target.
    Temporary,
}

/// A version of a document's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentVersion {
    pub label: String,
    pub size: u64,
}

/// Snapshot of a node as seen by the transaction that read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
    pub flags: BTreeSet<Flag>,
    /// User allowed to modify the node. `None` means anyone may.
    pub owner: Option<String>,
    /// Current content version, if the node has content.
    pub content: Option<ContentVersion>,
}

impl Node {
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// Returns `true` unless the node is hidden.
    pub fn is_visible(&self) -> bool {
        !self.has_flag(Flag::Hidden)
    }
}

/// The identity a transaction runs as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    User(String),
    /// Elevated identity, not subject to per-node permissions.
    System,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::User(name) => f.write_str(name),
            Identity::System => f.write_str("System"),
        }
    }
}

/// The site (collaboration space) a node lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteInfo {
    pub short_name: String,
}

/// Readable stream over a document's content.
pub type ContentReader = Box<dyn AsyncRead + Send + Unpin>;

/// Node operations of the hierarchical store, scoped to one transaction.
#[async_trait]
pub trait NodeService: Send {
    async fn exists(&mut self, id: NodeId) -> Result<bool>;

    /// Reads a node. Fails with [`Error::NotFound`] if it does not exist.
    async fn node(&mut self, id: NodeId) -> Result<Node>;

    async fn add_flag(&mut self, id: NodeId, flag: Flag) -> Result<()>;

    async fn remove_flag(&mut self, id: NodeId, flag: Flag) -> Result<()>;

    /// Enumerates the children of a folder, consistent with this transaction's own writes.
    async fn children(&mut self, folder: NodeId) -> Result<Vec<Node>>;

    /// Looks up a child by exact name.
    ///
    /// Hosts may answer from an index that lags behind the transaction, so a child created
    /// in the same transaction is not guaranteed to be found.
    async fn child_by_name(&mut self, folder: NodeId, name: &str) -> Result<Option<Node>>;

    /// Creates a node. Prefer [`Transaction::create_document`], which also records the
    /// creation event.
    async fn create_node(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> Result<Node>;

    /// Deletes a node (and, for folders, everything below it).
    async fn delete(&mut self, id: NodeId) -> Result<()>;

    /// Returns the site containing the node, if any.
    async fn site_of(&mut self, id: NodeId) -> Result<Option<SiteInfo>>;
}

/// Content operations of the binary content store, scoped to one transaction.
#[async_trait]
pub trait ContentService: Send {
    /// Opens the current content of a document. Documents without content read as empty.
    async fn reader(&mut self, id: NodeId) -> Result<ContentReader>;

    /// Streams `content` into the document as a new version.
    async fn put_content(&mut self, id: NodeId, content: ContentReader) -> Result<ContentVersion>;
}

/// A store transaction as handed out by a [`Repository`].
#[async_trait]
pub trait StoreTransaction: NodeService + ContentService {
    fn identity(&self) -> &Identity;

    /// Makes the transaction's writes durable and visible.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discards the transaction's writes.
    async fn rollback(self: Box<Self>);
}

/// Entry point of a host repository.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Opens a transaction running as `identity`.
    async fn begin(&self, identity: Identity) -> Result<Transaction>;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Node not found: {0}")]
    NotFound(NodeId),

    #[error("Concurrent modification of node {0}")]
    TransientConflict(NodeId),

    #[error("User '{user}' may not modify node {node}")]
    PermissionDenied { user: String, node: NodeId },

    #[error("A node named '{name}' already exists in folder {parent}")]
    NameConflict { parent: NodeId, name: String },

    #[error("Node is not a folder: {0}")]
    NotAFolder(NodeId),

    #[error("Node is not a document: {0}")]
    NotADocument(NodeId),

    #[error("Payload serialization/deserialization error")]
    Encoding(#[from] serde_json::Error),

    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("Configuration file is missing or unreadable: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Activity feed rejected the activity: {0}")]
    ActivityFeed(String),

    #[error("Gave up after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Returns `true` for errors worth retrying in a fresh transaction.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientConflict(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
