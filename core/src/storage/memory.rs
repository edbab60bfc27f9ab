use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument, warn};

use crate::activity::{document_activity, Activity, ActivityFeed, FILE_ADDED};
use crate::storage::{
    ContentReader, ContentService, ContentVersion, Error, Flag, Identity, Node, NodeId, NodeKind,
    NodeService, Repository, Result, SiteInfo, StoreTransaction, DOCUMENT_LIBRARY,
};
use crate::transaction::Transaction;

/// Name of the root folder.
pub const ROOT_NAME: &str = "Company Home";

#[derive(Debug, Clone)]
struct StoredVersion {
    label: String,
    bytes: Arc<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct NodeRecord {
    id: NodeId,
    name: String,
    parent: Option<NodeId>,
    kind: NodeKind,
    flags: BTreeSet<Flag>,
    owner: Option<String>,
    // Set on site root folders.
    site: Option<String>,
    versions: Vec<StoredVersion>,
    // Commit counter value of the last commit that wrote this record.
    stamp: u64,
}

impl NodeRecord {
    fn new(id: NodeId, name: &str, parent: Option<NodeId>, kind: NodeKind, owner: Option<String>) -> Self {
        NodeRecord {
            id,
            name: name.to_string(),
            parent,
            kind,
            flags: BTreeSet::new(),
            owner,
            site: None,
            versions: Vec::new(),
            stamp: 0,
        }
    }

    fn snapshot(&self) -> Node {
        Node {
            id: self.id,
            name: self.name.clone(),
            parent: self.parent,
            kind: self.kind,
            flags: self.flags.clone(),
            owner: self.owner.clone(),
            content: self.versions.last().map(|v| ContentVersion {
                label: v.label.clone(),
                size: v.bytes.len() as u64,
            }),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    nodes: HashMap<NodeId, NodeRecord>,
    // Committed name index: folder -> child name -> child.
    children: HashMap<NodeId, BTreeMap<String, NodeId>>,
    clock: u64,
    // Commits writing one of these nodes fail with a transient conflict, once per count.
    injected_conflicts: HashMap<NodeId, usize>,
}

/// In-memory host repository.
///
/// Transactions read through to the committed state and stage their writes privately.
/// Commits are validated optimistically: a transaction that writes a node another commit
/// changed since it was read fails with [`Error::TransientConflict`]. The name index behind
/// [`NodeService::child_by_name`] only covers committed nodes, while
/// [`NodeService::children`] also sees the transaction's own writes.
///
/// Users may modify nodes they own and nodes without an owner; [`Identity::System`] may
/// modify anything. On commit, an "added" activity is posted for every visible document the
/// transaction created.
#[derive(Clone)]
pub struct MemoryRepository {
    state: Arc<Mutex<State>>,
    feed: Arc<dyn ActivityFeed>,
    root: NodeId,
}

impl MemoryRepository {
    pub fn new(feed: Arc<dyn ActivityFeed>) -> Self {
        let root = NodeId::new();
        let mut state = State::default();
        state.nodes.insert(root, NodeRecord::new(root, ROOT_NAME, None, NodeKind::Folder, None));
        MemoryRepository { state: Arc::new(Mutex::new(state)), feed, root }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Creates a site below the root and returns its document library folder.
    #[instrument(skip(self))]
    pub fn create_site(&self, short_name: &str) -> Result<NodeId> {
        let mut state = lock(&self.state);
        let root_children = state.children.entry(self.root).or_default();
        if root_children.contains_key(short_name) {
            return Err(Error::NameConflict { parent: self.root, name: short_name.to_string() });
        }
        let site_id = NodeId::new();
        let library_id = NodeId::new();
        root_children.insert(short_name.to_string(), site_id);
        state.children.entry(site_id).or_default().insert(DOCUMENT_LIBRARY.to_string(), library_id);

        let mut site = NodeRecord::new(site_id, short_name, Some(self.root), NodeKind::Folder, None);
        site.site = Some(short_name.to_string());
        let library = NodeRecord::new(library_id, DOCUMENT_LIBRARY, Some(site_id), NodeKind::Folder, None);
        state.nodes.insert(site_id, site);
        state.nodes.insert(library_id, library);
        debug!("Created site with document library {}", library_id);
        Ok(library_id)
    }

    /// Makes the next `count` commits that write `node` fail with a transient conflict.
    pub fn inject_conflicts(&self, node: NodeId, count: usize) {
        *lock(&self.state).injected_conflicts.entry(node).or_default() += count;
    }

    /// Committed version history of a document, oldest first.
    pub fn version_history(&self, id: NodeId) -> Result<Vec<ContentVersion>> {
        let state = lock(&self.state);
        let record = state.nodes.get(&id).ok_or(Error::NotFound(id))?;
        Ok(record
            .versions
            .iter()
            .map(|v| ContentVersion { label: v.label.clone(), size: v.bytes.len() as u64 })
            .collect())
    }

    /// Committed content of a document's current version.
    pub fn content(&self, id: NodeId) -> Result<Vec<u8>> {
        let state = lock(&self.state);
        let record = state.nodes.get(&id).ok_or(Error::NotFound(id))?;
        Ok(record.versions.last().map(|v| v.bytes.as_ref().clone()).unwrap_or_default())
    }

    /// Committed snapshot of a node, outside of any transaction.
    pub fn get(&self, id: NodeId) -> Option<Node> {
        lock(&self.state).nodes.get(&id).map(NodeRecord::snapshot)
    }

    /// Committed children of a folder that are not hidden, by name.
    pub fn list_visible(&self, folder: NodeId) -> Vec<Node> {
        let state = lock(&self.state);
        state
            .children
            .get(&folder)
            .into_iter()
            .flat_map(|names| names.values())
            .filter_map(|id| state.nodes.get(id))
            .filter(|record| !record.flags.contains(&Flag::Hidden))
            .map(NodeRecord::snapshot)
            .collect()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn begin(&self, identity: Identity) -> Result<Transaction> {
        Ok(Transaction::new(Box::new(MemoryTransaction {
            state: self.state.clone(),
            feed: self.feed.clone(),
            identity,
            read_stamps: HashMap::new(),
            staged: HashMap::new(),
            staged_names: HashSet::new(),
            created: Vec::new(),
        })))
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    feed: Arc<dyn ActivityFeed>,
    identity: Identity,
    // Stamp of each committed node at the time this transaction first read it.
    read_stamps: HashMap<NodeId, u64>,
    // Pending writes; `None` marks a deletion.
    staged: HashMap<NodeId, Option<NodeRecord>>,
    // Names claimed by nodes created in this transaction.
    staged_names: HashSet<(NodeId, String)>,
    created: Vec<NodeId>,
}

impl MemoryTransaction {
    fn load(&mut self, id: NodeId) -> Option<NodeRecord> {
        if let Some(staged) = self.staged.get(&id) {
            return staged.clone();
        }
        let record = lock(&self.state).nodes.get(&id).cloned();
        if let Some(record) = &record {
            self.read_stamps.entry(id).or_insert(record.stamp);
        }
        record
    }

    fn require(&mut self, id: NodeId) -> Result<NodeRecord> {
        self.load(id).ok_or(Error::NotFound(id))
    }

    fn ensure_writable(&self, record: &NodeRecord) -> Result<()> {
        match (&self.identity, &record.owner) {
            (Identity::System, _) | (_, None) => Ok(()),
            (Identity::User(user), Some(owner)) if user == owner => Ok(()),
            (Identity::User(user), Some(_)) => Err(Error::PermissionDenied { user: user.clone(), node: record.id }),
        }
    }

    fn stage(&mut self, record: NodeRecord) {
        self.staged.insert(record.id, Some(record));
    }

    fn child_ids(&mut self, folder: NodeId) -> Vec<NodeId> {
        let mut ids: BTreeSet<NodeId> = lock(&self.state)
            .children
            .get(&folder)
            .map(|names| names.values().copied().collect())
            .unwrap_or_default();
        for (id, staged) in &self.staged {
            if let Some(record) = staged {
                if record.parent == Some(folder) {
                    ids.insert(*id);
                }
            }
        }
        ids.into_iter().collect()
    }

    fn name_taken(&mut self, parent: NodeId, name: &str) -> bool {
        if self.staged_names.contains(&(parent, name.to_string())) {
            return true;
        }
        let committed = lock(&self.state).children.get(&parent).and_then(|names| names.get(name).copied());
        match committed {
            // Deleted in this transaction frees the name.
            Some(id) => !matches!(self.staged.get(&id), Some(None)),
            None => false,
        }
    }

    fn site_of_record(&mut self, id: NodeId) -> Option<SiteInfo> {
        let mut current = self.load(id);
        while let Some(record) = current {
            if let Some(short_name) = &record.site {
                return Some(SiteInfo { short_name: short_name.clone() });
            }
            current = record.parent.and_then(|parent| self.load(parent));
        }
        None
    }

    /// Validates the write set against the committed state and applies it.
    fn apply(&mut self) -> Result<()> {
        let mut state = lock(&self.state);

        for (id, staged) in &self.staged {
            if let Some(remaining) = state.injected_conflicts.get_mut(id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    debug!("Injected conflict on {}", id);
                    return Err(Error::TransientConflict(*id));
                }
            }
            let committed = state.nodes.get(id);
            match (self.read_stamps.get(id), committed) {
                (Some(seen), Some(current)) if current.stamp != *seen => {
                    return Err(Error::TransientConflict(*id));
                }
                // Removed by someone else since we read it.
                (Some(_), None) => return Err(Error::TransientConflict(*id)),
                (None, None) => {
                    if let Some(record) = staged {
                        let taken = record
                            .parent
                            .and_then(|parent| state.children.get(&parent).and_then(|names| names.get(&record.name)))
                            // A sibling deleted in this transaction frees its name.
                            .filter(|other| !matches!(self.staged.get(*other), Some(None)));
                        if taken.is_some() {
                            return Err(Error::NameConflict {
                                parent: record.parent.unwrap_or_default(),
                                name: record.name.clone(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }

        state.clock += 1;
        let stamp = state.clock;
        let writes: Vec<_> = self.staged.drain().collect();
        for (id, _) in &writes {
            if let Some(old) = state.nodes.remove(id) {
                if let Some(names) = old.parent.and_then(|parent| state.children.get_mut(&parent)) {
                    names.remove(&old.name);
                }
            }
        }
        for (id, staged) in writes {
            match staged {
                Some(mut record) => {
                    if let Some(parent) = record.parent {
                        state.children.entry(parent).or_default().insert(record.name.clone(), id);
                    }
                    record.stamp = stamp;
                    state.nodes.insert(id, record);
                }
                None => {
                    state.children.remove(&id);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NodeService for MemoryTransaction {
    async fn exists(&mut self, id: NodeId) -> Result<bool> {
        Ok(self.load(id).is_some())
    }

    async fn node(&mut self, id: NodeId) -> Result<Node> {
        Ok(self.require(id)?.snapshot())
    }

    async fn add_flag(&mut self, id: NodeId, flag: Flag) -> Result<()> {
        let mut record = self.require(id)?;
        self.ensure_writable(&record)?;
        if record.flags.insert(flag) {
            self.stage(record);
        }
        Ok(())
    }

    async fn remove_flag(&mut self, id: NodeId, flag: Flag) -> Result<()> {
        let mut record = self.require(id)?;
        self.ensure_writable(&record)?;
        if record.flags.remove(&flag) {
            self.stage(record);
        }
        Ok(())
    }

    async fn children(&mut self, folder: NodeId) -> Result<Vec<Node>> {
        let parent = self.require(folder)?;
        if parent.kind != NodeKind::Folder {
            return Err(Error::NotAFolder(folder));
        }
        let mut nodes = Vec::new();
        for id in self.child_ids(folder) {
            if let Some(record) = self.load(id) {
                if record.parent == Some(folder) {
                    nodes.push(record.snapshot());
                }
            }
        }
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn child_by_name(&mut self, folder: NodeId, name: &str) -> Result<Option<Node>> {
        let parent = self.require(folder)?;
        if parent.kind != NodeKind::Folder {
            return Err(Error::NotAFolder(folder));
        }
        let indexed = lock(&self.state).children.get(&folder).and_then(|names| names.get(name).copied());
        Ok(indexed
            .and_then(|id| self.load(id))
            .filter(|record| record.parent == Some(folder) && record.name == name)
            .map(|record| record.snapshot()))
    }

    async fn create_node(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> Result<Node> {
        let folder = self.require(parent)?;
        if folder.kind != NodeKind::Folder {
            return Err(Error::NotAFolder(parent));
        }
        if self.name_taken(parent, name) {
            return Err(Error::NameConflict { parent, name: name.to_string() });
        }
        let owner = match &self.identity {
            Identity::User(user) => Some(user.clone()),
            Identity::System => None,
        };
        let record = NodeRecord::new(NodeId::new(), name, Some(parent), kind, owner);
        let node = record.snapshot();
        self.staged_names.insert((parent, name.to_string()));
        self.created.push(record.id);
        self.stage(record);
        Ok(node)
    }

    async fn delete(&mut self, id: NodeId) -> Result<()> {
        let record = self.require(id)?;
        self.ensure_writable(&record)?;

        let mut doomed = vec![record];
        while let Some(record) = doomed.pop() {
            if record.kind == NodeKind::Folder {
                for child in self.child_ids(record.id) {
                    if let Some(child) = self.load(child) {
                        doomed.push(child);
                    }
                }
            }
            if let Some(parent) = record.parent {
                self.staged_names.remove(&(parent, record.name.clone()));
            }
            self.staged.insert(record.id, None);
        }
        Ok(())
    }

    async fn site_of(&mut self, id: NodeId) -> Result<Option<SiteInfo>> {
        self.require(id)?;
        Ok(self.site_of_record(id))
    }
}

#[async_trait]
impl ContentService for MemoryTransaction {
    async fn reader(&mut self, id: NodeId) -> Result<ContentReader> {
        let record = self.require(id)?;
        if record.kind != NodeKind::Document {
            return Err(Error::NotADocument(id));
        }
        let bytes = record.versions.last().map(|v| v.bytes.as_ref().clone()).unwrap_or_default();
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn put_content(&mut self, id: NodeId, mut content: ContentReader) -> Result<ContentVersion> {
        let mut record = self.require(id)?;
        if record.kind != NodeKind::Document {
            return Err(Error::NotADocument(id));
        }
        self.ensure_writable(&record)?;

        let mut bytes = Vec::new();
        content.read_to_end(&mut bytes).await?;
        let label = next_label(record.versions.last().map(|v| v.label.as_str()));
        let version = ContentVersion { label: label.clone(), size: bytes.len() as u64 };
        record.versions.push(StoredVersion { label, bytes: Arc::new(bytes) });
        self.stage(record);
        Ok(version)
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        // Work out the host's own activities before taking the commit lock.
        let mut added: Vec<Activity> = Vec::new();
        for id in std::mem::take(&mut this.created) {
            let Some(Some(record)) = this.staged.get(&id).cloned() else { continue };
            if record.kind != NodeKind::Document || record.flags.contains(&Flag::Hidden) {
                continue;
            }
            let site = this.site_of_record(id);
            added.push(document_activity(FILE_ADDED, &record.snapshot(), site.as_ref())?);
        }

        this.apply()?;

        for activity in added {
            if let Err(e) = this.feed.post(activity).await {
                warn!("Failed to post activity: {}", e);
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        debug!("Discarding {} staged writes", self.staged.len());
    }
}

fn next_label(previous: Option<&str>) -> String {
    let Some(previous) = previous else {
        return "1.0".to_string();
    };
    match previous.split_once('.') {
        Some((major, minor)) => match minor.parse::<u32>() {
            Ok(minor) => format!("{}.{}", major, minor + 1),
            Err(_) => format!("{}.1", previous),
        },
        None => format!("{}.1", previous),
    }
}
