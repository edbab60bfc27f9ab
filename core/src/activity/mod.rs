//! Activity feed contract and the "document updated" notification.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument};
use url::form_urlencoded;

use crate::storage::{Node, Result, SiteInfo, DOCUMENT_LIBRARY};
use crate::transaction::Transaction;

/// Activity type posted by hosts when a document is added to a folder.
pub const FILE_ADDED: &str = "org.alfresco.documentlibrary.file-added";

/// Activity type posted when an existing document receives new content.
pub const FILE_UPDATED: &str = "org.alfresco.documentlibrary.file-updated";

/// An entry for the activity feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    pub activity_type: String,
    /// Short name of the site the activity belongs to; `None` for unscoped activities.
    pub site: Option<String>,
    /// Container within the site, e.g. the document library.
    pub container: Option<String>,
    /// JSON payload.
    pub data: String,
}

/// Destination for activities.
#[async_trait]
pub trait ActivityFeed: Send + Sync {
    async fn post(&self, activity: Activity) -> Result<()>;
}

#[derive(Serialize)]
struct DocumentActivityData<'a> {
    title: &'a str,
    #[serde(rename = "nodeRef")]
    node_ref: String,
    page: String,
}

/// Builds the activity for `node` of the given type, scoped to `site` if there is one.
pub fn document_activity(activity_type: &str, node: &Node, site: Option<&SiteInfo>) -> Result<Activity> {
    let node_ref = node.id.to_string();
    let page = format!(
        "document-details?nodeRef={}",
        form_urlencoded::byte_serialize(node_ref.as_bytes()).collect::<String>()
    );
    let data = serde_json::to_string(&DocumentActivityData { title: &node.name, node_ref, page })?;

    Ok(Activity {
        activity_type: activity_type.to_string(),
        site: site.map(|s| s.short_name.clone()),
        container: site.map(|_| DOCUMENT_LIBRARY.to_string()),
        data,
    })
}

/// Posts "updated" activities for documents that absorbed a duplicate.
///
/// A duplicate is hidden before it is removed, so it never shows up in the feed as added;
/// the notifier makes sure the feed still reflects that the target changed.
#[derive(Clone)]
pub struct ActivityNotifier {
    feed: Arc<dyn ActivityFeed>,
}

impl ActivityNotifier {
    pub fn new(feed: Arc<dyn ActivityFeed>) -> Self {
        ActivityNotifier { feed }
    }

    #[instrument(skip(self, tx, target), fields(target = %target.id))]
    pub async fn notify_updated(&self, tx: &mut Transaction, target: &Node) -> Result<()> {
        let site = tx.site_of(target.id).await?;
        let activity = document_activity(FILE_UPDATED, target, site.as_ref())?;
        debug!(site = ?activity.site, "Posting update activity");
        self.feed.post(activity).await
    }
}

/// Feed that keeps activities in memory, oldest first.
#[derive(Debug, Default)]
pub struct MemoryActivityFeed {
    activities: Mutex<Vec<Activity>>,
}

impl MemoryActivityFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activities(&self) -> Vec<Activity> {
        self.activities.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Activities of one type.
    pub fn of_type(&self, activity_type: &str) -> Vec<Activity> {
        self.activities()
            .into_iter()
            .filter(|a| a.activity_type == activity_type)
            .collect()
    }
}

#[async_trait]
impl ActivityFeed for MemoryActivityFeed {
    async fn post(&self, activity: Activity) -> Result<()> {
        self.activities.lock().unwrap_or_else(PoisonError::into_inner).push(activity);
        Ok(())
    }
}
