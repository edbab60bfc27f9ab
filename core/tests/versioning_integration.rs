use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use autoversion_core::activity::{Activity, ActivityFeed, MemoryActivityFeed, FILE_ADDED, FILE_UPDATED};
use autoversion_core::config::{EngineConfig, LookupStrategy, RetryPolicy, Strategy};
use autoversion_core::storage::{Error, Flag, Identity, MemoryRepository, NodeId, NodeKind, Repository};
use autoversion_core::transaction::Transaction;
use autoversion_core::versioning::{AutoVersioner, FailureReason, Resolution};

struct Fixture {
    repo: Arc<MemoryRepository>,
    feed: Arc<MemoryActivityFeed>,
    library: NodeId,
    engine: AutoVersioner,
}

fn config(strategy: Strategy) -> EngineConfig {
    EngineConfig {
        strategy,
        lookup: LookupStrategy::Scan,
        workers: 2,
        retry: RetryPolicy { max_attempts: 3, initial_backoff_ms: 1, max_backoff_ms: 5 },
    }
}

fn fixture(config: EngineConfig) -> Fixture {
    let feed = Arc::new(MemoryActivityFeed::new());
    let repo = Arc::new(MemoryRepository::new(feed.clone()));
    let library = repo.create_site("finance").expect("Test helper: Failed to create site");
    let engine = AutoVersioner::new(repo.clone(), feed.clone(), config).expect("Test helper: Failed to build engine");
    Fixture { repo, feed, library, engine }
}

fn user(name: &str) -> Identity {
    Identity::User(name.to_string())
}

impl Fixture {
    async fn begin(&self, identity: Identity) -> Transaction {
        self.repo.begin(identity).await.expect("Test helper: Failed to begin transaction")
    }

    /// Uploads one file the way a host does and commits through the engine.
    async fn upload(&self, identity: Identity, name: &str, content: &str) -> Vec<Resolution> {
        let mut tx = self.begin(identity).await;
        tx.upload_document(self.library, name, content.as_bytes().to_vec()).await.expect("Upload failed");
        self.engine.commit(tx).await.expect("Commit failed")
    }

    fn visible_names(&self) -> Vec<String> {
        self.repo.list_visible(self.library).into_iter().map(|n| n.name).collect()
    }

    fn only_visible(&self) -> NodeId {
        let visible = self.repo.list_visible(self.library);
        assert_eq!(visible.len(), 1, "Expected a single visible document");
        visible[0].id
    }

    fn labels(&self, id: NodeId) -> Vec<String> {
        self.repo.version_history(id).unwrap().into_iter().map(|v| v.label).collect()
    }

    fn text(&self, id: NodeId) -> String {
        String::from_utf8(self.repo.content(id).unwrap()).unwrap()
    }
}

#[tokio::test]
async fn synchronous_merge_versions_target_and_posts_update() {
    let f = fixture(config(Strategy::Synchronous));
    assert!(f.upload(user("alice"), "Invoice.pdf", "v1").await.is_empty());
    let target = f.only_visible();

    // 1. Uploading the same name again lands as Invoice-1.pdf and is merged right away
    let resolutions = f.upload(user("alice"), "Invoice.pdf", "v2").await;
    let report = match resolutions.as_slice() {
        [Resolution::Merged(report)] => report.clone(),
        other => panic!("Expected one merge, got {:?}", other),
    };
    assert_eq!(report.target, target);
    assert_eq!(report.version.label, "1.1");

    // 2. One document with two versions, duplicate gone
    assert_eq!(f.visible_names(), vec!["Invoice.pdf"]);
    assert!(f.repo.get(report.duplicate).is_none(), "Duplicate should be deleted");
    assert_eq!(f.labels(target), vec!["1.0", "1.1"]);
    assert_eq!(f.text(target), "v2");

    // 3. The feed shows the update, but never the duplicate as added
    let updated = f.feed.of_type(FILE_UPDATED);
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].site.as_deref(), Some("finance"));
    assert!(updated[0].data.contains("Invoice.pdf"));
    assert_eq!(f.feed.of_type(FILE_ADDED).len(), 1);
}

/// Feed that refuses "updated" activities and records everything else.
struct RejectingFeed {
    inner: Arc<MemoryActivityFeed>,
}

#[async_trait]
impl ActivityFeed for RejectingFeed {
    async fn post(&self, activity: Activity) -> autoversion_core::storage::Result<()> {
        if activity.activity_type == FILE_UPDATED {
            return Err(Error::ActivityFeed("feed unavailable".to_string()));
        }
        self.inner.post(activity).await
    }
}

#[tokio::test]
async fn synchronous_merge_survives_feed_failure() {
    let recorded = Arc::new(MemoryActivityFeed::new());
    let repo = Arc::new(MemoryRepository::new(recorded.clone()));
    let library = repo.create_site("finance").expect("Failed to create site");
    let feed = Arc::new(RejectingFeed { inner: recorded.clone() });
    let engine = AutoVersioner::new(repo.clone(), feed, config(Strategy::Synchronous)).expect("Failed to build engine");
    let f = Fixture { repo, feed: recorded, library, engine };

    assert!(f.upload(user("alice"), "x.txt", "v1").await.is_empty());
    let target = f.only_visible();

    // 1. The merge commits even though posting the update fails
    let resolutions = f.upload(user("alice"), "x.txt", "v2").await;
    let report = match resolutions.as_slice() {
        [Resolution::Merged(report)] => report.clone(),
        other => panic!("Expected one merge, got {:?}", other),
    };
    assert_eq!(report.target, target);

    // 2. Duplicate gone, target versioned
    assert_eq!(f.visible_names(), vec!["x.txt"]);
    assert!(f.repo.get(report.duplicate).is_none(), "Duplicate should be deleted");
    assert_eq!(f.labels(target), vec!["1.0", "1.1"]);
    assert_eq!(f.text(target), "v2");

    // 3. Nothing reached the feed for the update
    assert!(f.feed.of_type(FILE_UPDATED).is_empty());
    assert_eq!(f.feed.of_type(FILE_ADDED).len(), 1);
}

#[tokio::test]
async fn deferred_merge_runs_after_commit_without_activity() {
    let f = fixture(config(Strategy::Deferred));
    f.upload(user("alice"), "Invoice.pdf", "v1").await;
    let target = f.only_visible();

    let resolutions = f.upload(user("alice"), "Invoice.pdf", "v2").await;
    let task = match resolutions.as_slice() {
        [Resolution::Scheduled(task)] => *task,
        other => panic!("Expected one scheduled merge, got {:?}", other),
    };
    assert_eq!(task.target, target);
    // Hidden or already merged, never listed.
    assert_eq!(f.visible_names(), vec!["Invoice.pdf"]);

    f.engine.wait_idle().await;
    assert!(f.engine.dead_letters().is_empty());
    assert!(f.repo.get(task.duplicate).is_none(), "Duplicate should be deleted");
    assert_eq!(f.labels(target), vec!["1.0", "1.1"]);
    assert_eq!(f.text(target), "v2");
    assert!(f.feed.of_type(FILE_UPDATED).is_empty());
    assert_eq!(f.feed.of_type(FILE_ADDED).len(), 1);
}

#[tokio::test]
async fn numbered_name_without_original_is_left_alone() {
    for strategy in [Strategy::Synchronous, Strategy::Deferred] {
        let f = fixture(config(strategy));
        assert!(f.upload(user("alice"), "Invoice-1.pdf", "only").await.is_empty());
        f.engine.wait_idle().await;

        let id = f.only_visible();
        let node = f.repo.get(id).unwrap();
        assert_eq!(node.name, "Invoice-1.pdf");
        assert!(node.flags.is_empty(), "Document should not be flagged");
        assert_eq!(f.text(id), "only");
        assert_eq!(f.feed.of_type(FILE_ADDED).len(), 1);
    }
}

#[tokio::test]
async fn scan_finds_target_among_many_siblings() {
    let f = fixture(config(Strategy::Synchronous));

    let mut tx = f.begin(Identity::System).await;
    for i in 0..5_000 {
        tx.create_node(f.library, &format!("Sheet {:04}.csv", i), NodeKind::Document).await.unwrap();
    }
    let data = tx.create_node(f.library, "Data.csv", NodeKind::Document).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = f.begin(user("alice")).await;
    tx.create_document(f.library, "Data-12.csv", Box::new(Cursor::new(b"a,b".to_vec()))).await.unwrap();
    let resolutions = f.engine.commit(tx).await.unwrap();

    assert!(matches!(resolutions.as_slice(), [Resolution::Merged(r)] if r.target == data.id));
    assert_eq!(f.text(data.id), "a,b");
    assert_eq!(f.repo.list_visible(f.library).len(), 5_001);
}

#[tokio::test]
async fn target_deleted_before_merge_leaves_duplicate_hidden() {
    let f = fixture(config(Strategy::Deferred));
    f.upload(user("alice"), "Invoice.pdf", "v1").await;
    let target = f.only_visible();

    // 1. The hook runs and schedules the merge
    let mut tx = f.begin(user("alice")).await;
    let duplicate = tx.upload_document(f.library, "Invoice.pdf", b"v2".to_vec()).await.unwrap();
    let resolutions = f.engine.prepare_commit(&mut tx).await.unwrap();
    assert_eq!(resolutions.len(), 1);

    // 2. Someone removes the target before the upload commits
    let mut other = f.begin(user("alice")).await;
    other.delete(target).await.unwrap();
    other.commit().await.unwrap();

    // 3. The upload still commits; the worker drops the task
    tx.commit().await.expect("Upload should commit");
    f.engine.wait_idle().await;

    let dead = f.engine.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task.duplicate, duplicate.id);
    assert_eq!(dead[0].reason, FailureReason::Missing(target));
    assert_eq!(dead[0].attempts, 1);

    let orphan = f.repo.get(duplicate.id).expect("Duplicate should survive");
    assert!(orphan.has_flag(Flag::Hidden));
    assert!(orphan.has_flag(Flag::Temporary));
    assert!(f.visible_names().is_empty());
}

#[tokio::test]
async fn rollback_discards_scheduled_merges() {
    let f = fixture(config(Strategy::Deferred));
    f.upload(user("alice"), "Invoice.pdf", "v1").await;
    let target = f.only_visible();

    let mut tx = f.begin(user("alice")).await;
    let duplicate = tx.upload_document(f.library, "Invoice.pdf", b"v2".to_vec()).await.unwrap();
    assert_eq!(f.engine.prepare_commit(&mut tx).await.unwrap().len(), 1);
    tx.rollback().await;

    f.engine.wait_idle().await;
    assert!(f.engine.dead_letters().is_empty());
    assert!(f.repo.get(duplicate.id).is_none());
    assert_eq!(f.labels(target), vec!["1.0"]);
    assert_eq!(f.text(target), "v1");
}

#[tokio::test]
async fn merges_every_duplicate_in_one_transaction() {
    let f = fixture(config(Strategy::Deferred));
    let mut tx = f.begin(user("alice")).await;
    let a = tx.upload_document(f.library, "a.txt", b"a1".to_vec()).await.unwrap();
    let b = tx.upload_document(f.library, "b.txt", b"b1".to_vec()).await.unwrap();
    f.engine.commit(tx).await.unwrap();

    let mut tx = f.begin(user("alice")).await;
    for (name, content) in [("a.txt", "a2"), ("b.txt", "b2"), ("a.txt", "a3")] {
        tx.upload_document(f.library, name, content.as_bytes().to_vec()).await.unwrap();
    }
    let resolutions = f.engine.commit(tx).await.unwrap();
    assert_eq!(resolutions.len(), 3);
    assert!(resolutions.iter().all(|r| matches!(r, Resolution::Scheduled(_))));

    f.engine.wait_idle().await;
    assert!(f.engine.dead_letters().is_empty());
    assert_eq!(f.visible_names(), vec!["a.txt", "b.txt"]);
    assert_eq!(f.labels(a.id), vec!["1.0", "1.1", "1.2"]);
    assert_eq!(f.labels(b.id), vec!["1.0", "1.1"]);
    assert_eq!(f.text(b.id), "b2");
}

#[tokio::test]
async fn transient_conflicts_are_retried() {
    let f = fixture(config(Strategy::Deferred));
    f.upload(user("alice"), "Invoice.pdf", "v1").await;
    let target = f.only_visible();
    f.repo.inject_conflicts(target, 2);

    f.upload(user("alice"), "Invoice.pdf", "v2").await;
    f.engine.wait_idle().await;

    assert!(f.engine.dead_letters().is_empty());
    assert_eq!(f.labels(target), vec!["1.0", "1.1"]);
    assert_eq!(f.text(target), "v2");
}

#[tokio::test]
async fn exhausted_retries_become_dead_letters() {
    let f = fixture(config(Strategy::Deferred));
    f.upload(user("alice"), "Invoice.pdf", "v1").await;
    let target = f.only_visible();
    f.repo.inject_conflicts(target, 10);

    let resolutions = f.upload(user("alice"), "Invoice.pdf", "v2").await;
    let [Resolution::Scheduled(task)] = resolutions.as_slice() else {
        panic!("Expected one scheduled merge");
    };
    f.engine.wait_idle().await;

    let dead = f.engine.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task, *task);
    assert_eq!(dead[0].reason, FailureReason::RetriesExhausted);
    assert_eq!(dead[0].attempts, 3);

    let orphan = f.repo.get(task.duplicate).unwrap();
    assert!(orphan.has_flag(Flag::Hidden) && orphan.has_flag(Flag::Temporary));
    assert_eq!(f.labels(target), vec!["1.0"]);
}

#[tokio::test]
async fn deferred_merge_ignores_uploader_permissions() {
    let f = fixture(config(Strategy::Deferred));
    f.upload(user("alice"), "Invoice.pdf", "v1").await;
    let target = f.only_visible();

    f.upload(user("bob"), "Invoice.pdf", "v2").await;
    f.engine.wait_idle().await;

    assert!(f.engine.dead_letters().is_empty());
    assert_eq!(f.labels(target), vec!["1.0", "1.1"]);
    assert_eq!(f.repo.get(target).unwrap().owner.as_deref(), Some("alice"));
}

#[tokio::test]
async fn synchronous_merge_fails_upload_without_permission() {
    let f = fixture(config(Strategy::Synchronous));
    f.upload(user("alice"), "Invoice.pdf", "v1").await;
    let target = f.only_visible();

    let mut tx = f.begin(user("bob")).await;
    tx.upload_document(f.library, "Invoice.pdf", b"v2".to_vec()).await.unwrap();
    let result = f.engine.commit(tx).await;

    assert!(matches!(result, Err(Error::PermissionDenied { ref user, node }) if user == "bob" && node == target));
    assert_eq!(f.visible_names(), vec!["Invoice.pdf"]);
    assert_eq!(f.labels(target), vec!["1.0"]);
    assert!(f.feed.of_type(FILE_UPDATED).is_empty());
}

#[tokio::test]
async fn indexed_lookup_misses_target_from_same_transaction() {
    for (lookup, merged) in [(LookupStrategy::Indexed, false), (LookupStrategy::Scan, true)] {
        let f = fixture(EngineConfig { lookup, ..config(Strategy::Synchronous) });

        let mut tx = f.begin(user("alice")).await;
        tx.upload_document(f.library, "Plan.doc", b"one".to_vec()).await.unwrap();
        tx.create_document(f.library, "Plan-1.doc", Box::new(Cursor::new(b"two".to_vec()))).await.unwrap();
        let resolutions = f.engine.commit(tx).await.unwrap();

        assert_eq!(!resolutions.is_empty(), merged, "lookup {:?}", lookup);
        if merged {
            assert_eq!(f.visible_names(), vec!["Plan.doc"]);
            assert_eq!(f.text(f.only_visible()), "two");
        } else {
            assert_eq!(f.visible_names(), vec!["Plan-1.doc", "Plan.doc"]);
        }
    }
}

#[tokio::test]
async fn competing_duplicates_apply_in_commit_order() {
    let f = fixture(EngineConfig { workers: 1, ..config(Strategy::Deferred) });
    f.upload(user("alice"), "Invoice.pdf", "v1").await;
    let target = f.only_visible();

    let mut first = f.begin(user("alice")).await;
    first.create_document(f.library, "Invoice-1.pdf", Box::new(Cursor::new(b"first".to_vec()))).await.unwrap();
    let mut second = f.begin(user("bob")).await;
    second.create_document(f.library, "Invoice-2.pdf", Box::new(Cursor::new(b"second".to_vec()))).await.unwrap();

    f.engine.prepare_commit(&mut first).await.unwrap();
    f.engine.prepare_commit(&mut second).await.unwrap();
    first.commit().await.unwrap();
    second.commit().await.unwrap();
    f.engine.wait_idle().await;

    assert!(f.engine.dead_letters().is_empty());
    assert_eq!(f.visible_names(), vec!["Invoice.pdf"]);
    assert_eq!(f.labels(target), vec!["1.0", "1.1", "1.2"]);
    assert_eq!(f.text(target), "second");
}

#[tokio::test]
async fn shutdown_drains_pending_merges() {
    let f = fixture(config(Strategy::Deferred));
    f.upload(user("alice"), "Invoice.pdf", "v1").await;
    let target = f.only_visible();
    f.upload(user("alice"), "Invoice.pdf", "v2").await;

    let Fixture { repo, engine, .. } = f;
    engine.shutdown().await;
    assert_eq!(repo.version_history(target).unwrap().len(), 2);
}

#[tokio::test]
async fn rejects_invalid_config() {
    let feed = Arc::new(MemoryActivityFeed::new());
    let repo = Arc::new(MemoryRepository::new(feed.clone()));
    let result = AutoVersioner::new(repo, feed, EngineConfig { workers: 0, ..Default::default() });
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}
