use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use autoversion_core::activity::{Activity, MemoryActivityFeed};
use autoversion_core::canonical::canonicalize;
use autoversion_core::config::EngineConfig;
use autoversion_core::storage::{ContentVersion, Identity, MemoryRepository, Node, Repository};
use autoversion_core::versioning::{AutoVersioner, FailedMerge, Resolution};
use tracing::{debug, info, warn};

use crate::cli::{CanonicalizeArgs, ImportArgs};

/// What an import left behind.
#[derive(Debug)]
pub struct ImportSummary {
    /// Visible documents with their version history.
    pub documents: Vec<(Node, Vec<ContentVersion>)>,
    pub activities: Vec<Activity>,
    pub dead_letters: Vec<FailedMerge>,
}

/// Reads the configuration file if there is one, then applies command line overrides.
pub async fn load_config(path: Option<&Path>, args: &ImportArgs) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(strategy) = args.strategy {
        config.strategy = strategy.into();
    }
    if let Some(lookup) = args.lookup {
        config.lookup = lookup.into();
    }
    config.validate()?;
    Ok(config)
}

pub async fn run_import(args: &ImportArgs, config: EngineConfig) -> Result<ImportSummary> {
    let feed = Arc::new(MemoryActivityFeed::new());
    let repo = Arc::new(MemoryRepository::new(feed.clone()));
    let mut folder = repo.create_site(&args.site)?;
    let engine = AutoVersioner::new(repo.clone(), feed.clone(), config)?;
    let identity = Identity::User(args.user.clone());

    if let Some(name) = &args.folder {
        let mut tx = repo.begin(Identity::System).await?;
        folder = tx.create_folder(folder, name).await?.id;
        tx.commit().await?;
    }

    for path in &args.paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Not a file name: {}", path.display()))?;
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let mut tx = repo.begin(identity.clone()).await?;
        let node = tx.upload_document(folder, name, content).await?;
        debug!("Uploaded {} as '{}'", path.display(), node.name);
        match engine.commit(tx).await {
            Ok(resolutions) => {
                for resolution in resolutions {
                    match resolution {
                        Resolution::Merged(report) => info!("'{}' merged as version {}", node.name, report.version.label),
                        Resolution::Scheduled(_) => info!("'{}' scheduled for merging", node.name),
                    }
                }
            }
            Err(e) => warn!("Upload of {} failed: {}", path.display(), e),
        }
    }

    engine.wait_idle().await;
    let dead_letters = engine.dead_letters();
    engine.shutdown().await;

    let mut documents = Vec::new();
    for node in repo.list_visible(folder) {
        let versions = repo.version_history(node.id)?;
        documents.push((node, versions));
    }
    Ok(ImportSummary { documents, activities: feed.activities(), dead_letters })
}

pub async fn handle_import(args: ImportArgs, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path, &args).await?;
    println!("Importing {} files ({:?}, {:?} lookup)", args.paths.len(), config.strategy, config.lookup);
    let summary = run_import(&args, config).await?;

    println!();
    for (node, versions) in &summary.documents {
        let labels: Vec<_> = versions.iter().map(|v| v.label.as_str()).collect();
        println!("  {:40} {}", node.name, labels.join(", "));
    }
    if !summary.activities.is_empty() {
        println!();
        println!("  Activities:");
        for activity in &summary.activities {
            println!("    {} {}", activity.activity_type, activity.data);
        }
    }
    if !summary.dead_letters.is_empty() {
        println!();
        println!("  Failed merges:");
        for failed in &summary.dead_letters {
            println!("    {} -> {}: {:?}", failed.task.duplicate, failed.task.target, failed.reason);
        }
    }
    Ok(())
}

pub fn handle_canonicalize(args: CanonicalizeArgs) -> Result<()> {
    for name in args.names {
        println!("{}\t{}", name, canonicalize(&name));
    }
    Ok(())
}
