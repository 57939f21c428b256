//! Duplicate sibling folder resolution.
//!
//! Stores with mutable parents (the capability-map kind) can end up with two
//! sibling folders of the same name, typically after two devices create the
//! same series folder concurrently. The deduplicator merges every duplicate
//! group into its oldest member. A single pass either removes a duplicate
//! group outright or pushes the collision one level down (folder-on-folder
//! moves create a fresh pair inside the canonical), so the outer loop
//! strictly shrinks the duplicate count at the shallowest affected level and
//! terminates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hondana_core::rpath;
use tracing::{debug, warn};

use crate::remote::provider::Result;

#[derive(Debug, Clone)]
pub struct FolderInfo {
    pub id: String,
    pub name: String,
    /// `None` for top-level folders (the app root lives here).
    pub parent_id: Option<String>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChildInfo {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
}

/// Folder primitives a duplicate-tolerant store exposes to the
/// deduplicator.
#[async_trait]
pub trait FolderOps: Send + Sync {
    /// Every folder in the app tree, the app root included.
    async fn list_folders(&self) -> Result<Vec<FolderInfo>>;

    async fn list_children(&self, folder_id: &str) -> Result<Vec<ChildInfo>>;

    async fn move_child(&self, child_id: &str, into_folder_id: &str) -> Result<()>;

    /// Deletes a file or an empty folder. Idempotent on missing ids.
    async fn delete_node(&self, id: &str) -> Result<()>;

    /// The deduplicator kept this folder as the canonical app root; the
    /// store should target it from now on.
    fn note_canonical_root(&self, folder_id: &str);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DedupReport {
    pub groups_resolved: usize,
    pub files_deleted: usize,
    pub folders_deleted: usize,
    pub passes: usize,
}

impl DedupReport {
    fn absorb(&mut self, pass: DedupReport) {
        self.groups_resolved += pass.groups_resolved;
        self.files_deleted += pass.files_deleted;
        self.folders_deleted += pass.folders_deleted;
    }
}

// protocol-bug guard; the algorithm itself always terminates
const MAX_PASSES: usize = 64;

/// Runs dedup passes until the tree has no duplicate sibling folders.
pub async fn dedupe_folders(ops: &dyn FolderOps, root_name: &str) -> Result<DedupReport> {
    let mut report = DedupReport::default();
    loop {
        let pass = dedupe_pass(ops, root_name).await?;
        report.absorb(pass);
        report.passes += 1;
        if pass.groups_resolved == 0 {
            return Ok(report);
        }
        if report.passes >= MAX_PASSES {
            warn!(?report, "folder dedup did not converge, giving up");
            return Ok(report);
        }
    }
}

async fn dedupe_pass(ops: &dyn FolderOps, root_name: &str) -> Result<DedupReport> {
    let mut report = DedupReport::default();
    let mut folders = ops.list_folders().await?;

    // group siblings by (parent, name); oldest first within each group
    folders.sort_by(|a, b| {
        (a.parent_id.as_deref(), rpath::norm(&a.name), a.created, a.id.as_str()).cmp(&(
            b.parent_id.as_deref(),
            rpath::norm(&b.name),
            b.created,
            b.id.as_str(),
        ))
    });

    let mut index = 0;
    while index < folders.len() {
        let start = index;
        while index < folders.len()
            && folders[index].parent_id == folders[start].parent_id
            && rpath::norm(&folders[index].name) == rpath::norm(&folders[start].name)
        {
            index += 1;
        }
        let group = &folders[start..index];
        if group.len() < 2 {
            continue;
        }

        let canonical = &group[0];
        debug!(
            name = %canonical.name,
            duplicates = group.len() - 1,
            "merging duplicate sibling folders"
        );

        if canonical.parent_id.is_none() && rpath::norm(&canonical.name) == rpath::norm(root_name)
        {
            ops.note_canonical_root(&canonical.id);
        }

        // names already present in the canonical, refreshed as we merge
        let mut canon_children: std::collections::HashMap<String, ChildInfo> = ops
            .list_children(&canonical.id)
            .await?
            .into_iter()
            .map(|child| (rpath::norm(&child.name), child))
            .collect();

        for duplicate in &group[1..] {
            for child in ops.list_children(&duplicate.id).await? {
                match canon_children.get(&rpath::norm(&child.name)) {
                    Some(existing) if !existing.is_folder && !child.is_folder => {
                        // the canonical's file wins; the duplicate's copy is
                        // a losing update
                        ops.delete_node(&child.id).await?;
                        report.files_deleted += 1;
                    }
                    _ => {
                        // move in; folder-on-folder collisions deliberately
                        // create a nested duplicate pair that the next pass
                        // resolves
                        ops.move_child(&child.id, &canonical.id).await?;
                        canon_children
                            .entry(rpath::norm(&child.name))
                            .or_insert(child);
                    }
                }
            }
            ops.delete_node(&duplicate.id).await?;
            report.folders_deleted += 1;
        }
        report.groups_resolved += 1;
    }

    Ok(report)
}
