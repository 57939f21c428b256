//! Per-provider remote listing cache.
//!
//! The cache is the single source of truth for remote state between
//! fetches. Each provider maps to one immutable [`Listing`] snapshot behind
//! an `Arc`; writers build a new snapshot and swap the reference, so readers
//! always observe a complete listing and never a half-applied update.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::model::{ProviderId, RemoteFile};

#[derive(Debug, Clone, Default)]
pub struct Listing {
    /// `file_id -> metadata`
    pub files: HashMap<String, RemoteFile>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl Listing {
    pub fn iter(&self) -> impl Iterator<Item = &RemoteFile> {
        self.files.values()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Default)]
pub struct ListingCache {
    inner: RwLock<HashMap<ProviderId, Arc<Listing>>>,
}

impl ListingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot for one provider, if any listing has been taken.
    pub fn get(&self, provider: &ProviderId) -> Option<Arc<Listing>> {
        self.inner.read().get(provider).cloned()
    }

    /// Snapshots for every cached provider.
    pub fn snapshot_all(&self) -> HashMap<ProviderId, Arc<Listing>> {
        self.inner.read().clone()
    }

    /// Replaces a provider's listing wholesale (a completed full refresh).
    pub fn replace(&self, provider: &ProviderId, files: Vec<RemoteFile>) {
        let listing = Arc::new(Listing {
            files: files
                .into_iter()
                .map(|file| (file.file_id.clone(), file))
                .collect(),
            fetched_at: Some(Utc::now()),
        });
        self.inner.write().insert(provider.clone(), listing);
    }

    /// Inserts one entry optimistically (a just-completed upload) without
    /// waiting for the next full refresh.
    pub fn insert_optimistic(&self, provider: &ProviderId, file: RemoteFile) {
        let mut inner = self.inner.write();
        let current = inner.remove(provider).unwrap_or_default();
        let mut files = current.files.clone();
        files.insert(file.file_id.clone(), file);
        inner.insert(
            provider.clone(),
            Arc::new(Listing { files, fetched_at: current.fetched_at }),
        );
    }

    /// Rewrites one entry in place, e.g. after a description back-write.
    /// Missing entries are left alone.
    pub fn update_entry(
        &self,
        provider: &ProviderId,
        file_id: &str,
        update: impl FnOnce(&mut RemoteFile),
    ) {
        let mut inner = self.inner.write();
        let Some(current) = inner.remove(provider) else {
            return;
        };
        let mut files = current.files.clone();
        if let Some(entry) = files.get_mut(file_id) {
            update(entry);
        }
        inner.insert(
            provider.clone(),
            Arc::new(Listing { files, fetched_at: current.fetched_at }),
        );
    }

    /// Drops one entry, e.g. after the remote reported it gone. The next
    /// reconciliation stops fabricating its placeholder.
    pub fn invalidate_entry(&self, provider: &ProviderId, file_id: &str) {
        self.update_all(provider, |files| {
            files.remove(file_id);
        });
    }

    /// Clears a provider's cache entirely (logout).
    pub fn clear(&self, provider: &ProviderId) {
        self.inner.write().remove(provider);
    }

    fn update_all(
        &self,
        provider: &ProviderId,
        update: impl FnOnce(&mut HashMap<String, RemoteFile>),
    ) {
        let mut inner = self.inner.write();
        let Some(current) = inner.remove(provider) else {
            return;
        };
        let mut files = current.files.clone();
        update(&mut files);
        inner.insert(
            provider.clone(),
            Arc::new(Listing { files, fetched_at: current.fetched_at }),
        );
    }
}
