//! The key-share store.
//!
//! Uploads and management calls need the account key; downloads go through
//! short-lived share links so an off-thread worker never sees the key. Every
//! minted link is revoked once the download is consumed (best-effort).

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use culprit::{Culprit, ResultExt};
use hondana_core::rpath::RemotePath;
use parking_lot::Mutex;

use crate::{
    local::storage::Storage,
    model::{ProviderCredentials, ProviderId, ProviderStatus, RemoteFile, StorageQuota},
    remote::{
        fetch::{self, ChunkReader, FetchProgress, RangeReply, RangeSource},
        provider::{ProviderCaps, ProviderErr, Result, WorkerDownloadCreds},
    },
};

const UPLOAD_CONCURRENCY: usize = 1;
const DOWNLOAD_CONCURRENCY: usize = 2;

#[derive(Debug, Clone)]
pub struct ShareEntry {
    pub file_id: String,
    /// Path relative to the app folder: `"Series/Volume.cbz"` or bare.
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// The provider's native API surface; wire encodings live outside this
/// crate.
#[async_trait]
pub trait ShareApi: Send + Sync {
    async fn validate_key(&self, key: &str) -> Result<()>;

    async fn list(&self, key: &str) -> Result<Vec<ShareEntry>>;

    async fn upload(&self, key: &str, path: &str, data: Bytes) -> Result<String>;

    /// Idempotent on missing ids.
    async fn delete(&self, key: &str, file_id: &str) -> Result<()>;

    /// Mints a short-lived public link for one file.
    async fn mint_link(&self, key: &str, file_id: &str) -> Result<String>;

    async fn revoke_link(&self, key: &str, file_id: &str) -> Result<()>;

    /// Opens a previously minted link for ranged reads. Requires no key.
    fn open_link(&self, url: &str) -> Box<dyn RangeSource>;

    async fn quota(&self, key: &str) -> Result<StorageQuota>;
}

pub struct ShareStore {
    id: ProviderId,
    api: Arc<dyn ShareApi>,
    storage: Arc<Storage>,
    attention: AtomicBool,
}

impl ShareStore {
    pub fn new(id: ProviderId, api: Arc<dyn ShareApi>, storage: Arc<Storage>) -> Self {
        ShareStore { id, api, storage, attention: AtomicBool::new(false) }
    }

    pub fn in_memory(id: ProviderId, storage: Arc<Storage>) -> Self {
        Self::new(id, Arc::new(MemoryShareApi::default()), storage)
    }

    pub fn id(&self) -> &ProviderId {
        &self.id
    }

    pub fn caps(&self) -> ProviderCaps {
        ProviderCaps {
            supports_worker_download: true,
            upload_concurrency: UPLOAD_CONCURRENCY,
            download_concurrency: DOWNLOAD_CONCURRENCY,
            allows_duplicate_siblings: false,
            editable_descriptions: false,
        }
    }

    pub fn mark_needs_attention(&self) {
        self.attention.store(true, Ordering::Relaxed);
    }

    fn stored_credentials(&self) -> Option<ProviderCredentials> {
        self.storage.credentials(&self.id).ok().flatten()
    }

    pub fn is_authenticated(&self) -> bool {
        self.stored_credentials().is_some_and(|c| c.is_usable())
    }

    pub fn status(&self) -> ProviderStatus {
        let creds = self.stored_credentials();
        let authenticated = creds.as_ref().is_some_and(|c| c.is_usable());
        ProviderStatus {
            authenticated,
            has_stored_credentials: creds.is_some(),
            needs_attention: self.attention.load(Ordering::Relaxed),
            status_message: if authenticated {
                "connected".to_string()
            } else {
                "account key required".to_string()
            },
        }
    }

    fn key(&self) -> Result<String> {
        match self.stored_credentials() {
            Some(creds) if creds.is_usable() => {
                Ok(creds.access_token.expect("usable creds carry a key"))
            }
            _ => Err(Culprit::new(ProviderErr::AuthRequired)),
        }
    }

    pub async fn login(&self, secret: Option<&str>) -> Result<()> {
        let key = match secret {
            Some(key) => key.to_string(),
            None => self.key()?,
        };
        self.api.validate_key(&key).await?;
        self.storage
            .put_credentials(
                &self.id,
                &ProviderCredentials {
                    access_token: Some(key),
                    refresh_token: None,
                    expires_at: None,
                },
            )
            .or_into_ctx()?;
        self.attention.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub fn logout(&self) -> Result<()> {
        self.storage.clear_credentials(&self.id).or_into_ctx()?;
        self.attention.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub async fn list_volumes(&self) -> Result<Vec<RemoteFile>> {
        let key = self.key()?;
        let entries = self.api.list(&key).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| {
                let depth = entry.path.split('/').count();
                depth <= 2 && !entry.path.is_empty()
            })
            .map(|entry| RemoteFile {
                provider: self.id.clone(),
                file_id: entry.file_id,
                path: RemotePath::new(entry.path),
                modified: entry.modified,
                size: entry.size,
                description: None,
            })
            .collect())
    }

    pub async fn upload(&self, path: &RemotePath, data: Bytes) -> Result<String> {
        let key = self.key()?;
        self.api.upload(&key, path.as_str(), data).await
    }

    pub async fn download(
        &self,
        file_id: &str,
        on_progress: impl FnMut(FetchProgress) + Send,
    ) -> Result<Bytes> {
        let creds = self.download_credentials(file_id).await?;
        let result = self.worker_download(&creds, on_progress).await;
        self.revoke_download_link(file_id).await.ok();
        result
    }

    pub async fn worker_download(
        &self,
        creds: &WorkerDownloadCreds,
        on_progress: impl FnMut(FetchProgress) + Send,
    ) -> Result<Bytes> {
        let url = creds
            .share_url
            .as_deref()
            .ok_or_else(|| Culprit::new(ProviderErr::AuthRequired))?;
        let source = self.api.open_link(url);
        Ok(
            fetch::fetch_resumable(source.as_ref(), &Default::default(), on_progress)
                .await
                .or_into_ctx()?,
        )
    }

    pub async fn download_credentials(&self, file_id: &str) -> Result<WorkerDownloadCreds> {
        let key = self.key()?;
        let url = self.api.mint_link(&key, file_id).await?;
        let expected_size = self
            .api
            .list(&key)
            .await?
            .into_iter()
            .find(|entry| entry.file_id == file_id)
            .map(|entry| entry.size);
        Ok(WorkerDownloadCreds {
            provider: self.id.clone(),
            file_id: file_id.to_string(),
            access_token: None,
            share_url: Some(url),
            expected_size,
        })
    }

    /// Revokes the link minted for this file. Failures are non-fatal.
    pub async fn revoke_download_link(&self, file_id: &str) -> Result<()> {
        let key = self.key()?;
        self.api.revoke_link(&key, file_id).await
    }

    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        let key = self.key()?;
        self.api.delete(&key, file_id).await
    }

    pub async fn delete_series_folder(&self, series_title: &str) -> Result<()> {
        let key = self.key()?;
        let prefix = format!("{series_title}/");
        for entry in self.api.list(&key).await? {
            if hondana_core::rpath::norm(&entry.path)
                .starts_with(&hondana_core::rpath::norm(&prefix))
            {
                self.api.delete(&key, &entry.file_id).await?;
            }
        }
        Ok(())
    }

    pub async fn quota(&self) -> Result<StorageQuota> {
        let key = self.key()?;
        self.api.quota(&key).await
    }
}

/// In-process transport. Links look like `share://<token>` and serve bytes
/// straight from the file table; revoked links stop resolving.
#[derive(Default)]
pub struct MemoryShareApi {
    state: Arc<Mutex<ShareState>>,
    next: AtomicU64,
}

#[derive(Default)]
struct ShareState {
    /// file_id -> (path, data, modified)
    files: HashMap<String, (String, Bytes, DateTime<Utc>)>,
    /// link token -> file_id
    links: HashMap<String, String>,
}

impl MemoryShareApi {
    fn check_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Culprit::new(ProviderErr::AuthRejected));
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Test hook: number of outstanding (unrevoked) links.
    pub fn live_links(&self) -> usize {
        self.state.lock().links.len()
    }
}

#[async_trait]
impl ShareApi for MemoryShareApi {
    async fn validate_key(&self, key: &str) -> Result<()> {
        Self::check_key(key)
    }

    async fn list(&self, key: &str) -> Result<Vec<ShareEntry>> {
        Self::check_key(key)?;
        Ok(self
            .state
            .lock()
            .files
            .iter()
            .map(|(id, (path, data, modified))| ShareEntry {
                file_id: id.clone(),
                path: path.clone(),
                size: data.len() as u64,
                modified: *modified,
            })
            .collect())
    }

    async fn upload(&self, key: &str, path: &str, data: Bytes) -> Result<String> {
        Self::check_key(key)?;
        let mut state = self.state.lock();
        // path-addressed replace
        state
            .files
            .retain(|_, (existing, _, _)| existing.as_str() != path);
        let id = self.next_id("sf");
        state
            .files
            .insert(id.clone(), (path.to_string(), data, Utc::now()));
        Ok(id)
    }

    async fn delete(&self, key: &str, file_id: &str) -> Result<()> {
        Self::check_key(key)?;
        let mut state = self.state.lock();
        state.files.remove(file_id);
        state.links.retain(|_, id| id != file_id);
        Ok(())
    }

    async fn mint_link(&self, key: &str, file_id: &str) -> Result<String> {
        Self::check_key(key)?;
        let mut state = self.state.lock();
        if !state.files.contains_key(file_id) {
            return Err(Culprit::new(ProviderErr::NotFound(file_id.to_string())));
        }
        let token = self.next_id("ln");
        state.links.insert(token.clone(), file_id.to_string());
        Ok(format!("share://{token}"))
    }

    async fn revoke_link(&self, key: &str, file_id: &str) -> Result<()> {
        Self::check_key(key)?;
        self.state.lock().links.retain(|_, id| id != file_id);
        Ok(())
    }

    fn open_link(&self, url: &str) -> Box<dyn RangeSource> {
        Box::new(MemLinkSource {
            state: self.state.clone(),
            token: url.strip_prefix("share://").unwrap_or(url).to_string(),
        })
    }

    async fn quota(&self, key: &str) -> Result<StorageQuota> {
        Self::check_key(key)?;
        let used: u64 = self
            .state
            .lock()
            .files
            .values()
            .map(|(_, data, _)| data.len() as u64)
            .sum();
        Ok(StorageQuota { used, total: None, available: None })
    }
}

struct MemLinkSource {
    state: Arc<Mutex<ShareState>>,
    token: String,
}

impl MemLinkSource {
    fn resolve(&self) -> fetch::Result<Bytes> {
        let state = self.state.lock();
        let file_id = state
            .links
            .get(&self.token)
            .ok_or(fetch::FetchErr::Status(404))?;
        let (_, data, _) = state
            .files
            .get(file_id)
            .ok_or(fetch::FetchErr::Status(404))?;
        Ok(data.clone())
    }
}

#[async_trait]
impl RangeSource for MemLinkSource {
    async fn probe(&self) -> fetch::Result<Option<u64>> {
        Ok(Some(self.resolve()?.len() as u64))
    }

    async fn fetch(&self, offset: u64) -> fetch::Result<RangeReply> {
        let data = self.resolve()?;
        if offset > data.len() as u64 {
            return Ok(RangeReply::RangeNotSatisfiable);
        }
        let reader = Box::new(LinkReader {
            body: Some(data.slice(offset as usize..)),
        });
        if offset > 0 {
            Ok(RangeReply::Partial(reader))
        } else {
            Ok(RangeReply::Full(reader))
        }
    }
}

struct LinkReader {
    body: Option<Bytes>,
}

#[async_trait]
impl ChunkReader for LinkReader {
    async fn next(&mut self) -> fetch::Result<Option<Bytes>> {
        Ok(self.body.take().filter(|b| !b.is_empty()))
    }
}
