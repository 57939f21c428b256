//! The capability-map store: fileId-addressed objects with mutable parents.
//!
//! The store tolerates duplicate sibling names (both files and folders), so
//! it exposes [`FolderOps`] for the deduplicator and always targets the
//! *canonical* (oldest) folder when uploading. The provider's wire encoding
//! lives behind [`DriveApi`]; [`MemoryDriveApi`] is the in-process transport
//! used by tests and local emulation.

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
use hondana_core::rpath::{self, RemotePath};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    local::storage::Storage,
    model::{ProviderCredentials, ProviderId, ProviderStatus, RemoteFile, StorageQuota},
    remote::{
        fetch::{self, ChunkReader, FetchErr, FetchProgress, RangeReply, RangeSource},
        folders::{ChildInfo, FolderInfo, FolderOps},
        provider::{
            APP_FOLDER, ProviderCaps, ProviderErr, Result, UploadTarget, WorkerDownloadCreds,
        },
    },
};

/// One node of the remote file graph.
#[derive(Debug, Clone)]
pub struct DriveNode {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub is_folder: bool,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub description: Option<String>,
}

/// The provider's native API surface. Wire encodings are out of scope for
/// this crate; implementations adapt them to this trait.
#[async_trait]
pub trait DriveApi: Send + Sync {
    async fn validate_token(&self, token: &str) -> Result<()>;

    /// The full node graph visible to the app.
    async fn list_nodes(&self, token: &str) -> Result<Vec<DriveNode>>;

    /// Always creates a fresh folder, even when a sibling of the same name
    /// exists.
    async fn create_folder(&self, token: &str, name: &str, parent_id: Option<&str>)
    -> Result<String>;

    async fn upload(
        &self,
        token: &str,
        name: &str,
        parent_id: &str,
        data: Bytes,
        description: Option<&str>,
    ) -> Result<String>;

    async fn download(&self, token: &str, id: &str) -> Result<Bytes>;

    async fn move_node(&self, token: &str, id: &str, new_parent_id: &str) -> Result<()>;

    /// Deletes a node and its subtree. Idempotent on missing ids.
    async fn delete_node(&self, token: &str, id: &str) -> Result<()>;

    async fn set_description(&self, token: &str, id: &str, description: &str) -> Result<()>;

    async fn quota(&self, token: &str) -> Result<StorageQuota>;
}

const UPLOAD_CONCURRENCY: usize = 2;
const DOWNLOAD_CONCURRENCY: usize = 2;

pub struct DriveStore {
    id: ProviderId,
    api: Arc<dyn DriveApi>,
    storage: Arc<Storage>,
    /// Canonical app root folder id, once known.
    root_id: Mutex<Option<String>>,
    attention: AtomicBool,
}

impl DriveStore {
    pub fn new(id: ProviderId, api: Arc<dyn DriveApi>, storage: Arc<Storage>) -> Self {
        DriveStore {
            id,
            api,
            storage,
            root_id: Mutex::new(None),
            attention: AtomicBool::new(false),
        }
    }

    pub fn in_memory(id: ProviderId, storage: Arc<Storage>) -> Self {
        Self::new(id, Arc::new(MemoryDriveApi::default()), storage)
    }

    pub fn id(&self) -> &ProviderId {
        &self.id
    }

    pub fn caps(&self) -> ProviderCaps {
        ProviderCaps {
            supports_worker_download: true,
            upload_concurrency: UPLOAD_CONCURRENCY,
            download_concurrency: DOWNLOAD_CONCURRENCY,
            allows_duplicate_siblings: true,
            editable_descriptions: true,
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
                "sign-in required".to_string()
            },
        }
    }

    fn token(&self) -> Result<String> {
        match self.stored_credentials() {
            Some(creds) if creds.is_usable() => {
                Ok(creds.access_token.expect("usable creds carry a token"))
            }
            _ => Err(Culprit::new(ProviderErr::AuthRequired)),
        }
    }

    pub async fn login(&self, secret: Option<&str>) -> Result<()> {
        let token = match secret {
            Some(token) => token.to_string(),
            None => self.token()?,
        };
        self.api.validate_token(&token).await?;
        self.storage
            .put_credentials(
                &self.id,
                &ProviderCredentials {
                    access_token: Some(token),
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
        *self.root_id.lock() = None;
        self.attention.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Maps the node graph to `Series/Volume.ext` and bare top-level paths.
    /// Files nested deeper than one series folder are not part of the
    /// library layout and are skipped.
    pub async fn list_volumes(&self) -> Result<Vec<RemoteFile>> {
        let token = self.token()?;
        let nodes = self.api.list_nodes(&token).await?;
        let by_id: HashMap<&str, &DriveNode> =
            nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        let mut files = Vec::new();
        for node in nodes.iter().filter(|n| !n.is_folder) {
            let mut chain: Vec<&DriveNode> = Vec::new();
            let mut cursor = node.parent_id.as_deref();
            while let Some(parent_id) = cursor {
                let Some(parent) = by_id.get(parent_id) else {
                    break;
                };
                chain.push(parent);
                cursor = parent.parent_id.as_deref();
                // a corrupted parent graph must not hang the listing
                if chain.len() > 16 {
                    break;
                }
            }

            // the chain must terminate at a top-level app folder
            let Some(top) = chain.last() else { continue };
            if top.parent_id.is_some() || rpath::norm(&top.name) != rpath::norm(APP_FOLDER) {
                continue;
            }

            let path = match chain.len() {
                1 => RemotePath::new(node.name.clone()),
                2 => RemotePath::volume(&chain[0].name, &node.name),
                _ => continue,
            };

            files.push(RemoteFile {
                provider: self.id.clone(),
                file_id: node.id.clone(),
                path,
                modified: node.modified,
                size: node.size,
                description: node.description.clone(),
            });
        }
        Ok(files)
    }

    /// Oldest top-level app folder; created when absent.
    async fn ensure_root(&self, token: &str, nodes: &[DriveNode]) -> Result<String> {
        if let Some(root) = self.root_id.lock().clone() {
            if nodes.iter().any(|n| n.id == root) {
                return Ok(root);
            }
        }

        let canonical = nodes
            .iter()
            .filter(|n| {
                n.is_folder
                    && n.parent_id.is_none()
                    && rpath::norm(&n.name) == rpath::norm(APP_FOLDER)
            })
            .min_by_key(|n| (n.created, n.id.clone()));

        let root = match canonical {
            Some(folder) => folder.id.clone(),
            None => {
                debug!("creating app root folder");
                self.api.create_folder(token, APP_FOLDER, None).await?
            }
        };
        *self.root_id.lock() = Some(root.clone());
        Ok(root)
    }

    /// Oldest series folder under the canonical root; created when absent.
    async fn ensure_series_folder(
        &self,
        token: &str,
        nodes: &[DriveNode],
        root: &str,
        series: &str,
    ) -> Result<String> {
        let canonical = nodes
            .iter()
            .filter(|n| {
                n.is_folder
                    && n.parent_id.as_deref() == Some(root)
                    && rpath::norm(&n.name) == rpath::norm(series)
            })
            .min_by_key(|n| (n.created, n.id.clone()));

        match canonical {
            Some(folder) => Ok(folder.id.clone()),
            None => self.api.create_folder(token, series, Some(root)).await,
        }
    }

    pub async fn prepare_upload_target(&self, series_title: &str) -> Result<UploadTarget> {
        let token = self.token()?;
        let nodes = self.api.list_nodes(&token).await?;
        let root = self.ensure_root(&token, &nodes).await?;
        let folder = self
            .ensure_series_folder(&token, &nodes, &root, series_title)
            .await?;
        Ok(UploadTarget {
            provider: self.id.clone(),
            access_token: Some(token),
            folder_id: Some(folder),
        })
    }

    pub async fn upload(
        &self,
        path: &RemotePath,
        data: Bytes,
        description: Option<&str>,
        target: Option<&UploadTarget>,
    ) -> Result<String> {
        let token = self.token()?;
        let nodes = self.api.list_nodes(&token).await?;

        let parent = match target.and_then(|t| t.folder_id.clone()) {
            Some(folder) => folder,
            None => {
                let root = self.ensure_root(&token, &nodes).await?;
                match path.series() {
                    Some(series) => {
                        self.ensure_series_folder(&token, &nodes, &root, series)
                            .await?
                    }
                    None => root,
                }
            }
        };

        // replace semantics: drop any existing file of the same name first
        let name = path.file_name();
        for existing in nodes.iter().filter(|n| {
            !n.is_folder
                && n.parent_id.as_deref() == Some(parent.as_str())
                && rpath::norm(&n.name) == rpath::norm(name)
        }) {
            self.api.delete_node(&token, &existing.id).await?;
        }

        self.api
            .upload(&token, name, &parent, data, description)
            .await
    }

    pub async fn download(
        &self,
        file_id: &str,
        on_progress: impl FnMut(FetchProgress) + Send,
    ) -> Result<Bytes> {
        let token = self.token()?;
        let source = DriveRangeSource {
            api: self.api.clone(),
            token,
            file_id: file_id.to_string(),
            expected_size: None,
        };
        Ok(fetch::fetch_resumable(&source, &Default::default(), on_progress)
            .await
            .or_into_ctx()?)
    }

    pub async fn worker_download(
        &self,
        creds: &WorkerDownloadCreds,
        on_progress: impl FnMut(FetchProgress) + Send,
    ) -> Result<Bytes> {
        let token = creds
            .access_token
            .clone()
            .ok_or_else(|| Culprit::new(ProviderErr::AuthRequired))?;
        let source = DriveRangeSource {
            api: self.api.clone(),
            token,
            file_id: creds.file_id.clone(),
            expected_size: creds.expected_size,
        };
        Ok(fetch::fetch_resumable(&source, &Default::default(), on_progress)
            .await
            .or_into_ctx()?)
    }

    pub async fn download_credentials(&self, file_id: &str) -> Result<WorkerDownloadCreds> {
        let token = self.token()?;
        let nodes = self.api.list_nodes(&token).await?;
        let expected_size = nodes
            .iter()
            .find(|n| n.id == file_id)
            .map(|n| n.size);
        Ok(WorkerDownloadCreds {
            provider: self.id.clone(),
            file_id: file_id.to_string(),
            access_token: Some(token),
            share_url: None,
            expected_size,
        })
    }

    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        let token = self.token()?;
        self.api.delete_node(&token, file_id).await
    }

    pub async fn delete_series_folder(&self, series_title: &str) -> Result<()> {
        let token = self.token()?;
        let nodes = self.api.list_nodes(&token).await?;
        let roots: Vec<&str> = nodes
            .iter()
            .filter(|n| {
                n.is_folder
                    && n.parent_id.is_none()
                    && rpath::norm(&n.name) == rpath::norm(APP_FOLDER)
            })
            .map(|n| n.id.as_str())
            .collect();

        for folder in nodes.iter().filter(|n| {
            n.is_folder
                && n.parent_id
                    .as_deref()
                    .is_some_and(|p| roots.contains(&p))
                && rpath::norm(&n.name) == rpath::norm(series_title)
        }) {
            self.api.delete_node(&token, &folder.id).await?;
        }
        Ok(())
    }

    pub async fn update_description(&self, file_id: &str, description: &str) -> Result<()> {
        let token = self.token()?;
        self.api.set_description(&token, file_id, description).await
    }

    pub async fn quota(&self) -> Result<StorageQuota> {
        let token = self.token()?;
        self.api.quota(&token).await
    }
}

#[async_trait]
impl FolderOps for DriveStore {
    async fn list_folders(&self) -> Result<Vec<FolderInfo>> {
        let token = self.token()?;
        Ok(self
            .api
            .list_nodes(&token)
            .await?
            .into_iter()
            .filter(|n| n.is_folder)
            .map(|n| FolderInfo {
                id: n.id,
                name: n.name,
                parent_id: n.parent_id,
                created: n.created,
            })
            .collect())
    }

    async fn list_children(&self, folder_id: &str) -> Result<Vec<ChildInfo>> {
        let token = self.token()?;
        Ok(self
            .api
            .list_nodes(&token)
            .await?
            .into_iter()
            .filter(|n| n.parent_id.as_deref() == Some(folder_id))
            .map(|n| ChildInfo { id: n.id, name: n.name, is_folder: n.is_folder })
            .collect())
    }

    async fn move_child(&self, child_id: &str, into_folder_id: &str) -> Result<()> {
        let token = self.token()?;
        self.api.move_node(&token, child_id, into_folder_id).await
    }

    async fn delete_node(&self, id: &str) -> Result<()> {
        let token = self.token()?;
        self.api.delete_node(&token, id).await
    }

    fn note_canonical_root(&self, folder_id: &str) {
        *self.root_id.lock() = Some(folder_id.to_string());
    }
}

/// Adapts the native download call to the resumable fetch contract. The
/// native API hands back whole bodies; ranged retries slice locally, which
/// still satisfies the observable behaviour (exact bytes, resumed offsets).
struct DriveRangeSource {
    api: Arc<dyn DriveApi>,
    token: String,
    file_id: String,
    expected_size: Option<u64>,
}

#[async_trait]
impl RangeSource for DriveRangeSource {
    async fn probe(&self) -> fetch::Result<Option<u64>> {
        Ok(self.expected_size)
    }

    async fn fetch(&self, offset: u64) -> fetch::Result<RangeReply> {
        let data = self
            .api
            .download(&self.token, &self.file_id)
            .await
            .map_err(provider_fetch_err)?;
        if offset > data.len() as u64 {
            return Ok(RangeReply::RangeNotSatisfiable);
        }
        let body = data.slice(offset as usize..);
        let reader = Box::new(OneShotReader { body: Some(body) });
        if offset > 0 {
            Ok(RangeReply::Partial(reader))
        } else {
            Ok(RangeReply::Full(reader))
        }
    }
}

struct OneShotReader {
    body: Option<Bytes>,
}

#[async_trait]
impl ChunkReader for OneShotReader {
    async fn next(&mut self) -> fetch::Result<Option<Bytes>> {
        Ok(self.body.take().filter(|b| !b.is_empty()))
    }
}

fn provider_fetch_err(err: Culprit<ProviderErr>) -> Culprit<FetchErr> {
    err.map_ctx(|ctx| match ctx {
        ProviderErr::NotFound(_) => FetchErr::Status(404),
        ProviderErr::AuthRequired | ProviderErr::AuthRejected => FetchErr::Status(401),
        ProviderErr::Fetch(inner) => inner,
        _ => FetchErr::Status(503),
    })
}

/// In-process node graph implementing the native API. Duplicate sibling
/// names are allowed for files and folders alike, as on the real store.
#[derive(Default)]
pub struct MemoryDriveApi {
    state: Mutex<MemState>,
    clock: AtomicU64,
}

#[derive(Default)]
struct MemState {
    nodes: HashMap<String, DriveNode>,
    blobs: HashMap<String, Bytes>,
    next_id: u64,
}

impl MemoryDriveApi {
    fn check_token(token: &str) -> Result<()> {
        if token.is_empty() {
            return Err(Culprit::new(ProviderErr::AuthRejected));
        }
        Ok(())
    }

    fn tick(&self) -> DateTime<Utc> {
        let t = self.clock.fetch_add(1, Ordering::Relaxed) as i64;
        DateTime::<Utc>::from_timestamp(1_700_000_000 + t, 0).expect("valid timestamp")
    }

    fn alloc_id(state: &mut MemState, kind: &str) -> String {
        state.next_id += 1;
        format!("{kind}-{}", state.next_id)
    }

    /// Test hook: every node currently in the graph.
    pub fn nodes(&self) -> Vec<DriveNode> {
        self.state.lock().nodes.values().cloned().collect()
    }
}

#[async_trait]
impl DriveApi for MemoryDriveApi {
    async fn validate_token(&self, token: &str) -> Result<()> {
        Self::check_token(token)
    }

    async fn list_nodes(&self, token: &str) -> Result<Vec<DriveNode>> {
        Self::check_token(token)?;
        Ok(self.nodes())
    }

    async fn create_folder(
        &self,
        token: &str,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<String> {
        Self::check_token(token)?;
        let now = self.tick();
        let mut state = self.state.lock();
        let id = Self::alloc_id(&mut state, "folder");
        state.nodes.insert(
            id.clone(),
            DriveNode {
                id: id.clone(),
                name: name.to_string(),
                parent_id: parent_id.map(str::to_string),
                is_folder: true,
                size: 0,
                created: now,
                modified: now,
                description: None,
            },
        );
        Ok(id)
    }

    async fn upload(
        &self,
        token: &str,
        name: &str,
        parent_id: &str,
        data: Bytes,
        description: Option<&str>,
    ) -> Result<String> {
        Self::check_token(token)?;
        let now = self.tick();
        let mut state = self.state.lock();
        if !state.nodes.contains_key(parent_id) {
            return Err(Culprit::new(ProviderErr::NotFound(parent_id.to_string())));
        }
        let id = Self::alloc_id(&mut state, "file");
        state.nodes.insert(
            id.clone(),
            DriveNode {
                id: id.clone(),
                name: name.to_string(),
                parent_id: Some(parent_id.to_string()),
                is_folder: false,
                size: data.len() as u64,
                created: now,
                modified: now,
                description: description.map(str::to_string),
            },
        );
        state.blobs.insert(id.clone(), data);
        Ok(id)
    }

    async fn download(&self, token: &str, id: &str) -> Result<Bytes> {
        Self::check_token(token)?;
        self.state
            .lock()
            .blobs
            .get(id)
            .cloned()
            .ok_or_else(|| Culprit::new(ProviderErr::NotFound(id.to_string())))
    }

    async fn move_node(&self, token: &str, id: &str, new_parent_id: &str) -> Result<()> {
        Self::check_token(token)?;
        let mut state = self.state.lock();
        if !state.nodes.contains_key(new_parent_id) {
            return Err(Culprit::new(ProviderErr::NotFound(new_parent_id.to_string())));
        }
        match state.nodes.get_mut(id) {
            Some(node) => {
                node.parent_id = Some(new_parent_id.to_string());
                Ok(())
            }
            None => Err(Culprit::new(ProviderErr::NotFound(id.to_string()))),
        }
    }

    async fn delete_node(&self, token: &str, id: &str) -> Result<()> {
        Self::check_token(token)?;
        let mut state = self.state.lock();
        let mut doomed = vec![id.to_string()];
        while let Some(current) = doomed.pop() {
            let children: Vec<String> = state
                .nodes
                .values()
                .filter(|n| n.parent_id.as_deref() == Some(current.as_str()))
                .map(|n| n.id.clone())
                .collect();
            doomed.extend(children);
            state.nodes.remove(&current);
            state.blobs.remove(&current);
        }
        Ok(())
    }

    async fn set_description(&self, token: &str, id: &str, description: &str) -> Result<()> {
        Self::check_token(token)?;
        let mut state = self.state.lock();
        match state.nodes.get_mut(id) {
            Some(node) => {
                node.description = Some(description.to_string());
                node.modified = Utc::now();
                Ok(())
            }
            None => Err(Culprit::new(ProviderErr::NotFound(id.to_string()))),
        }
    }

    async fn quota(&self, token: &str) -> Result<StorageQuota> {
        Self::check_token(token)?;
        let used: u64 = self.state.lock().blobs.values().map(|b| b.len() as u64).sum();
        let total = 15 * 1024 * 1024 * 1024u64;
        Ok(StorageQuota {
            used,
            total: Some(total),
            available: Some(total - used),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::folders::{DedupReport, dedupe_folders};

    async fn authed_store() -> (DriveStore, Arc<MemoryDriveApi>) {
        let storage = Arc::new(Storage::open_temporary().unwrap());
        let api = Arc::new(MemoryDriveApi::default());
        let store = DriveStore::new(ProviderId::new("drive"), api.clone(), storage);
        store.login(Some("token")).await.unwrap();
        (store, api)
    }

    #[tokio::test]
    async fn test_login_logout_status() {
        let storage = Arc::new(Storage::open_temporary().unwrap());
        let store = DriveStore::in_memory(ProviderId::new("drive"), storage);
        assert!(!store.is_authenticated());
        assert!(store.list_volumes().await.is_err());

        store.login(Some("token")).await.unwrap();
        assert!(store.is_authenticated());
        assert!(store.status().authenticated);

        store.logout().unwrap();
        assert!(!store.is_authenticated());
        // idempotent
        store.logout().unwrap();
    }

    #[tokio::test]
    async fn test_upload_list_download_roundtrip() {
        let (store, _) = authed_store().await;
        let path = RemotePath::new("One Piece/Volume 01.cbz");
        let id = store
            .upload(&path, Bytes::from_static(b"archive"), None, None)
            .await
            .unwrap();

        let listing = store.list_volumes().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].path, path);
        assert_eq!(listing[0].size, 7);

        let body = store.download(&id, |_| {}).await.unwrap();
        assert_eq!(body.as_ref(), b"archive");
    }

    #[tokio::test]
    async fn test_upload_replaces_same_name() {
        let (store, _) = authed_store().await;
        let path = RemotePath::new("S/V.cbz");
        store
            .upload(&path, Bytes::from_static(b"one"), None, None)
            .await
            .unwrap();
        let id2 = store
            .upload(&path, Bytes::from_static(b"two"), None, None)
            .await
            .unwrap();

        let listing = store.list_volumes().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].file_id, id2);
        assert_eq!(
            store.download(&id2, |_| {}).await.unwrap().as_ref(),
            b"two"
        );
    }

    #[tokio::test]
    async fn test_top_level_files_have_bare_paths() {
        let (store, _) = authed_store().await;
        store
            .upload(
                &RemotePath::new("stats.json"),
                Bytes::from_static(b"{}"),
                None,
                None,
            )
            .await
            .unwrap();
        let listing = store.list_volumes().await.unwrap();
        assert!(listing[0].path.is_top_level());
    }

    #[tokio::test]
    async fn test_duplicate_series_folders_merge() {
        // S4: two "Naruto" folders under the app root, each holding
        // Volume_05.cbz; the older folder and file win
        let (store, api) = authed_store().await;
        let root = api.create_folder("t", APP_FOLDER, None).await.unwrap();
        let naruto_a = api
            .create_folder("t", "Naruto", Some(&root))
            .await
            .unwrap();
        let naruto_b = api
            .create_folder("t", "Naruto", Some(&root))
            .await
            .unwrap();
        let keep = api
            .upload("t", "Volume_05.cbz", &naruto_a, Bytes::from_static(b"old"), None)
            .await
            .unwrap();
        api.upload("t", "Volume_05.cbz", &naruto_b, Bytes::from_static(b"new"), None)
            .await
            .unwrap();

        let report = dedupe_folders(&store, APP_FOLDER).await.unwrap();
        assert_eq!(
            report,
            DedupReport {
                groups_resolved: 1,
                files_deleted: 1,
                folders_deleted: 1,
                passes: 2,
            }
        );

        let nodes = api.nodes();
        let folders: Vec<_> = nodes.iter().filter(|n| n.is_folder && n.name == "Naruto").collect();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].id, naruto_a);
        let files: Vec<_> = nodes.iter().filter(|n| !n.is_folder).collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].id, keep);

        // convergence: another run finds nothing
        let again = dedupe_folders(&store, APP_FOLDER).await.unwrap();
        assert_eq!(again.groups_resolved, 0);
    }

    #[tokio::test]
    async fn test_dedup_merges_nested_folder_collisions() {
        let (store, api) = authed_store().await;
        let root = api.create_folder("t", APP_FOLDER, None).await.unwrap();
        let a = api.create_folder("t", "Series", Some(&root)).await.unwrap();
        let b = api.create_folder("t", "Series", Some(&root)).await.unwrap();
        // both duplicates hold an "extras" subfolder with distinct content
        let extras_a = api.create_folder("t", "extras", Some(&a)).await.unwrap();
        let extras_b = api.create_folder("t", "extras", Some(&b)).await.unwrap();
        api.upload("t", "a.cbz", &extras_a, Bytes::from_static(b"a"), None)
            .await
            .unwrap();
        api.upload("t", "b.cbz", &extras_b, Bytes::from_static(b"b"), None)
            .await
            .unwrap();

        dedupe_folders(&store, APP_FOLDER).await.unwrap();

        let nodes = api.nodes();
        // one Series folder, one extras folder, both files kept
        assert_eq!(
            nodes.iter().filter(|n| n.is_folder && n.name == "Series").count(),
            1
        );
        assert_eq!(
            nodes.iter().filter(|n| n.is_folder && n.name == "extras").count(),
            1
        );
        assert_eq!(nodes.iter().filter(|n| !n.is_folder).count(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_app_roots_notify_store() {
        let (store, api) = authed_store().await;
        let root_a = api.create_folder("t", APP_FOLDER, None).await.unwrap();
        let root_b = api.create_folder("t", APP_FOLDER, None).await.unwrap();
        api.upload("t", "x.cbz", &root_b, Bytes::from_static(b"x"), None)
            .await
            .unwrap();

        dedupe_folders(&store, APP_FOLDER).await.unwrap();

        let nodes = api.nodes();
        assert!(nodes.iter().any(|n| n.id == root_a));
        assert!(!nodes.iter().any(|n| n.id == root_b));
        // the store now targets the canonical root
        assert_eq!(store.root_id.lock().as_deref(), Some(root_a.as_str()));
    }

    #[tokio::test]
    async fn test_delete_series_folder_is_idempotent() {
        let (store, _) = authed_store().await;
        store
            .upload(
                &RemotePath::new("Naruto/Volume_05.cbz"),
                Bytes::from_static(b"x"),
                None,
                None,
            )
            .await
            .unwrap();
        store.delete_series_folder("Naruto").await.unwrap();
        assert!(store.list_volumes().await.unwrap().is_empty());
        store.delete_series_folder("Naruto").await.unwrap();
    }

    #[tokio::test]
    async fn test_descriptions_roundtrip() {
        let (store, _) = authed_store().await;
        let id = store
            .upload(
                &RemotePath::new("S/V.cbz"),
                Bytes::from_static(b"x"),
                Some("Series: Modern Title"),
                None,
            )
            .await
            .unwrap();
        let listing = store.list_volumes().await.unwrap();
        assert_eq!(listing[0].description.as_deref(), Some("Series: Modern Title"));

        store.update_description(&id, "Series: Other").await.unwrap();
        let listing = store.list_volumes().await.unwrap();
        assert_eq!(listing[0].description.as_deref(), Some("Series: Other"));
    }
}
