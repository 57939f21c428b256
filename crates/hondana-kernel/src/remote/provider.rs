//! The uniform provider contract.
//!
//! Three concrete store kinds implement the same capability set:
//! fileId-addressed with mutable parents and duplicate siblings
//! ([`DriveStore`]), path-addressed hierarchical ([`DavStore`]), and
//! key-share ([`ShareStore`]). Feature negotiation is a capability vector,
//! never a type test; callers hold the [`RemoteStore`] enum and match is
//! confined to this module.

use std::{path::PathBuf, sync::Arc};

use bytes::Bytes;
use hondana_core::rpath::RemotePath;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    local::storage::Storage,
    model::{ProviderId, ProviderStatus, RemoteFile, StorageQuota},
    remote::{
        dav::DavStore,
        drive::DriveStore,
        fetch::{FetchErr, FetchProgress},
        folders::FolderOps,
        share::ShareStore,
    },
};

/// Name of the app folder at every provider's root.
pub const APP_FOLDER: &str = "hondana";

pub type Result<T> = culprit::Result<T, ProviderErr>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderErr {
    #[error("authentication required")]
    AuthRequired,

    #[error("authentication rejected")]
    AuthRejected,

    #[error("remote object not found: {0}")]
    NotFound(String),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error(transparent)]
    Fetch(#[from] FetchErr),

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("{0} does not support this operation")]
    Unsupported(&'static str),

    #[error("invalid remote path: {0}")]
    Path(String),

    #[error(transparent)]
    Storage(#[from] crate::local::storage::StorageErr),
}

impl ProviderErr {
    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderErr::AuthRequired | ProviderErr::AuthRejected)
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ProviderErr::NotFound(_) => true,
            ProviderErr::ObjectStore(object_store::Error::NotFound { .. }) => true,
            ProviderErr::Fetch(FetchErr::Status(404)) => true,
            ProviderErr::Fetch(FetchErr::ObjectStore(object_store::Error::NotFound { .. })) => {
                true
            }
            _ => false,
        }
    }
}

/// Scheduler hints and feature flags. Negotiated through booleans, not type
/// tests.
#[derive(Debug, Clone, Copy)]
pub struct ProviderCaps {
    /// An off-thread worker can perform the download directly given a
    /// credential bundle.
    pub supports_worker_download: bool,
    pub upload_concurrency: usize,
    pub download_concurrency: usize,
    /// The store can hold two sibling folders with the same name; the
    /// folder deduplicator applies.
    pub allows_duplicate_siblings: bool,
    /// File descriptions exist and can carry a `Series:` tag.
    pub editable_descriptions: bool,
}

/// Minimal credential bundle handed to a worker for one download. May carry
/// a short-lived share link; `cleanup_worker_download` releases it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDownloadCreds {
    pub provider: ProviderId,
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
}

/// Result of `prepare_upload_target`: extra credentials merged into the
/// upload, e.g. the series folder id on fileId-addressed stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTarget {
    pub provider: ProviderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
}

/// Builds a concrete store. The Drive and Share variants run against
/// in-process transports (provider wire encodings live outside this crate);
/// the Dav variant speaks to memory, a local directory, or a WebDAV-style
/// HTTP server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum RemoteStoreConfig {
    #[default]
    Drive,
    Share,
    Dav {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<Url>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root: Option<PathBuf>,
    },
}

impl RemoteStoreConfig {
    pub fn build(self, id: ProviderId, storage: Arc<Storage>) -> Result<RemoteStore> {
        match self {
            RemoteStoreConfig::Drive => Ok(RemoteStore::Drive(DriveStore::in_memory(id, storage))),
            RemoteStoreConfig::Share => Ok(RemoteStore::Share(ShareStore::in_memory(id, storage))),
            RemoteStoreConfig::Dav { url, root } => {
                Ok(RemoteStore::Dav(DavStore::open(id, url, root)?))
            }
        }
    }
}

pub enum RemoteStore {
    Drive(DriveStore),
    Dav(DavStore),
    Share(ShareStore),
}

impl RemoteStore {
    pub fn id(&self) -> &ProviderId {
        match self {
            RemoteStore::Drive(s) => s.id(),
            RemoteStore::Dav(s) => s.id(),
            RemoteStore::Share(s) => s.id(),
        }
    }

    pub fn caps(&self) -> ProviderCaps {
        match self {
            RemoteStore::Drive(s) => s.caps(),
            RemoteStore::Dav(s) => s.caps(),
            RemoteStore::Share(s) => s.caps(),
        }
    }

    /// Cheap local check; no network.
    pub fn is_authenticated(&self) -> bool {
        match self {
            RemoteStore::Drive(s) => s.is_authenticated(),
            RemoteStore::Dav(s) => s.is_authenticated(),
            RemoteStore::Share(s) => s.is_authenticated(),
        }
    }

    pub fn status(&self) -> ProviderStatus {
        match self {
            RemoteStore::Drive(s) => s.status(),
            RemoteStore::Dav(s) => s.status(),
            RemoteStore::Share(s) => s.status(),
        }
    }

    /// Flags the provider after an auth failure; cleared by the next
    /// successful login.
    pub fn mark_needs_attention(&self) {
        match self {
            RemoteStore::Drive(s) => s.mark_needs_attention(),
            RemoteStore::Share(s) => s.mark_needs_attention(),
            RemoteStore::Dav(_) => {}
        }
    }

    /// Validates and stores the given secret. Idempotent.
    pub async fn login(&self, secret: Option<&str>) -> Result<()> {
        match self {
            RemoteStore::Drive(s) => s.login(secret).await,
            RemoteStore::Dav(s) => s.login(secret).await,
            RemoteStore::Share(s) => s.login(secret).await,
        }
    }

    /// Clears stored tokens. The engine also drops this provider's listing
    /// cache. Idempotent.
    pub fn logout(&self) -> Result<()> {
        match self {
            RemoteStore::Drive(s) => s.logout(),
            RemoteStore::Dav(s) => s.logout(),
            RemoteStore::Share(s) => s.logout(),
        }
    }

    /// Full remote listing of volume-owning and top-level files.
    pub async fn list_volumes(&self) -> Result<Vec<RemoteFile>> {
        match self {
            RemoteStore::Drive(s) => s.list_volumes().await,
            RemoteStore::Dav(s) => s.list_volumes().await,
            RemoteStore::Share(s) => s.list_volumes().await,
        }
    }

    /// Creates or replaces; intermediate folders are ensured, using the
    /// canonical folder on stores that permit duplicate siblings. Returns
    /// the new file id.
    pub async fn upload(
        &self,
        path: &RemotePath,
        data: Bytes,
        description: Option<&str>,
        target: Option<&UploadTarget>,
    ) -> Result<String> {
        match self {
            RemoteStore::Drive(s) => s.upload(path, data, description, target).await,
            RemoteStore::Dav(s) => s.upload(path, data).await,
            RemoteStore::Share(s) => s.upload(path, data).await,
        }
    }

    /// Downloads one file with progress, resumable across transient
    /// failures.
    pub async fn download(
        &self,
        file_id: &str,
        on_progress: impl FnMut(FetchProgress) + Send,
    ) -> Result<Bytes> {
        match self {
            RemoteStore::Drive(s) => s.download(file_id, on_progress).await,
            RemoteStore::Dav(s) => s.download(file_id, on_progress).await,
            RemoteStore::Share(s) => s.download(file_id, on_progress).await,
        }
    }

    /// Downloads with a pre-acquired worker credential bundle.
    pub async fn worker_download(
        &self,
        creds: &WorkerDownloadCreds,
        on_progress: impl FnMut(FetchProgress) + Send,
    ) -> Result<Bytes> {
        match self {
            RemoteStore::Drive(s) => s.worker_download(creds, on_progress).await,
            RemoteStore::Dav(s) => s.download(&creds.file_id, on_progress).await,
            RemoteStore::Share(s) => s.worker_download(creds, on_progress).await,
        }
    }

    /// Idempotent on missing targets.
    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        match self {
            RemoteStore::Drive(s) => s.delete_file(file_id).await,
            RemoteStore::Dav(s) => s.delete_file(file_id).await,
            RemoteStore::Share(s) => s.delete_file(file_id).await,
        }
    }

    /// Idempotent on missing targets.
    pub async fn delete_series_folder(&self, series_title: &str) -> Result<()> {
        match self {
            RemoteStore::Drive(s) => s.delete_series_folder(series_title).await,
            RemoteStore::Dav(s) => s.delete_series_folder(series_title).await,
            RemoteStore::Share(s) => s.delete_series_folder(series_title).await,
        }
    }

    pub async fn quota(&self) -> Result<Option<StorageQuota>> {
        match self {
            RemoteStore::Drive(s) => s.quota().await.map(Some),
            RemoteStore::Dav(_) => Ok(None),
            RemoteStore::Share(s) => s.quota().await.map(Some),
        }
    }

    /// Minimal credential bundle for a worker download. May mint a
    /// short-lived share link.
    pub async fn worker_download_credentials(
        &self,
        file_id: &str,
    ) -> Result<WorkerDownloadCreds> {
        match self {
            RemoteStore::Drive(s) => s.download_credentials(file_id).await,
            RemoteStore::Dav(s) => Ok(WorkerDownloadCreds {
                provider: s.id().clone(),
                file_id: file_id.to_string(),
                access_token: None,
                share_url: None,
                expected_size: None,
            }),
            RemoteStore::Share(s) => s.download_credentials(file_id).await,
        }
    }

    /// Releases any short-lived grant minted for a worker download.
    /// Failures are non-fatal.
    pub async fn cleanup_worker_download(&self, file_id: &str) {
        let result = match self {
            RemoteStore::Drive(_) | RemoteStore::Dav(_) => Ok(()),
            RemoteStore::Share(s) => s.revoke_download_link(file_id).await,
        };
        if let Err(err) = result {
            tracing::debug!(file_id, ?err, "worker download cleanup failed");
        }
    }

    /// Ensures the series folder exists and returns credentials to merge
    /// into uploads. Callers serialise this per `(provider, series)`.
    pub async fn prepare_upload_target(&self, series_title: &str) -> Result<UploadTarget> {
        match self {
            RemoteStore::Drive(s) => s.prepare_upload_target(series_title).await,
            RemoteStore::Dav(s) => Ok(UploadTarget {
                provider: s.id().clone(),
                access_token: None,
                folder_id: None,
            }),
            RemoteStore::Share(s) => Ok(UploadTarget {
                provider: s.id().clone(),
                access_token: None,
                folder_id: None,
            }),
        }
    }

    /// Writes a file description. `Unsupported` on stores without
    /// descriptions; callers gate on `caps().editable_descriptions`.
    pub async fn update_description(&self, file_id: &str, description: &str) -> Result<()> {
        match self {
            RemoteStore::Drive(s) => s.update_description(file_id, description).await,
            RemoteStore::Dav(_) => Err(ProviderErr::Unsupported("webdav").into()),
            RemoteStore::Share(_) => Err(ProviderErr::Unsupported("share").into()),
        }
    }

    /// Folder primitives for the deduplicator, on stores that need it.
    pub fn folder_ops(&self) -> Option<&dyn FolderOps> {
        match self {
            RemoteStore::Drive(s) => Some(s),
            RemoteStore::Dav(_) | RemoteStore::Share(_) => None,
        }
    }
}
