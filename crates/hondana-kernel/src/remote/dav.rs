//! The path-addressed hierarchical store.
//!
//! Bytes travel through `object_store`: in-memory, a local directory, or a
//! WebDAV-style HTTP server. Paths are the file ids; there are no duplicate
//! siblings and no file descriptions. Read-only external libraries reuse
//! this store pointed at their server.

use std::{path::PathBuf, sync::Arc};

use bytes::Bytes;
use culprit::ResultExt;
use futures::TryStreamExt;
use hondana_core::rpath::RemotePath;
use object_store::{ObjectStore, local::LocalFileSystem, memory::InMemory, path::Path};
use url::Url;

use crate::{
    model::{LibraryConfig, ProviderId, ProviderStatus, RemoteFile},
    remote::{
        fetch::{self, FetchProgress, StoreRangeSource},
        provider::{APP_FOLDER, ProviderCaps, Result},
    },
};

const UPLOAD_CONCURRENCY: usize = 4;
const DOWNLOAD_CONCURRENCY: usize = 4;

pub struct DavStore {
    id: ProviderId,
    store: Arc<dyn ObjectStore>,
    /// Prefix inside the store; the app folder, or a library's base path.
    prefix: String,
    read_only: bool,
}

impl DavStore {
    pub fn open(id: ProviderId, url: Option<Url>, root: Option<PathBuf>) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match (url, root) {
            (Some(url), _) => Arc::new(
                object_store::http::HttpBuilder::new()
                    .with_url(url.to_string())
                    .build()?,
            ),
            (None, Some(root)) => Arc::new(LocalFileSystem::new_with_prefix(root)?),
            (None, None) => Arc::new(InMemory::new()),
        };
        Ok(DavStore {
            id,
            store,
            prefix: APP_FOLDER.to_string(),
            read_only: false,
        })
    }

    /// A read-only external library source.
    pub fn for_library(config: &LibraryConfig) -> Result<Self> {
        let url = Url::parse(&config.server_url)
            .map_err(|err| crate::remote::provider::ProviderErr::Path(err.to_string()))?;
        let store: Arc<dyn ObjectStore> = Arc::new(
            object_store::http::HttpBuilder::new()
                .with_url(url.to_string())
                .build()?,
        );
        Ok(DavStore {
            id: ProviderId::library(&config.id),
            store,
            prefix: config.base_path.trim_matches('/').to_string(),
            read_only: true,
        })
    }

    #[cfg(test)]
    pub(crate) fn in_memory(id: ProviderId) -> Self {
        DavStore {
            id,
            store: Arc::new(InMemory::new()),
            prefix: APP_FOLDER.to_string(),
            read_only: false,
        }
    }

    pub fn id(&self) -> &ProviderId {
        &self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
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

    /// Credentials live in the endpoint configuration; there is no separate
    /// token dance.
    pub fn is_authenticated(&self) -> bool {
        true
    }

    pub fn status(&self) -> ProviderStatus {
        ProviderStatus {
            authenticated: true,
            has_stored_credentials: true,
            needs_attention: false,
            status_message: "configured".to_string(),
        }
    }

    pub async fn login(&self, _secret: Option<&str>) -> Result<()> {
        Ok(())
    }

    pub fn logout(&self) -> Result<()> {
        Ok(())
    }

    fn full_path(&self, relative: &str) -> Path {
        if self.prefix.is_empty() {
            Path::from(relative)
        } else {
            Path::from(format!("{}/{relative}", self.prefix))
        }
    }

    pub async fn list_volumes(&self) -> Result<Vec<RemoteFile>> {
        let prefix = if self.prefix.is_empty() {
            None
        } else {
            Some(Path::from(self.prefix.as_str()))
        };
        let mut stream = self.store.list(prefix.as_ref());

        let mut files = Vec::new();
        while let Some(meta) = stream.try_next().await? {
            let location = meta.location.as_ref();
            let relative = if self.prefix.is_empty() {
                location
            } else {
                match location.strip_prefix(&format!("{}/", self.prefix)) {
                    Some(relative) => relative,
                    None => continue,
                }
            };
            // only bare files and Series/Volume.ext belong to the layout
            if relative.is_empty() || relative.split('/').count() > 2 {
                continue;
            }
            files.push(RemoteFile {
                provider: self.id.clone(),
                file_id: relative.to_string(),
                path: RemotePath::new(relative),
                modified: meta.last_modified,
                size: meta.size,
                description: None,
            });
        }
        Ok(files)
    }

    pub async fn upload(&self, path: &RemotePath, data: Bytes) -> Result<String> {
        let location = self.full_path(path.as_str());
        self.store.put(&location, data.into()).await?;
        Ok(path.as_str().to_string())
    }

    pub async fn download(
        &self,
        file_id: &str,
        on_progress: impl FnMut(FetchProgress) + Send,
    ) -> Result<Bytes> {
        let location = self.full_path(file_id);
        let source = StoreRangeSource::new(self.store.as_ref(), location);
        Ok(fetch::fetch_resumable(&source, &Default::default(), on_progress)
            .await
            .or_into_ctx()?)
    }

    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        match self.store.delete(&self.full_path(file_id)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete_series_folder(&self, series_title: &str) -> Result<()> {
        let prefix = self.full_path(series_title);
        let mut stream = self.store.list(Some(&prefix));
        let mut doomed = Vec::new();
        while let Some(meta) = stream.try_next().await? {
            doomed.push(meta.location);
        }
        drop(stream);
        for location in doomed {
            match self.store.delete(&location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_list_download() {
        let store = DavStore::in_memory(ProviderId::new("webdav"));
        let path = RemotePath::new("One Piece/Volume 01.cbz");
        let id = store
            .upload(&path, Bytes::from_static(b"archive"))
            .await
            .unwrap();
        assert_eq!(id, "One Piece/Volume 01.cbz");

        let listing = store.list_volumes().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].path, path);
        assert_eq!(listing[0].size, 7);
        assert!(listing[0].description.is_none());

        let body = store.download(&id, |_| {}).await.unwrap();
        assert_eq!(body.as_ref(), b"archive");
    }

    #[tokio::test]
    async fn test_upload_replaces() {
        let store = DavStore::in_memory(ProviderId::new("webdav"));
        let path = RemotePath::new("S/V.cbz");
        store.upload(&path, Bytes::from_static(b"one")).await.unwrap();
        store.upload(&path, Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(store.list_volumes().await.unwrap().len(), 1);
        assert_eq!(
            store.download("S/V.cbz", |_| {}).await.unwrap().as_ref(),
            b"two"
        );
    }

    #[tokio::test]
    async fn test_deep_paths_are_ignored() {
        let store = DavStore::in_memory(ProviderId::new("webdav"));
        store
            .upload(&RemotePath::new("a/b/c.cbz"), Bytes::from_static(b"x"))
            .await
            .unwrap();
        store
            .upload(&RemotePath::new("stats.json"), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let listing = store.list_volumes().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].path.as_str(), "stats.json");
    }

    #[tokio::test]
    async fn test_deletes_are_idempotent() {
        let store = DavStore::in_memory(ProviderId::new("webdav"));
        store
            .upload(&RemotePath::new("S/V.cbz"), Bytes::from_static(b"x"))
            .await
            .unwrap();
        store.delete_file("S/V.cbz").await.unwrap();
        store.delete_file("S/V.cbz").await.unwrap();

        store
            .upload(&RemotePath::new("S/V.cbz"), Bytes::from_static(b"x"))
            .await
            .unwrap();
        store.delete_series_folder("S").await.unwrap();
        assert!(store.list_volumes().await.unwrap().is_empty());
        store.delete_series_folder("S").await.unwrap();
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let store = DavStore::in_memory(ProviderId::new("webdav"));
        let err = store.download("S/V.cbz", |_| {}).await.unwrap_err();
        assert!(matches!(
            err.ctx(),
            crate::remote::provider::ProviderErr::Fetch(_)
        ));
    }
}
