//! The engine facade.
//!
//! Owns the storage handle, the per-provider listing caches, the worker
//! pool, and both queues, and exposes the operations the CLI (or any other
//! frontend) drives: refresh, reconcile, download, backup/export, upgrade,
//! removal, folder dedup, and URL import.

use std::sync::Arc;

use culprit::{Culprit, ResultExt};
use hondana_core::{VolumeUuid, rpath};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    err::{EngineErr, Result},
    ingest::{
        archive::{self, Entry},
        build::{self, IngestOptions, IngestOutcome, IngestReport},
    },
    local::storage::Storage,
    model::{ProviderId, ProviderStatus},
    reconcile::{self, Reconciliation, SeriesGroup, UpgradeCandidate},
    remote::{
        cache::ListingCache,
        dav::DavStore,
        fetch::{self, HttpRangeSource},
        folders::{DedupReport, dedupe_folders},
        provider::{APP_FOLDER, ProviderErr, RemoteStore, RemoteStoreConfig},
    },
    rt::{
        backup::{BackupOutcome, BackupQueue, BackupRequest},
        download::{DownloadOutcome, DownloadQueue, ProviderMap},
        pool::{PoolConfig, WorkerPool},
        progress::{LogNotifier, Notifier, ProgressTracker},
    },
};

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub providers: Vec<(ProviderId, RemoteStoreConfig)>,
}

pub struct Engine {
    storage: Arc<Storage>,
    cache: Arc<ListingCache>,
    providers: Arc<ProviderMap>,
    progress: ProgressTracker,
    downloads: DownloadQueue,
    backups: BackupQueue,
}

impl Engine {
    pub fn new(storage: Arc<Storage>, config: EngineConfig) -> Result<Self> {
        Self::with_notifier(storage, config, Arc::new(LogNotifier))
    }

    pub fn with_notifier(
        storage: Arc<Storage>,
        config: EngineConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let mut providers: ProviderMap = Default::default();
        for (id, store_config) in config.providers {
            let store = store_config
                .build(id.clone(), storage.clone())
                .or_into_ctx()?;
            providers.insert(id, Arc::new(store));
        }
        // read-only external libraries are webdav-style sources
        for library in storage.libraries().or_into_ctx()? {
            let store = DavStore::for_library(&library).or_into_ctx()?;
            providers.insert(store.id().clone(), Arc::new(RemoteStore::Dav(store)));
        }
        let providers = Arc::new(providers);

        let cache = Arc::new(ListingCache::new());
        let progress = ProgressTracker::new();
        // both queues share one lazily-built pool; the Arc inside is the
        // usage counter and the pool dies with its last queue
        let pool = WorkerPool::new(config.pool);

        let downloads = DownloadQueue::new(
            storage.clone(),
            cache.clone(),
            pool.clone(),
            providers.clone(),
            progress.clone(),
            notifier.clone(),
        );
        let backups = BackupQueue::new(
            storage.clone(),
            cache.clone(),
            pool,
            providers.clone(),
            progress.clone(),
            notifier,
        );

        Ok(Engine {
            storage,
            cache,
            providers,
            progress,
            downloads,
            backups,
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn cache(&self) -> &Arc<ListingCache> {
        &self.cache
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn downloads(&self) -> &DownloadQueue {
        &self.downloads
    }

    pub fn backups(&self) -> &BackupQueue {
        &self.backups
    }

    pub fn provider(&self, id: &ProviderId) -> Result<&Arc<RemoteStore>> {
        self.providers.get(id).ok_or_else(|| {
            Culprit::new(EngineErr::Provider(ProviderErr::NotFound(format!(
                "provider {id}"
            ))))
        })
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn provider_status(&self) -> Vec<(ProviderId, ProviderStatus)> {
        let mut out: Vec<(ProviderId, ProviderStatus)> = self
            .providers
            .iter()
            .map(|(id, store)| (id.clone(), store.status()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Fetches fresh listings into the cache, for one provider or all.
    pub async fn refresh(&self, only: Option<&ProviderId>) -> Result<()> {
        for (id, store) in self.providers.iter() {
            if only.is_some_and(|wanted| wanted != id) {
                continue;
            }
            if !store.is_authenticated() {
                debug!(provider = %id, "skipping refresh, not authenticated");
                continue;
            }
            match store.list_volumes().await {
                Ok(files) => {
                    info!(provider = %id, files = files.len(), "listing refreshed");
                    self.cache.replace(id, files);
                }
                Err(err) => {
                    if err.ctx().is_auth() {
                        store.mark_needs_attention();
                    }
                    return Err(err.map_ctx(EngineErr::from));
                }
            }
        }
        Ok(())
    }

    /// Merges locals with the cached remote listings.
    pub fn reconcile(&self) -> Result<Reconciliation> {
        let locals = self.storage.volumes().or_into_ctx()?;
        Ok(reconcile::reconcile(&locals, &self.cache.snapshot_all()))
    }

    /// The derived catalog: series groups over locals plus placeholders.
    pub fn catalog(&self) -> Result<Vec<SeriesGroup>> {
        Ok(reconcile::catalog(self.reconcile()?.volumes))
    }

    /// Runs the OCR auto-upgrades the reconciler proposed: each sidecar is
    /// fetched alone (a small file) and merged in place; files and reading
    /// stats survive. Re-running on an upgraded volume is a no-op.
    pub async fn run_upgrades(
        &self,
        candidates: Vec<UpgradeCandidate>,
    ) -> Vec<(VolumeUuid, Result<IngestOutcome>)> {
        let mut outcomes = Vec::new();
        for candidate in candidates {
            let result = self.upgrade_one(&candidate).await;
            if let Err(err) = &result {
                warn!(volume = %candidate.volume_uuid, ?err, "ocr upgrade failed");
            }
            outcomes.push((candidate.volume_uuid, result));
        }
        outcomes
    }

    async fn upgrade_one(&self, candidate: &UpgradeCandidate) -> Result<IngestOutcome> {
        let store = self.provider(&candidate.provider)?;
        let data = store
            .download(&candidate.sidecar.file_id, |_| {})
            .await
            .or_into_ctx()?;

        let record = self
            .storage
            .volume(&candidate.volume_uuid)
            .or_into_ctx()?
            .ok_or_else(|| {
                Culprit::new(EngineErr::Ingest(
                    crate::ingest::build::IngestErr::VolumeNotFound(candidate.volume_uuid),
                ))
            })?;

        let base_path = format!("{}/{}.cbz", record.series_title, record.volume_title);
        let entries = vec![Entry::new(
            candidate.sidecar.path.file_name().to_string(),
            data,
        )];
        let mut reports =
            build::ingest_entries(&self.storage, &base_path, entries, &IngestOptions::default());
        let report = reports
            .pop()
            .ok_or_else(|| Culprit::new(EngineErr::Cancelled))?;
        report.result.map_err(|err| err.map_ctx(EngineErr::from))
    }

    /// Ingests a dropped archive file.
    pub fn ingest_archive(&self, base_path: &str, data: &[u8]) -> Vec<IngestReport> {
        build::ingest_archive(&self.storage, base_path, data, &IngestOptions::default())
    }

    /// The import-URL surface: fetches the archive (resumable), plus the
    /// sidecars its stem implies next to it, then ingests as if the files
    /// had been dropped locally.
    pub async fn import_url(
        &self,
        source: &Url,
        manga: Option<&str>,
        volume: Option<&str>,
    ) -> Result<Vec<IngestReport>> {
        let source_name = source
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or("volume.cbz")
            .to_string();
        let volume_title = volume.map(str::to_string).unwrap_or_else(|| {
            rpath::stem(&source_name).to_string()
        });

        let archive_source = HttpRangeSource::new(source.as_str());
        let data = fetch::fetch_resumable(&archive_source, &Default::default(), |_| {})
            .await
            .or_into_ctx()?;
        let mut entries = archive::unpack(&data)
            .map_err(crate::ingest::build::IngestErr::from)
            .map_err(EngineErr::from)?;

        // the listing implied by the url: sidecars sharing the stem
        for ext in ["mokuro", "webp"] {
            let mut sidecar_url = source.clone();
            let stem = rpath::stem(source.path());
            sidecar_url.set_path(&format!("{stem}.{ext}"));
            let sidecar = HttpRangeSource::new(sidecar_url.as_str());
            if let Ok(data) =
                fetch::fetch_resumable(&sidecar, &Default::default(), |_| {}).await
            {
                entries.push(Entry::new(format!("{volume_title}.{ext}"), data));
            }
        }

        let base_path = match manga {
            Some(series) => format!("{series}/{volume_title}.cbz"),
            None => format!("{volume_title}.cbz"),
        };

        Ok(build::ingest_entries(
            &self.storage,
            &base_path,
            entries,
            &IngestOptions::default(),
        ))
    }

    /// Removes a volume: local rows always, remote siblings on request.
    pub async fn remove_volume(&self, uuid: &VolumeUuid, delete_remote: bool) -> Result<()> {
        let record = self.storage.volume(uuid).or_into_ctx()?;

        if delete_remote
            && let Some(cloud) = record.as_ref().and_then(|r| r.cloud.as_ref())
            && let (Some(provider), Some(file_id)) = (&cloud.provider, &cloud.file_id)
        {
            let store = self.provider(provider)?;
            store.delete_file(file_id).await.or_into_ctx()?;
            // sidecars share the archive's stem
            if let (Some(listing), Some(path)) = (self.cache.get(provider), &cloud.path) {
                let stem_key = path.stem_key();
                for sibling in listing.iter() {
                    if sibling.file_id != *file_id && sibling.path.stem_key() == stem_key {
                        store
                            .delete_file(&sibling.file_id)
                            .await
                            .or_into_ctx()?;
                    }
                }
            }
            self.cache.invalidate_entry(provider, file_id);
        }

        self.storage.remove_volume(uuid).or_into_ctx()?;
        Ok(())
    }

    /// Resolves duplicate sibling folders on a provider that can grow them.
    pub async fn dedupe_folders(&self, provider: &ProviderId) -> Result<DedupReport> {
        let store = self.provider(provider)?;
        match store.folder_ops() {
            Some(ops) => Ok(dedupe_folders(ops, APP_FOLDER).await.or_into_ctx()?),
            None => Ok(DedupReport::default()),
        }
    }

    /// Enqueues every current placeholder and drains the download queue.
    pub async fn download_all_placeholders(&self) -> Result<Vec<DownloadOutcome>> {
        let reconciliation = self.reconcile()?;
        for placeholder in reconciliation
            .volumes
            .iter()
            .filter(|v| v.is_placeholder())
        {
            self.downloads.enqueue(placeholder);
        }
        Ok(self.downloads.drain().await)
    }

    pub async fn run_backups(&self, requests: Vec<BackupRequest>) -> Vec<BackupOutcome> {
        self.backups.run(requests).await
    }

    /// Logs a provider out and drops its cached listing.
    pub fn logout(&self, provider: &ProviderId) -> Result<()> {
        let store = self.provider(provider)?;
        store.logout().or_into_ctx()?;
        self.cache.clear(provider);
        Ok(())
    }

    /// Finds a volume by `"Series/Volume"` selector or uuid string.
    pub fn resolve_selector(&self, selector: &str) -> Result<Option<VolumeUuid>> {
        if let Ok(uuid) = selector.parse::<VolumeUuid>() {
            return Ok(Some(uuid));
        }
        let Some((series, volume)) = selector.split_once('/') else {
            return Ok(None);
        };
        let wanted = (rpath::norm(series.trim()), rpath::norm(volume.trim()));
        for record in self.storage.volumes().or_into_ctx()? {
            if (rpath::norm(&record.series_title), rpath::norm(&record.volume_title)) == wanted {
                return Ok(Some(record.volume_uuid));
            }
        }
        // placeholders resolve too, so downloads can be selected by name
        for placeholder in self.reconcile()?.volumes {
            if (
                rpath::norm(&placeholder.series_title),
                rpath::norm(&placeholder.volume_title),
            ) == wanted
            {
                return Ok(Some(placeholder.volume_uuid));
            }
        }
        Ok(None)
    }

    /// Looks a volume (real or placeholder) up in the derived view.
    pub fn derived_volume(&self, uuid: &VolumeUuid) -> Result<Option<crate::model::VolumeRecord>> {
        Ok(self
            .reconcile()?
            .volumes
            .into_iter()
            .find(|v| v.volume_uuid == *uuid))
    }
}
