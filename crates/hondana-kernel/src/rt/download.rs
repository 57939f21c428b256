//! The download queue.
//!
//! Placeholder volumes are fetched from their provider, merged with any OCR
//! and cover sidecars found in the listing, and ingested. The queue is
//! strictly FIFO and serial: one item transitions to in-flight at a time,
//! and the next is promoted only after the previous one released its
//! memory slot. Any step failing drops the item, surfaces the error, and
//! moves on.

use std::{collections::HashMap, sync::Arc};

use culprit::{Culprit, ResultExt};
use hondana_core::{ByteUnit, VolumeUuid, rpath::RemotePath, series_tag};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    err::EngineErr,
    ingest::{
        archive::Entry,
        build::{self, IngestOptions, IngestOutcome},
    },
    local::storage::Storage,
    model::{CloudShadow, ProviderId, RemoteFile},
    remote::{cache::ListingCache, provider::RemoteStore},
    rt::{
        pool::{TaskSpec, WorkerPool},
        progress::{Notifier, ProgressTracker},
        work::{WorkProgress, WorkReply, WorkRequest},
    },
};

pub type ProviderMap = HashMap<ProviderId, Arc<RemoteStore>>;

/// Fallback memory estimate when the remote size is unknown.
const DEFAULT_ARCHIVE_SIZE: ByteUnit = ByteUnit::from_mb(64);
/// Archive bytes plus decompressed pages, empirically ~2.8x the transfer.
const MEMORY_FACTOR: f64 = 2.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Queued,
    Downloading,
}

#[derive(Debug, Clone)]
pub struct DownloadItem {
    pub volume_uuid: VolumeUuid,
    pub cloud_file_id: String,
    pub cloud_provider: ProviderId,
    pub series_title: String,
    pub volume_title: String,
    pub size: Option<u64>,
    pub path: Option<RemotePath>,
    pub status: ItemStatus,
    pub library_id: Option<String>,
}

#[derive(Debug)]
pub struct DownloadOutcome {
    pub volume_uuid: VolumeUuid,
    pub result: culprit::Result<IngestOutcome, EngineErr>,
}

pub struct DownloadQueue {
    storage: Arc<Storage>,
    cache: Arc<ListingCache>,
    pool: WorkerPool,
    providers: Arc<ProviderMap>,
    progress: ProgressTracker,
    notifier: Arc<dyn Notifier>,
    queue: Mutex<std::collections::VecDeque<DownloadItem>>,
}

impl DownloadQueue {
    pub fn new(
        storage: Arc<Storage>,
        cache: Arc<ListingCache>,
        pool: WorkerPool,
        providers: Arc<ProviderMap>,
        progress: ProgressTracker,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        DownloadQueue {
            storage,
            cache,
            pool,
            providers,
            progress,
            notifier,
            queue: Mutex::new(Default::default()),
        }
    }

    /// Admits a placeholder into the queue. Only placeholders carrying a
    /// provider and file id are enqueueable; duplicates are rejected.
    pub fn enqueue(&self, record: &crate::model::VolumeRecord) -> bool {
        let Some(cloud) = record.cloud.as_ref() else {
            return false;
        };
        if !cloud.is_placeholder {
            return false;
        }
        let (Some(file_id), Some(provider)) = (cloud.file_id.clone(), cloud.provider.clone())
        else {
            return false;
        };

        let mut queue = self.queue.lock();
        if queue.iter().any(|item| item.volume_uuid == record.volume_uuid) {
            return false;
        }
        queue.push_back(DownloadItem {
            volume_uuid: record.volume_uuid,
            cloud_file_id: file_id,
            cloud_provider: provider,
            series_title: record.series_title.clone(),
            volume_title: record.volume_title.clone(),
            size: cloud.size,
            path: cloud.path.clone(),
            status: ItemStatus::Queued,
            library_id: cloud.library_id.clone(),
        });
        true
    }

    pub fn queued(&self) -> Vec<DownloadItem> {
        self.queue.lock().iter().cloned().collect()
    }

    /// Cancel-before-start: removes a queued item. The in-flight item runs
    /// to completion.
    pub fn cancel(&self, volume_uuid: &VolumeUuid) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|item| {
            item.status != ItemStatus::Queued || item.volume_uuid != *volume_uuid
        });
        queue.len() != before
    }

    /// Processes the queue serially until empty, preserving FIFO order.
    pub async fn drain(&self) -> Vec<DownloadOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let item = {
                let mut queue = self.queue.lock();
                match queue.front_mut() {
                    Some(item) => {
                        item.status = ItemStatus::Downloading;
                        item.clone()
                    }
                    None => break,
                }
            };

            let progress_id = format!("download:{}", item.volume_uuid);
            self.progress.begin(
                &progress_id,
                format!("Downloading {}/{}", item.series_title, item.volume_title),
            );

            let result = self.process(&item).await;
            match &result {
                Ok(outcome) => {
                    info!(volume = %item.volume_title, ?outcome, "download complete");
                    self.progress.complete(&progress_id);
                }
                Err(err) => {
                    warn!(volume = %item.volume_title, ?err, "download failed");
                    self.progress.fail(&progress_id, err.ctx().to_string());
                    self.notifier.notify(&format!(
                        "download of {}/{} failed: {}",
                        item.series_title,
                        item.volume_title,
                        err.ctx()
                    ));
                    if err.ctx().is_not_found() {
                        self.cache
                            .invalidate_entry(&item.cloud_provider, &item.cloud_file_id);
                    }
                }
            }

            self.queue.lock().pop_front();
            outcomes.push(DownloadOutcome { volume_uuid: item.volume_uuid, result });
        }
        outcomes
    }

    async fn process(&self, item: &DownloadItem) -> culprit::Result<IngestOutcome, EngineErr> {
        let store = self
            .providers
            .get(&item.cloud_provider)
            .ok_or_else(|| {
                Culprit::new(EngineErr::Provider(
                    crate::remote::provider::ProviderErr::NotFound(format!(
                        "provider {}",
                        item.cloud_provider
                    )),
                ))
            })?
            .clone();
        let caps = store.caps();

        let memory = ByteUnit::new(item.size.unwrap_or(DEFAULT_ARCHIVE_SIZE.as_u64()))
            .scale(MEMORY_FACTOR);
        let spec = TaskSpec {
            memory,
            provider_key: item.cloud_provider.op_key("download"),
            provider_limit: caps.download_concurrency,
        };

        // credentials are acquired inside prepare, at the moment the
        // scheduler actually starts the task, so they are never stale and
        // short-lived share links are not minted for queued work
        let prepare_store = store.clone();
        let file_id = item.cloud_file_id.clone();
        let file_name = format!("{}.cbz", item.volume_title);
        let handle = self.pool.submit(
            spec,
            Box::pin(async move {
                let creds = prepare_store
                    .worker_download_credentials(&file_id)
                    .await
                    .or_into_ctx()?;
                Ok(WorkRequest::DownloadAndDecompress {
                    store: prepare_store,
                    creds,
                    file_name,
                })
            }),
        );

        let progress_id = format!("download:{}", item.volume_uuid);
        let tracker = self.progress.clone();
        let task = handle
            .join_with(move |event| {
                if let WorkProgress::Transfer { loaded, total: Some(total) } = event
                    && total > 0
                {
                    tracker.update(&progress_id, ((loaded * 100) / total) as u8);
                }
            })
            .await;

        let result = async {
            let mut entries = match task.result? {
                WorkReply::Entries(entries) => entries,
                _ => return Err(Culprit::new(EngineErr::Cancelled)),
            };

            let archive_path = item
                .path
                .clone()
                .unwrap_or_else(|| {
                    RemotePath::volume(
                        &item.series_title,
                        &format!("{}.cbz", item.volume_title),
                    )
                });

            // merge remote sidecars that were not inside the archive
            let description = self.fetch_sidecars(&store, item, &archive_path, &mut entries).await;

            let opts = IngestOptions {
                series_override: description.as_deref().and_then(series_tag::parse).map(String::from),
                cloud: Some(CloudShadow {
                    is_placeholder: false,
                    provider: Some(item.cloud_provider.clone()),
                    file_id: Some(item.cloud_file_id.clone()),
                    modified: None,
                    size: item.size,
                    path: Some(archive_path.clone()),
                    thumbnail_file_id: None,
                    library_id: item.library_id.clone(),
                }),
            };

            let mut reports =
                build::ingest_entries(&self.storage, archive_path.as_str(), entries, &opts);
            let report = reports
                .pop()
                .ok_or_else(|| Culprit::new(EngineErr::Cancelled))?;
            let outcome = report.result.map_err(|err| err.map_ctx(EngineErr::from))?;

            self.backwrite_series_tag(&store, item, &archive_path, description, outcome)
                .await;

            store.cleanup_worker_download(&item.cloud_file_id).await;
            Ok(outcome)
        }
        .await;

        // promotion of the next item happens only after the slot is free
        task.lease.release();
        result
    }

    /// Fetches the OCR and thumbnail sidecars by exact stem match in the
    /// archive's folder, then by unique basename anywhere in the listing.
    /// Ambiguity always skips. Returns the archive's remote description.
    async fn fetch_sidecars(
        &self,
        store: &RemoteStore,
        item: &DownloadItem,
        archive_path: &RemotePath,
        entries: &mut Vec<Entry>,
    ) -> Option<String> {
        let listing = self.cache.get(&item.cloud_provider)?;
        let description = listing
            .files
            .get(&item.cloud_file_id)
            .and_then(|f| f.description.clone());

        let already_has_ocr = entries.items_have_sidecar();
        let wanted: &[(&str, bool)] = &[("mokuro", already_has_ocr), ("webp", false)];

        for (kind, skip) in wanted {
            if *skip {
                continue;
            }
            let Some(sidecar) = find_sidecar(&listing, archive_path, kind) else {
                continue;
            };
            match store.download(&sidecar.file_id, |_| {}).await {
                Ok(data) => {
                    debug!(path = %sidecar.path, "fetched sidecar");
                    entries.push(Entry::new(sidecar.path.file_name().to_string(), data));
                }
                Err(err) => {
                    debug!(path = %sidecar.path, ?err, "sidecar fetch failed, continuing");
                }
            }
        }
        description
    }

    /// Writes a `Series:` tag into the remote description when the
    /// canonical series name disagrees with the remote folder, never
    /// overwriting an existing tag; then patches the cache entry in place.
    async fn backwrite_series_tag(
        &self,
        store: &RemoteStore,
        item: &DownloadItem,
        archive_path: &RemotePath,
        description: Option<String>,
        outcome: IngestOutcome,
    ) {
        if !store.caps().editable_descriptions {
            return;
        }
        if description.as_deref().is_some_and(series_tag::is_tagged) {
            return;
        }
        let Ok(Some(record)) = self.storage.volume(&outcome.uuid()) else {
            return;
        };
        let folder = archive_path.series().unwrap_or_default();
        if hondana_core::rpath::norm(folder) == hondana_core::rpath::norm(&record.series_title) {
            return;
        }

        let mut tagged = series_tag::format(&record.series_title);
        if let Some(rest) = description.as_deref().filter(|d| !d.trim().is_empty()) {
            tagged = format!("{tagged}\n{rest}");
        }
        match store.update_description(&item.cloud_file_id, &tagged).await {
            Ok(()) => {
                self.cache
                    .update_entry(&item.cloud_provider, &item.cloud_file_id, |entry| {
                        entry.description = Some(tagged);
                    });
            }
            Err(err) => {
                debug!(?err, "series tag back-write failed, continuing");
            }
        }
    }
}

trait EntryListExt {
    fn items_have_sidecar(&self) -> bool;
}

impl EntryListExt for Vec<Entry> {
    fn items_have_sidecar(&self) -> bool {
        self.iter()
            .any(|e| e.path.ends_with(".mokuro") || e.path.ends_with(".mokuro.gz"))
    }
}

/// Sidecar lookup for one archive: exact stem match in the same folder,
/// then a unique basename match anywhere; two candidates mean ambiguity
/// and no fetch.
fn find_sidecar<'a>(
    listing: &'a crate::remote::cache::Listing,
    archive_path: &RemotePath,
    kind: &str,
) -> Option<&'a RemoteFile> {
    let stem_key = archive_path.stem_key();
    let is_kind = |file: &RemoteFile| match kind {
        "mokuro" => {
            file.path.file_name().ends_with(".mokuro")
                || file.path.file_name().ends_with(".mokuro.gz")
        }
        ext => hondana_core::rpath::ext(file.path.file_name()) == ext,
    };

    // exact: same folder, same stem
    if let Some(exact) = listing
        .iter()
        .find(|file| is_kind(file) && file.path.stem_key() == stem_key)
    {
        return Some(exact);
    }

    // fallback: unique basename match
    let base = hondana_core::rpath::norm(archive_path.stem());
    let mut candidates = listing
        .iter()
        .filter(|file| is_kind(file) && hondana_core::rpath::norm(file.path.stem()) == base);
    let first = candidates.next()?;
    if candidates.next().is_some() {
        debug!(stem = %base, kind, "ambiguous sidecar candidates, skipping");
        return None;
    }
    Some(first)
}
