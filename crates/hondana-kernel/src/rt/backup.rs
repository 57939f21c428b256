//! The backup/export queue.
//!
//! Both products share one pipeline: pages stream out of storage into a
//! fresh archive on a worker, which is then either uploaded to a provider
//! or handed back to the caller (the `export` pseudo-provider). Unlike the
//! download queue, items run in parallel up to the provider's upload cap.
//! Series upload targets are prepared under a lock keyed by
//! `(provider, series)` so exactly one task creates the folder and the rest
//! reuse it. Successful uploads insert an optimistic cache entry; one full
//! listing refresh replaces the cache after the whole batch drains.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use culprit::{Culprit, ResultExt};
use hondana_core::{ByteUnit, VolumeUuid, rpath, rpath::RemotePath};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{
    err::EngineErr,
    ingest::{build::IngestErr, compress::{CompressedVolume, SidecarOptions}},
    local::storage::Storage,
    model::{ProviderId, RemoteFile},
    remote::{cache::ListingCache, provider::{RemoteStore, UploadTarget}},
    rt::{
        download::ProviderMap,
        pool::{TaskSpec, WorkerPool},
        progress::{Notifier, ProgressTracker},
        work::{Deliver, Phase, WorkProgress, WorkReply, WorkRequest},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupTarget {
    Provider(ProviderId),
    /// Compress locally and hand the archive back to the caller.
    Export,
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub volume_uuid: VolumeUuid,
    pub target: BackupTarget,
    pub opts: SidecarOptions,
}

#[derive(Debug)]
pub enum BackupProduct {
    Uploaded {
        file_id: String,
        path: RemotePath,
        size: u64,
    },
    Exported(CompressedVolume),
}

#[derive(Debug)]
pub struct BackupOutcome {
    pub volume_uuid: VolumeUuid,
    pub result: culprit::Result<BackupProduct, EngineErr>,
}

type FolderLock = Arc<tokio::sync::Mutex<Option<UploadTarget>>>;

pub struct BackupQueue {
    storage: Arc<Storage>,
    cache: Arc<ListingCache>,
    pool: WorkerPool,
    providers: Arc<ProviderMap>,
    progress: ProgressTracker,
    notifier: Arc<dyn Notifier>,
    /// `(provider, series)` -> prepared upload target.
    folder_locks: Mutex<HashMap<(ProviderId, String), FolderLock>>,
}

impl BackupQueue {
    pub fn new(
        storage: Arc<Storage>,
        cache: Arc<ListingCache>,
        pool: WorkerPool,
        providers: Arc<ProviderMap>,
        progress: ProgressTracker,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        BackupQueue {
            storage,
            cache,
            pool,
            providers,
            progress,
            notifier,
            folder_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Runs a batch. Outcomes are returned in request order; execution
    /// order is whatever the scheduler admits.
    pub async fn run(&self, requests: Vec<BackupRequest>) -> Vec<BackupOutcome> {
        let mut touched: Vec<ProviderId> = Vec::new();
        for request in &requests {
            if let BackupTarget::Provider(provider) = &request.target
                && !touched.contains(provider)
            {
                touched.push(provider.clone());
            }
        }

        let outcomes =
            futures::future::join_all(requests.into_iter().map(|request| async move {
                let volume_uuid = request.volume_uuid;
                let result = self.handle(request).await;
                if let Err(err) = &result {
                    self.notifier
                        .notify(&format!("backup of {volume_uuid} failed: {}", err.ctx()));
                }
                BackupOutcome { volume_uuid, result }
            }))
            .await;

        // one full refresh per touched provider, only after the batch has
        // drained, so optimistic entries are never clobbered mid-flight
        for provider in touched {
            if let Some(store) = self.providers.get(&provider) {
                match store.list_volumes().await {
                    Ok(files) => self.cache.replace(&provider, files),
                    Err(err) => {
                        warn!(%provider, ?err, "post-backup refresh failed, keeping optimistic cache")
                    }
                }
            }
        }

        outcomes
    }

    async fn handle(
        &self,
        request: BackupRequest,
    ) -> culprit::Result<BackupProduct, EngineErr> {
        let record = self
            .storage
            .volume(&request.volume_uuid)
            .or_into_ctx()?
            .ok_or_else(|| {
                Culprit::new(EngineErr::Ingest(IngestErr::VolumeNotFound(
                    request.volume_uuid,
                )))
            })?;

        let progress_id = format!("backup:{}", record.volume_uuid);
        self.progress.begin(
            &progress_id,
            format!("Backing up {}/{}", record.series_title, record.volume_title),
        );

        let memory = ByteUnit::from_mb((record.page_count as u64).max(16));
        let path = RemotePath::volume(
            &record.series_title,
            &format!("{}.cbz", record.volume_title),
        );

        let (spec, prepare): (TaskSpec, _) = match &request.target {
            BackupTarget::Export => {
                let spec = TaskSpec {
                    memory,
                    provider_key: "export:compress".to_string(),
                    provider_limit: self.pool.max_workers().saturating_sub(2).max(1),
                };
                let storage = self.storage.clone();
                let volume = request.volume_uuid;
                let opts = request.opts;
                let prepare: futures::future::BoxFuture<'static, _> = Box::pin(async move {
                    Ok(WorkRequest::CompressFromDb {
                        storage,
                        volume,
                        opts,
                        deliver: Deliver::Return,
                    })
                });
                (spec, prepare)
            }
            BackupTarget::Provider(provider) => {
                let store = self
                    .providers
                    .get(provider)
                    .ok_or_else(|| {
                        Culprit::new(EngineErr::Provider(
                            crate::remote::provider::ProviderErr::NotFound(format!(
                                "provider {provider}"
                            )),
                        ))
                    })?
                    .clone();
                let spec = TaskSpec {
                    memory,
                    provider_key: provider.op_key("upload"),
                    provider_limit: store.caps().upload_concurrency,
                };

                let lock = self.folder_lock(provider, &record.series_title);
                let series = record.series_title.clone();
                let storage = self.storage.clone();
                let volume = request.volume_uuid;
                let opts = request.opts;
                let upload_path = path.clone();
                let prepare: futures::future::BoxFuture<'static, _> = Box::pin(async move {
                    // the first task for a series creates the folder while
                    // the others wait here and reuse the prepared target
                    let target = {
                        let mut guard = lock.lock().await;
                        match guard.as_ref() {
                            Some(target) => target.clone(),
                            None => {
                                let target =
                                    store.prepare_upload_target(&series).await.or_into_ctx()?;
                                *guard = Some(target.clone());
                                target
                            }
                        }
                    };
                    Ok(WorkRequest::CompressFromDb {
                        storage,
                        volume,
                        opts,
                        deliver: Deliver::Upload {
                            store,
                            path: upload_path,
                            description: None,
                            target: Some(target),
                        },
                    })
                });
                (spec, prepare)
            }
        };

        let handle = self.pool.submit(spec, prepare);
        let tracker = self.progress.clone();
        let tracker_id = progress_id.clone();
        let task = handle
            .join_with(move |event| {
                if let WorkProgress::Phase { phase, percent } = event {
                    let scaled = match phase {
                        Phase::Compressing => percent / 2,
                        Phase::Sidecars => 50,
                        Phase::Uploading => 50 + percent / 2,
                    };
                    tracker.update(&tracker_id, scaled);
                }
            })
            .await;

        let result = match task.result {
            Ok(WorkReply::Compressed { file_id, size, data }) => match &request.target {
                BackupTarget::Export => match data {
                    Some(compressed) => Ok(BackupProduct::Exported(compressed)),
                    None => Err(Culprit::new(EngineErr::Cancelled)),
                },
                BackupTarget::Provider(provider) => {
                    let file_id = file_id.ok_or_else(|| Culprit::new(EngineErr::Cancelled))?;
                    // the UI sees the new file immediately; the real size
                    // arrives with the next full listing
                    self.cache.insert_optimistic(
                        provider,
                        RemoteFile {
                            provider: provider.clone(),
                            file_id: file_id.clone(),
                            path: path.clone(),
                            modified: Utc::now(),
                            size: 0,
                            description: None,
                        },
                    );
                    Ok(BackupProduct::Uploaded { file_id, path: path.clone(), size })
                }
            },
            Ok(_) => Err(Culprit::new(EngineErr::Cancelled)),
            Err(err) => Err(err),
        };

        task.lease.release();

        match &result {
            Ok(product) => {
                info!(volume = %record.volume_title, ?product, "backup complete");
                self.progress.complete(&progress_id);
            }
            Err(err) => {
                self.progress.fail(&progress_id, err.ctx().to_string());
            }
        }
        result
    }

    fn folder_lock(&self, provider: &ProviderId, series: &str) -> FolderLock {
        self.folder_locks
            .lock()
            .entry((provider.clone(), rpath::norm(series)))
            .or_default()
            .clone()
    }
}
