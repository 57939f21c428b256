//! Worker payloads.
//!
//! Requests are tagged with a mode discriminator and executed off the main
//! orchestrator: network transfer stays on the async runtime, CPU-bound
//! decompression and compression run on the blocking pool.

use std::sync::Arc;

use bytes::Bytes;
use culprit::ResultExt;
use hondana_core::{VolumeUuid, rpath::RemotePath};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    err::EngineErr,
    ingest::{
        archive::{self, Entry},
        compress::{CompressedVolume, SidecarOptions, compress_volume},
    },
    local::storage::Storage,
    model::ProviderId,
    remote::provider::{RemoteStore, UploadTarget, WorkerDownloadCreds},
};

pub type Result<T> = culprit::Result<T, EngineErr>;

/// Selective extraction filter for `DecompressOnly`.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub extensions: Vec<String>,
    pub path_prefixes: Vec<String>,
}

impl EntryFilter {
    fn matches(&self, path: &str) -> bool {
        let ext_ok = self.extensions.is_empty()
            || self
                .extensions
                .iter()
                .any(|ext| hondana_core::rpath::ext(path) == *ext);
        let prefix_ok = self.path_prefixes.is_empty()
            || self.path_prefixes.iter().any(|p| path.starts_with(p.as_str()));
        ext_ok && prefix_ok
    }
}

/// Which way a compressed volume leaves the worker.
pub enum Deliver {
    /// Stream to the provider and report the new file id.
    Upload {
        store: Arc<RemoteStore>,
        path: RemotePath,
        description: Option<String>,
        target: Option<UploadTarget>,
    },
    /// Hand the blob back to the caller (export).
    Return,
}

/// One extraction target of `StreamExtract`.
pub struct StreamTarget {
    pub volume: VolumeUuid,
    pub path_prefix: String,
    pub mokuro_path: Option<String>,
}

/// Tagged worker request.
pub enum WorkRequest {
    DownloadAndDecompress {
        store: Arc<RemoteStore>,
        creds: WorkerDownloadCreds,
        file_name: String,
    },
    DecompressOnly {
        file_name: String,
        blob: Bytes,
        filter: Option<EntryFilter>,
        list_only: bool,
        /// List every path but extract only the filtered entries.
        list_all_extract_filtered: bool,
    },
    /// Splits one container into per-volume entry groups.
    StreamExtract {
        blob: Bytes,
        targets: Vec<StreamTarget>,
    },
    CompressFromDb {
        storage: Arc<Storage>,
        volume: VolumeUuid,
        opts: SidecarOptions,
        deliver: Deliver,
    },
}

impl WorkRequest {
    pub fn mode(&self) -> &'static str {
        match self {
            WorkRequest::DownloadAndDecompress { .. } => "download-and-decompress",
            WorkRequest::DecompressOnly { .. } => "decompress-only",
            WorkRequest::StreamExtract { .. } => "stream-extract",
            WorkRequest::CompressFromDb { .. } => "compress-from-db",
        }
    }
}

/// Tagged worker reply.
#[derive(Debug)]
pub enum WorkReply {
    Entries(Vec<Entry>),
    Listing(Vec<String>),
    ListingAndEntries {
        paths: Vec<String>,
        entries: Vec<Entry>,
    },
    Extracted(Vec<(VolumeUuid, Vec<Entry>)>),
    Compressed {
        file_id: Option<String>,
        size: u64,
        data: Option<CompressedVolume>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compressing,
    Sidecars,
    Uploading,
}

/// Progress events emitted by a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkProgress {
    Transfer { loaded: u64, total: Option<u64> },
    Phase { phase: Phase, percent: u8 },
}

/// Executes one request. Network I/O runs inline on the async runtime;
/// decompression and compression hop onto the blocking pool.
pub async fn execute(
    request: WorkRequest,
    progress: UnboundedSender<WorkProgress>,
) -> Result<WorkReply> {
    match request {
        WorkRequest::DownloadAndDecompress { store, creds, file_name } => {
            let tx = progress.clone();
            let blob = store
                .worker_download(&creds, move |p| {
                    let _ = tx.send(WorkProgress::Transfer {
                        loaded: p.loaded,
                        total: p.total,
                    });
                })
                .await
                .or_into_ctx()?;
            tracing::debug!(file = %file_name, bytes = blob.len(), "downloaded, decompressing");
            let entries = tokio::task::spawn_blocking(move || archive::unpack(&blob))
                .await
                .map_err(|_| EngineErr::Cancelled)?
                .map_err(crate::ingest::build::IngestErr::from)
                .map_err(EngineErr::from)?;
            Ok(WorkReply::Entries(entries))
        }

        WorkRequest::DecompressOnly {
            file_name,
            blob,
            filter,
            list_only,
            list_all_extract_filtered,
        } => {
            let entries = tokio::task::spawn_blocking(move || archive::unpack(&blob))
                .await
                .map_err(|_| EngineErr::Cancelled)?
                .map_err(crate::ingest::build::IngestErr::from)
                .map_err(EngineErr::from)?;
            tracing::trace!(file = %file_name, entries = entries.len(), "decompressed");
            if list_only {
                return Ok(WorkReply::Listing(
                    entries.into_iter().map(|e| e.path).collect(),
                ));
            }
            let all_paths: Vec<String> = entries.iter().map(|e| e.path.clone()).collect();
            let entries: Vec<Entry> = match filter {
                Some(filter) => entries
                    .into_iter()
                    .filter(|e| filter.matches(&e.path))
                    .collect(),
                None => entries,
            };
            if list_all_extract_filtered {
                return Ok(WorkReply::ListingAndEntries { paths: all_paths, entries });
            }
            Ok(WorkReply::Entries(entries))
        }

        WorkRequest::StreamExtract { blob, targets } => {
            let entries = tokio::task::spawn_blocking(move || archive::unpack(&blob))
                .await
                .map_err(|_| EngineErr::Cancelled)?
                .map_err(crate::ingest::build::IngestErr::from)
                .map_err(EngineErr::from)?;
            let mut groups: Vec<(VolumeUuid, Vec<Entry>)> = targets
                .iter()
                .map(|t| (t.volume, Vec::new()))
                .collect();
            for entry in entries {
                for (target, (_, group)) in targets.iter().zip(groups.iter_mut()) {
                    let wanted = entry.path.starts_with(&target.path_prefix)
                        || target.mokuro_path.as_deref() == Some(entry.path.as_str());
                    if wanted {
                        group.push(entry.clone());
                    }
                }
            }
            Ok(WorkReply::Extracted(groups))
        }

        WorkRequest::CompressFromDb { storage, volume, opts, deliver } => {
            let tx = progress.clone();
            let compressed = tokio::task::spawn_blocking(move || {
                compress_volume(&storage, &volume, opts, |percent| {
                    let _ = tx.send(WorkProgress::Phase {
                        phase: Phase::Compressing,
                        percent,
                    });
                })
            })
            .await
            .map_err(|_| EngineErr::Cancelled)?
            .or_into_ctx()?;

            let _ = progress.send(WorkProgress::Phase { phase: Phase::Sidecars, percent: 100 });

            match deliver {
                Deliver::Return => Ok(WorkReply::Compressed {
                    file_id: None,
                    size: compressed.archive.len() as u64,
                    data: Some(compressed),
                }),
                Deliver::Upload { store, path, description, target } => {
                    let _ = progress.send(WorkProgress::Phase {
                        phase: Phase::Uploading,
                        percent: 0,
                    });
                    let size = compressed.archive.len() as u64;
                    let file_id = store
                        .upload(
                            &path,
                            compressed.archive.clone(),
                            description.as_deref(),
                            target.as_ref(),
                        )
                        .await
                        .or_into_ctx()?;

                    // sidecars requested but not embedded travel as siblings
                    for (name, data) in &compressed.sidecars {
                        let sidecar_path = match path.series() {
                            Some(series) => RemotePath::volume(series, name),
                            None => RemotePath::new(name.clone()),
                        };
                        store
                            .upload(&sidecar_path, data.clone(), None, target.as_ref())
                            .await
                            .or_into_ctx()?;
                    }

                    let _ = progress.send(WorkProgress::Phase {
                        phase: Phase::Uploading,
                        percent: 100,
                    });
                    Ok(WorkReply::Compressed { file_id: Some(file_id), size, data: None })
                }
            }
        }
    }
}

/// Concurrency bucket key for the scheduler.
pub fn op_key(provider: &ProviderId, op: &str) -> String {
    provider.op_key(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::archive::testutil::zip_bytes;

    fn channel() -> (
        UnboundedSender<WorkProgress>,
        tokio::sync::mpsc::UnboundedReceiver<WorkProgress>,
    ) {
        tokio::sync::mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn test_decompress_only_with_filter() {
        let blob = zip_bytes(&[
            ("01.jpg", b"a".as_slice()),
            ("v.mokuro", b"{}".as_slice()),
            ("notes.txt", b"x".as_slice()),
        ]);
        let (tx, _rx) = channel();
        let reply = execute(
            WorkRequest::DecompressOnly {
                file_name: "v.cbz".into(),
                blob: blob.clone().into(),
                filter: Some(EntryFilter {
                    extensions: vec!["jpg".into(), "mokuro".into()],
                    path_prefixes: vec![],
                }),
                list_only: false,
                list_all_extract_filtered: false,
            },
            tx,
        )
        .await
        .unwrap();
        match reply {
            WorkReply::Entries(entries) => {
                let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
                assert_eq!(paths, vec!["01.jpg", "v.mokuro"]);
            }
            _ => panic!("expected entries"),
        }

        let (tx, _rx) = channel();
        let reply = execute(
            WorkRequest::DecompressOnly {
                file_name: "v.cbz".into(),
                blob: blob.into(),
                filter: None,
                list_only: true,
                list_all_extract_filtered: false,
            },
            tx,
        )
        .await
        .unwrap();
        match reply {
            WorkReply::Listing(paths) => assert_eq!(paths.len(), 3),
            _ => panic!("expected listing"),
        }
    }

    #[tokio::test]
    async fn test_stream_extract_groups_by_prefix() {
        let blob = zip_bytes(&[
            ("a/01.jpg", b"1".as_slice()),
            ("b/01.jpg", b"2".as_slice()),
            ("a.mokuro", b"{}".as_slice()),
        ]);
        let va = VolumeUuid::derive("s", "a");
        let vb = VolumeUuid::derive("s", "b");
        let (tx, _rx) = channel();
        let reply = execute(
            WorkRequest::StreamExtract {
                blob: blob.into(),
                targets: vec![
                    StreamTarget {
                        volume: va,
                        path_prefix: "a/".into(),
                        mokuro_path: Some("a.mokuro".into()),
                    },
                    StreamTarget { volume: vb, path_prefix: "b/".into(), mokuro_path: None },
                ],
            },
            tx,
        )
        .await
        .unwrap();
        match reply {
            WorkReply::Extracted(groups) => {
                assert_eq!(groups[0].1.len(), 2);
                assert_eq!(groups[1].1.len(), 1);
            }
            _ => panic!("expected extraction groups"),
        }
    }
}
