//! The catalog reconciler.
//!
//! A pure function from local volumes plus per-provider remote listings to a
//! single derived view: real locals, fabricated placeholders for
//! remote-only archives, and OCR-upgrade candidates for local image-only
//! volumes whose sidecar exists remotely. Nothing here touches storage or
//! the network, and the returned rows never alias stored ones.

use std::collections::{BTreeSet, HashMap};

use hondana_core::{SeriesUuid, VolumeUuid, natsort, rpath, series_tag};

use crate::{
    model::{CloudShadow, ProviderId, RemoteFile, VolumeRecord},
    remote::cache::Listing,
};

/// Remote files partitioned by role.
#[derive(Debug, Default)]
struct Partitioned<'a> {
    archives: Vec<&'a RemoteFile>,
    /// stem key -> OCR sidecar
    ocr: HashMap<String, &'a RemoteFile>,
    /// stem key -> thumbnail sidecar
    thumbnails: HashMap<String, &'a RemoteFile>,
}

fn partition(listing: &Listing) -> Partitioned<'_> {
    let mut out = Partitioned::default();
    for file in listing.iter() {
        let name = file.path.file_name();
        if name.ends_with(".mokuro") || name.ends_with(".mokuro.gz") {
            out.ocr.insert(file.path.stem_key(), file);
        } else if rpath::ext(name) == "cbz" {
            out.archives.push(file);
        } else if rpath::ext(name) == "webp" {
            out.thumbnails.insert(file.path.stem_key(), file);
        }
        // everything else is not part of the volume layout
    }
    out
}

/// An image-only local volume whose OCR sidecar is available remotely.
#[derive(Debug, Clone)]
pub struct UpgradeCandidate {
    pub volume_uuid: VolumeUuid,
    pub provider: ProviderId,
    pub sidecar: RemoteFile,
}

#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Real locals plus fabricated placeholders.
    pub volumes: Vec<VolumeRecord>,
    pub upgrades: Vec<UpgradeCandidate>,
}

/// Merges locals with remote listings.
pub fn reconcile(
    locals: &[VolumeRecord],
    remote: &HashMap<ProviderId, std::sync::Arc<Listing>>,
) -> Reconciliation {
    // index locals by normalized "series/volume.cbz" path
    let mut by_path: HashMap<String, &VolumeRecord> = HashMap::new();
    // image-only locals by (series, volume) title for the fallback match;
    // None marks an ambiguous (multi-candidate) key
    let mut image_only_by_title: HashMap<(String, String), Option<&VolumeRecord>> =
        HashMap::new();
    let mut known_uuids: BTreeSet<VolumeUuid> = BTreeSet::new();

    for local in locals {
        known_uuids.insert(local.volume_uuid);
        by_path.insert(local_path_key(local), local);
        if local.is_image_only() && !local.is_placeholder() {
            let key = (
                rpath::norm(&local.series_title),
                rpath::norm(&local.volume_title),
            );
            image_only_by_title
                .entry(key)
                .and_modify(|slot| *slot = None)
                .or_insert(Some(local));
        }
    }

    let mut out = Reconciliation {
        volumes: locals
            .iter()
            .filter(|local| !local.is_placeholder())
            .cloned()
            .collect(),
        upgrades: Vec::new(),
    };

    let mut providers: Vec<&ProviderId> = remote.keys().collect();
    providers.sort();

    for provider in providers {
        let listing = &remote[provider];
        let parts = partition(listing);

        for archive in parts.archives {
            let stem_key = archive.path.stem_key();

            let matched_local = match by_path.get(&rpath::norm(archive.path.as_str())) {
                Some(local) => Some(*local),
                None => {
                    // fallback: unique image-only local with the same series
                    // and volume titles; ambiguity is never guessed
                    let (series, volume) = placeholder_titles(archive);
                    image_only_by_title
                        .get(&(rpath::norm(&series), rpath::norm(&volume)))
                        .copied()
                        .flatten()
                }
            };

            match matched_local {
                Some(local) => {
                    if local.is_image_only()
                        && !local.is_placeholder()
                        && let Some(sidecar) = parts.ocr.get(&stem_key)
                    {
                        out.upgrades.push(UpgradeCandidate {
                            volume_uuid: local.volume_uuid,
                            provider: provider.clone(),
                            sidecar: (*sidecar).clone(),
                        });
                    }
                }
                None => {
                    let placeholder = fabricate_placeholder(
                        archive,
                        parts.thumbnails.get(&stem_key).copied(),
                    );
                    // identity is deterministic, so a remote archive that
                    // mirrors an existing volume (or another provider's
                    // copy) resolves to the same uuid and is not duplicated
                    if known_uuids.insert(placeholder.volume_uuid) {
                        out.volumes.push(placeholder);
                    }
                }
            }
        }
    }

    out
}

fn local_path_key(local: &VolumeRecord) -> String {
    match local.cloud.as_ref().and_then(|c| c.path.as_ref()) {
        Some(path) => path.norm(),
        None => rpath::norm(&format!(
            "{}/{}.cbz",
            local.series_title, local.volume_title
        )),
    }
}

/// Series and volume titles for a remote archive: the folder name and the
/// file stem, unless the description carries a `Series:` override.
fn placeholder_titles(archive: &RemoteFile) -> (String, String) {
    let volume = archive.path.stem().to_string();
    let folder_series = archive
        .path
        .series()
        .unwrap_or_else(|| archive.path.stem())
        .to_string();
    let series = archive
        .description
        .as_deref()
        .and_then(series_tag::parse)
        .map_or(folder_series, str::to_string);
    (series, volume)
}

/// A placeholder has the same row shape as a volume, zero counts, no OCR or
/// files, and is never written to disk.
fn fabricate_placeholder(archive: &RemoteFile, thumbnail: Option<&RemoteFile>) -> VolumeRecord {
    let (series_title, volume_title) = placeholder_titles(archive);
    VolumeRecord {
        volume_uuid: VolumeUuid::derive(&series_title, &volume_title),
        series_uuid: SeriesUuid::derive(&series_title),
        series_title,
        volume_title,
        mokuro_version: String::new(),
        page_count: 0,
        character_count: 0,
        page_char_counts: vec![],
        thumbnail_width: None,
        thumbnail_height: None,
        missing_page_paths: BTreeSet::new(),
        cloud: Some(CloudShadow {
            is_placeholder: true,
            provider: Some(archive.provider.clone()),
            file_id: Some(archive.file_id.clone()),
            modified: Some(archive.modified),
            size: Some(archive.size),
            path: Some(archive.path.clone()),
            thumbnail_file_id: thumbnail.map(|t| t.file_id.clone()),
            library_id: None,
        }),
    }
}

/// One series of the derived catalog.
#[derive(Debug, Clone)]
pub struct SeriesGroup {
    pub series_uuid: SeriesUuid,
    pub series_title: String,
    pub volumes: Vec<VolumeRecord>,
}

/// Groups volumes into the derived catalog. Grouping is case-insensitive
/// on the series title; the canonical title (and its series uuid) comes
/// from the first real local in the group, or from the placeholder when
/// the series only exists remotely. Volumes and series sort naturally.
pub fn catalog(volumes: Vec<VolumeRecord>) -> Vec<SeriesGroup> {
    let mut groups: HashMap<String, SeriesGroup> = HashMap::new();
    for volume in volumes {
        let key = rpath::norm(&volume.series_title);
        let group = groups.entry(key).or_insert_with(|| SeriesGroup {
            series_uuid: volume.series_uuid,
            series_title: volume.series_title.clone(),
            volumes: Vec::new(),
        });
        // a real local's casing wins over a placeholder-derived title
        if group.volumes.iter().all(VolumeRecord::is_placeholder) && !volume.is_placeholder() {
            group.series_title = volume.series_title.clone();
            group.series_uuid = volume.series_uuid;
        }
        group.volumes.push(volume);
    }

    let mut out: Vec<SeriesGroup> = groups.into_values().collect();
    for group in &mut out {
        natsort::sort_by_name(&mut group.volumes, |v| v.volume_title.as_str());
    }
    natsort::sort_by_name(&mut out, |g| g.series_title.as_str());
    out
}
