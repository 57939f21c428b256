//! Canonicalisation: decompressed entries become a canonical volume bundle,
//! which is written to the database all-or-nothing.

use std::collections::BTreeSet;

use bytes::Bytes;
use culprit::ResultExt;
use hondana_core::{SeriesUuid, VolumeUuid, mokuro::MokuroData, natsort, rpath};
use tracing::{debug, warn};

use crate::{
    ingest::{
        archive::{self, ArchiveErr, Entry},
        classify::{self, EntryKind},
        cover::{self, CoverErr, EncodedImage},
    },
    local::storage::{Storage, StorageErr},
    model::{CloudShadow, OcrDocument, VolumeRecord},
};

pub type Result<T> = culprit::Result<T, IngestErr>;

#[derive(Debug, thiserror::Error)]
pub enum IngestErr {
    #[error(transparent)]
    Archive(#[from] ArchiveErr),

    #[error("malformed OCR sidecar: {0}")]
    SidecarJson(serde_json::Error),

    #[error("archive has no pages and no OCR sidecar")]
    EmptyArchive,

    #[error("volume {0} not found")]
    VolumeNotFound(VolumeUuid),

    #[error(transparent)]
    Storage(#[from] StorageErr),

    #[error(transparent)]
    Cover(#[from] CoverErr),
}

/// Maximum archive-in-archive recursion.
pub const MAX_NESTING_DEPTH: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Canonical series title override (from a remote `Series:` description
    /// tag). Only beats the folder-derived title; a sidecar's declared title
    /// is always authoritative.
    pub series_override: Option<String>,

    /// Cloud-backing attributes to stamp on the stored record, for volumes
    /// arriving through the download queue.
    pub cloud: Option<CloudShadow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Created(VolumeUuid),
    Upgraded(VolumeUuid),
    Unchanged(VolumeUuid),
}

impl IngestOutcome {
    pub fn uuid(&self) -> VolumeUuid {
        match self {
            IngestOutcome::Created(uuid)
            | IngestOutcome::Upgraded(uuid)
            | IngestOutcome::Unchanged(uuid) => *uuid,
        }
    }
}

/// Per-volume result of a batch ingest. One volume failing never aborts its
/// siblings.
#[derive(Debug)]
pub struct IngestReport {
    pub source: String,
    pub result: Result<IngestOutcome>,
}

/// The canonical in-memory volume produced by classification, before it is
/// committed to storage.
pub struct VolumeBundle {
    pub record: VolumeRecord,
    pub ocr: Option<OcrDocument>,
    /// Pages in canonical order, placeholders included.
    pub pages: Vec<(String, Bytes)>,
    pub thumbnail: Option<EncodedImage>,
}

/// Ingests one archive (and any archives nested inside it), writing each
/// resulting volume independently.
pub fn ingest_archive(
    storage: &Storage,
    base_path: &str,
    data: &[u8],
    opts: &IngestOptions,
) -> Vec<IngestReport> {
    let mut reports = Vec::new();
    ingest_archive_at(storage, base_path, data, opts, 0, &mut reports);
    reports
}

fn ingest_archive_at(
    storage: &Storage,
    base_path: &str,
    data: &[u8],
    opts: &IngestOptions,
    depth: usize,
    reports: &mut Vec<IngestReport>,
) {
    if depth > MAX_NESTING_DEPTH {
        reports.push(IngestReport {
            source: base_path.to_string(),
            result: Err(ArchiveErr::NestingTooDeep(MAX_NESTING_DEPTH).into()),
        });
        return;
    }

    let ext = rpath::ext(rpath::base_name(base_path));
    if !archive::is_supported(&ext) {
        reports.push(IngestReport {
            source: base_path.to_string(),
            result: Err(ArchiveErr::Unsupported(ext).into()),
        });
        return;
    }

    let entries = match archive::unpack(data) {
        Ok(entries) => entries,
        Err(err) => {
            reports.push(IngestReport {
                source: base_path.to_string(),
                result: Err(err.into()),
            });
            return;
        }
    };

    ingest_entries_at(storage, base_path, entries, opts, depth, reports);
}

/// Ingests an already-decompressed entry set, e.g. merged worker output.
pub fn ingest_entries(
    storage: &Storage,
    base_path: &str,
    entries: Vec<Entry>,
    opts: &IngestOptions,
) -> Vec<IngestReport> {
    let mut reports = Vec::new();
    ingest_entries_at(storage, base_path, entries, opts, 0, &mut reports);
    reports
}

fn ingest_entries_at(
    storage: &Storage,
    base_path: &str,
    entries: Vec<Entry>,
    opts: &IngestOptions,
    depth: usize,
    reports: &mut Vec<IngestReport>,
) {
    let archive_stem = rpath::stem(rpath::base_name(base_path));
    let parent_dir = base_path.rsplit_once('/').map(|(dir, _)| dir);

    let mut own = Vec::new();
    let mut nested = Vec::new();
    for entry in entries {
        match classify::classify(&entry.path, archive_stem) {
            EntryKind::System => {}
            EntryKind::NestedArchive => nested.push(entry),
            _ => own.push(entry),
        }
    }

    let had_nested = !nested.is_empty();
    for inner in nested {
        let inner_path = match parent_dir {
            Some(dir) => format!("{dir}/{}", inner.path),
            None => inner.path.clone(),
        };
        ingest_archive_at(storage, &inner_path, &inner.data, opts, depth + 1, reports);
    }

    let has_content = own
        .iter()
        .any(|e| !matches!(classify::classify(&e.path, archive_stem), EntryKind::Other));
    if !has_content {
        // no pages and no sidecar: that is only an error when there was also
        // no nested archive carrying the real content
        if !had_nested {
            reports.push(IngestReport {
                source: base_path.to_string(),
                result: Err(IngestErr::EmptyArchive.into()),
            });
        }
        return;
    }

    let result = build_bundle(own, base_path, opts)
        .and_then(|bundle| commit_bundle(storage, bundle));
    reports.push(IngestReport { source: base_path.to_string(), result });
}

/// Classifies entries and produces the canonical bundle for one volume.
pub fn build_bundle(entries: Vec<Entry>, base_path: &str, opts: &IngestOptions) -> Result<VolumeBundle> {
    let archive_stem = rpath::stem(rpath::base_name(base_path));

    let mut pages: Vec<(String, Bytes)> = Vec::new();
    let mut sidecar: Option<MokuroData> = None;
    let mut thumbnail_bytes: Option<Bytes> = None;

    for entry in entries {
        match classify::classify(&entry.path, archive_stem) {
            EntryKind::System | EntryKind::NestedArchive | EntryKind::Other => {}
            EntryKind::Page => pages.push((entry.path, entry.data)),
            EntryKind::Thumbnail => {
                if thumbnail_bytes.is_none() {
                    thumbnail_bytes = Some(entry.data);
                }
            }
            EntryKind::OcrSidecar => {
                if sidecar.is_none() {
                    sidecar = Some(parse_sidecar(&entry.data)?);
                }
            }
            EntryKind::OcrSidecarGz => {
                if sidecar.is_none() {
                    let inflated = archive::gunzip(&entry.data)?;
                    sidecar = Some(parse_sidecar(&inflated)?);
                }
            }
        }
    }

    if pages.is_empty() && sidecar.is_none() {
        return Err(IngestErr::EmptyArchive.into());
    }

    natsort::sort_by_name(&mut pages, |(path, _)| path.as_str());

    let mut missing_page_paths = BTreeSet::new();

    let (record, ocr, pages) = match sidecar {
        Some(mokuro) => {
            // the sidecar's declared identity and page order are
            // authoritative; the stored page set is the union of referenced
            // pages and any extra images found
            let mut by_path: Vec<(String, Bytes)> = pages;
            let mut ordered: Vec<(String, Bytes)> = Vec::with_capacity(mokuro.pages.len());
            for page in &mokuro.pages {
                match by_path.iter().position(|(path, _)| {
                    path == &page.img_path
                        || rpath::base_name(path) == rpath::base_name(&page.img_path)
                }) {
                    Some(at) => ordered.push(by_path.remove(at)),
                    None => {
                        debug!(path = %page.img_path, "fabricating placeholder for missing page");
                        missing_page_paths.insert(page.img_path.clone());
                        ordered.push((page.img_path.clone(), cover::placeholder_png()));
                    }
                }
            }
            // extras keep their natural order after the declared pages
            ordered.extend(by_path);

            let version = if mokuro.version.is_empty() {
                "unknown".to_string()
            } else {
                mokuro.version.clone()
            };

            let record = VolumeRecord {
                volume_uuid: VolumeUuid::from_uuid(mokuro.volume_uuid),
                series_uuid: SeriesUuid::from_uuid(mokuro.title_uuid),
                series_title: mokuro.title.clone(),
                volume_title: mokuro.volume.clone(),
                mokuro_version: version,
                page_count: mokuro.pages.len() as u32,
                character_count: mokuro.character_count(),
                page_char_counts: mokuro.page_char_counts(),
                thumbnail_width: None,
                thumbnail_height: None,
                missing_page_paths: missing_page_paths.clone(),
                cloud: opts.cloud.clone(),
            };
            let ocr = OcrDocument { pages: mokuro.pages, ..Default::default() };
            (record, Some(ocr), ordered)
        }
        None => {
            // image-only: titles derive from the archive path
            let volume_title = archive_stem.to_string();
            let series_title = opts
                .series_override
                .clone()
                .or_else(|| rpath::first_segment(base_path).map(str::to_string))
                .unwrap_or_else(|| volume_title.clone());

            let record = VolumeRecord {
                volume_uuid: VolumeUuid::derive(&series_title, &volume_title),
                series_uuid: SeriesUuid::derive(&series_title),
                series_title,
                volume_title,
                mokuro_version: String::new(),
                page_count: pages.len() as u32,
                character_count: 0,
                page_char_counts: vec![],
                thumbnail_width: None,
                thumbnail_height: None,
                missing_page_paths: BTreeSet::new(),
                cloud: opts.cloud.clone(),
            };
            (record, None, pages)
        }
    };

    let mut record = record;
    let thumbnail = match thumbnail_bytes {
        Some(bytes) => {
            let (width, height) = cover::probe_dimensions(&bytes).unwrap_or((0, 0));
            Some(EncodedImage { data: bytes, width, height })
        }
        None => cover::select_cover_page(&pages, &record.missing_page_paths)
            .map(|(_, data)| cover::generate_cover(data))
            .transpose()?,
    };
    if let Some(thumb) = &thumbnail {
        record.thumbnail_width = Some(thumb.width);
        record.thumbnail_height = Some(thumb.height);
    }

    Ok(VolumeBundle { record, ocr, pages, thumbnail })
}

fn parse_sidecar(data: &[u8]) -> Result<MokuroData> {
    Ok(serde_json::from_slice(data).map_err(IngestErr::SidecarJson)?)
}

/// Writes a bundle to storage.
///
/// Dedup: an existing OCR-bearing row makes this a no-op; an existing
/// image-only row takes an in-place upgrade when the bundle carries OCR
/// (files and reading stats are kept); otherwise the volume is written
/// fresh. A fresh write that fails part-way deletes everything it wrote.
pub fn commit_bundle(storage: &Storage, bundle: VolumeBundle) -> Result<IngestOutcome> {
    let uuid = bundle.record.volume_uuid;

    match storage.volume(&uuid).or_into_ctx()? {
        Some(existing) => {
            if !existing.is_image_only() || bundle.ocr.is_none() {
                debug!(%uuid, "volume already present, skipping");
                return Ok(IngestOutcome::Unchanged(uuid));
            }
            upgrade_volume(storage, existing, &bundle).or_into_ctx()?;
            Ok(IngestOutcome::Upgraded(uuid))
        }
        None => {
            let result: culprit::Result<(), StorageErr> = (|| {
                storage.write_files(&uuid, bundle.pages.iter().cloned())?;
                if let Some(thumb) = &bundle.thumbnail {
                    storage.set_thumbnail(&uuid, &thumb.data)?;
                }
                if let Some(ocr) = &bundle.ocr {
                    storage.upsert_ocr(&uuid, ocr)?;
                }
                storage.upsert_volume(&bundle.record)?;
                Ok(())
            })();

            if let Err(err) = result {
                // all-or-nothing: tear out whatever part landed
                if let Err(cleanup) = storage.remove_volume(&uuid) {
                    warn!(%uuid, ?cleanup, "rollback after failed ingest also failed");
                }
                return Err(err.map_ctx(IngestErr::from));
            }
            Ok(IngestOutcome::Created(uuid))
        }
    }
}

/// In-place OCR upgrade of an image-only volume: metadata and OCR are
/// replaced, existing page files and reading stats are kept.
fn upgrade_volume(
    storage: &Storage,
    existing: VolumeRecord,
    bundle: &VolumeBundle,
) -> culprit::Result<(), StorageErr> {
    let ocr = bundle
        .ocr
        .as_ref()
        .expect("BUG: upgrade_volume called without OCR");

    storage.upsert_ocr(&existing.volume_uuid, ocr)?;

    let mut record = existing;
    record.mokuro_version = bundle.record.mokuro_version.clone();
    record.page_count = bundle.record.page_count;
    record.character_count = bundle.record.character_count;
    record.page_char_counts = bundle.record.page_char_counts.clone();
    storage.upsert_volume(&record)
}

/// Rebuilds a mokuro sidecar document from a stored volume, for backups and
/// exports.
pub fn sidecar_for(record: &VolumeRecord, ocr: &OcrDocument) -> MokuroData {
    MokuroData {
        version: record.mokuro_version.clone(),
        title: record.series_title.clone(),
        title_uuid: record.series_uuid.uuid(),
        volume: record.volume_title.clone(),
        volume_uuid: record.volume_uuid.uuid(),
        pages: ocr.pages.clone(),
        chars: record.character_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::archive::testutil::{gzip_bytes, zip_bytes};
    use assert_matches::assert_matches;

    fn jpeg(w: u32, h: u32) -> Vec<u8> {
        use image::{ImageFormat, Rgba, RgbaImage};
        let img = RgbaImage::from_pixel(w, h, Rgba([120, 130, 140, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .to_rgb8()
            .write_to(&mut out, ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }

    fn sidecar_json(series: &str, volume: &str, paths: &[&str]) -> Vec<u8> {
        let pages: Vec<serde_json::Value> = paths
            .iter()
            .map(|p| {
                serde_json::json!({
                    "img_path": p,
                    "img_width": 800,
                    "img_height": 1200,
                    "blocks": [{
                        "box": [0, 0, 10, 10],
                        "vertical": true,
                        "font_size": 20,
                        "lines": ["あい"]
                    }]
                })
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "version": "0.2.1",
            "title": series,
            "title_uuid": SeriesUuid::derive(series).uuid(),
            "volume": volume,
            "volume_uuid": VolumeUuid::derive(series, volume).uuid(),
            "pages": pages,
            "chars": 0,
        }))
        .unwrap()
    }

    fn ingest_one(storage: &Storage, path: &str, data: &[u8]) -> IngestOutcome {
        let mut reports = ingest_archive(storage, path, data, &IngestOptions::default());
        assert_eq!(reports.len(), 1, "{reports:?}");
        reports.remove(0).result.unwrap()
    }

    #[test]
    fn test_fresh_ingest_with_sidecar() {
        let storage = Storage::open_temporary().unwrap();
        let page = jpeg(64, 96);
        let paths: Vec<String> = (1..=20).map(|i| format!("{i:02}.jpg")).collect();
        let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();

        let mut entries: Vec<(&str, &[u8])> = paths
            .iter()
            .map(|p| (p.as_str(), page.as_slice()))
            .collect();
        let sidecar = sidecar_json("One_Piece", "Volume_01", &path_refs);
        entries.push(("Volume_01.mokuro", &sidecar));

        let archive = zip_bytes(&entries);
        let outcome = ingest_one(&storage, "One_Piece/Volume_01.cbz", &archive);
        let uuid = outcome.uuid();
        assert_matches!(outcome, IngestOutcome::Created(_));

        let record = storage.volume(&uuid).unwrap().unwrap();
        assert_eq!(record.mokuro_version, "0.2.1");
        assert_eq!(record.page_count, 20);
        assert_eq!(record.character_count, 40);
        assert_eq!(record.page_char_counts.len(), 20);
        assert!(record.missing_page_paths.is_empty());
        assert_eq!(storage.file_paths(&uuid).unwrap().len(), 20);
        assert!(storage.thumbnail(&uuid).unwrap().is_some());

        let ocr = storage.ocr(&uuid).unwrap().unwrap();
        assert_eq!(ocr.pages.len() as u32, record.page_count);
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let storage = Storage::open_temporary().unwrap();
        let page = jpeg(32, 32);
        let archive = zip_bytes(&[("01.jpg", page.as_slice())]);

        let first = ingest_one(&storage, "Series/Vol 1.cbz", &archive);
        assert_matches!(first, IngestOutcome::Created(_));
        let second = ingest_one(&storage, "Series/Vol 1.cbz", &archive);
        assert_matches!(second, IngestOutcome::Unchanged(_));
        assert_eq!(storage.volumes().unwrap().len(), 1);
        assert_eq!(storage.file_paths(&first.uuid()).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_pages_get_placeholders() {
        let storage = Storage::open_temporary().unwrap();
        let page = jpeg(32, 32);
        let sidecar = sidecar_json("S", "V", &["01.jpg", "02.jpg", "03.jpg"]);
        // 03.jpg is referenced but absent
        let archive = zip_bytes(&[
            ("01.jpg", page.as_slice()),
            ("02.jpg", page.as_slice()),
            ("V.mokuro", &sidecar),
        ]);

        let outcome = ingest_one(&storage, "S/V.cbz", &archive);
        let record = storage.volume(&outcome.uuid()).unwrap().unwrap();
        assert_eq!(
            record.missing_page_paths,
            BTreeSet::from(["03.jpg".to_string()])
        );
        assert_eq!(record.page_count, 3);

        let placeholder = storage.file(&outcome.uuid(), "03.jpg").unwrap().unwrap();
        assert_eq!(placeholder, cover::placeholder_png());

        // cover came from 01.jpg, not the placeholder
        let thumb = storage.thumbnail(&outcome.uuid()).unwrap().unwrap();
        assert!(!thumb.starts_with(b"\x89PNG"));
    }

    #[test]
    fn test_image_only_then_upgrade() {
        let storage = Storage::open_temporary().unwrap();
        let page = jpeg(32, 32);
        let plain = zip_bytes(&[("01.jpg", page.as_slice()), ("02.jpg", page.as_slice())]);

        let first = ingest_one(&storage, "One_Piece/Volume_02.cbz", &plain);
        let record = storage.volume(&first.uuid()).unwrap().unwrap();
        assert!(record.is_image_only());
        assert_eq!(record.character_count, 0);

        // reading stats accumulate before the upgrade
        let mut stats = crate::model::VolumeStats::default();
        stats.record_turn(1000, 2, 9);
        storage.put_stats(&first.uuid(), &stats).unwrap();

        // the sidecar arrives later (e.g. fetched from a remote)
        let sidecar = sidecar_json("One_Piece", "Volume_02", &["01.jpg", "02.jpg"]);
        let upgrade = zip_bytes(&[("Volume_02.mokuro", sidecar.as_slice())]);
        let second = ingest_one(&storage, "One_Piece/Volume_02.cbz", &upgrade);
        assert_matches!(second, IngestOutcome::Upgraded(_));
        assert_eq!(second.uuid(), first.uuid());

        let record = storage.volume(&first.uuid()).unwrap().unwrap();
        assert!(!record.is_image_only());
        assert_eq!(record.character_count, 4);
        // files and stats survived
        assert_eq!(storage.file_paths(&first.uuid()).unwrap().len(), 2);
        assert_eq!(storage.stats(&first.uuid()).unwrap().unwrap().chars_read, 9);

        // re-applying the same sidecar is a no-op
        let third = ingest_one(&storage, "One_Piece/Volume_02.cbz", &upgrade);
        assert_matches!(third, IngestOutcome::Unchanged(_));
    }

    #[test]
    fn test_gzipped_sidecar() {
        let storage = Storage::open_temporary().unwrap();
        let page = jpeg(32, 32);
        let sidecar = gzip_bytes(&sidecar_json("S", "V", &["01.jpg"]));
        let archive = zip_bytes(&[("01.jpg", page.as_slice()), ("V.mokuro.gz", &sidecar)]);

        let outcome = ingest_one(&storage, "S/V.cbz", &archive);
        let record = storage.volume(&outcome.uuid()).unwrap().unwrap();
        assert_eq!(record.mokuro_version, "0.2.1");
    }

    #[test]
    fn test_nested_archives_produce_own_volumes() {
        let storage = Storage::open_temporary().unwrap();
        let page = jpeg(32, 32);
        let inner_a = zip_bytes(&[("01.jpg", page.as_slice())]);
        let inner_b = zip_bytes(&[("01.jpg", page.as_slice())]);
        let outer = zip_bytes(&[
            ("Vol 1.cbz", inner_a.as_slice()),
            ("Vol 2.cbz", inner_b.as_slice()),
        ]);

        let reports = ingest_archive(
            &storage,
            "Series/bundle.zip",
            &outer,
            &IngestOptions::default(),
        );
        let ok = reports.iter().filter(|r| r.result.is_ok()).count();
        assert_eq!(ok, 2, "{reports:?}");
        assert_eq!(storage.volumes().unwrap().len(), 2);
    }

    #[test]
    fn test_series_override_applies_to_image_only() {
        let storage = Storage::open_temporary().unwrap();
        let page = jpeg(32, 32);
        let archive = zip_bytes(&[("01.jpg", page.as_slice())]);
        let opts = IngestOptions {
            series_override: Some("Modern Title".to_string()),
            ..Default::default()
        };
        let mut reports = ingest_archive(&storage, "古い漢字/Vol1.cbz", &archive, &opts);
        let outcome = reports.remove(0).result.unwrap();
        let record = storage.volume(&outcome.uuid()).unwrap().unwrap();
        assert_eq!(record.series_title, "Modern Title");
        assert_eq!(record.series_uuid, SeriesUuid::derive("Modern Title"));
    }

    #[test]
    fn test_empty_archive_fails_cleanly() {
        let storage = Storage::open_temporary().unwrap();
        let archive = zip_bytes(&[("notes.txt", b"hi".as_slice())]);
        let reports = ingest_archive(
            &storage,
            "Series/empty.cbz",
            &archive,
            &IngestOptions::default(),
        );
        assert_eq!(reports.len(), 1);
        assert!(reports[0].result.is_err());
        assert!(storage.volumes().unwrap().is_empty());
    }

    #[test]
    fn test_unsupported_format_fails_only_itself() {
        let storage = Storage::open_temporary().unwrap();
        let reports = ingest_archive(
            &storage,
            "Series/solid.rar",
            b"whatever",
            &IngestOptions::default(),
        );
        assert_matches!(
            reports[0].result.as_ref().unwrap_err().ctx(),
            IngestErr::Archive(ArchiveErr::Unsupported(_))
        );
    }
}
